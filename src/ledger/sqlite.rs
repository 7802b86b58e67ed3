//! SQLite-backed checkpoint ledger.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::checkpoint::{Checkpoint, CheckpointRef};
use crate::error::{Error, Result};
use crate::protocol::{generate_id, now_ms};

/// Append-only record of state transitions, errors and recovery points.
///
/// Rows are inserted and deleted by retention policy, never updated.
#[derive(Debug)]
pub struct Ledger {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

fn sqlite_err(context: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::Ledger(format!("sqlite {}: {}", context, e))
}

impl Ledger {
    /// Open (or create) a durable ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sqlite_err("open"))?;
        init_schema(&conn)?;
        tracing::debug!(path = %path.display(), "Opened checkpoint ledger");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Volatile ledger for tests and embedded use.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err("open"))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_checkpoint(
        &self,
        subject_id: &str,
        state_snapshot: Value,
        context: Value,
        recovery_point: &str,
        metadata: Value,
    ) -> Result<String> {
        if subject_id.is_empty() {
            return Err(Error::validation("checkpoint subject id is empty"));
        }

        let id = generate_id();
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sqlite_err("begin"))?;

        let (sequence, created_at): (i64, i64) = tx
            .query_row(
                "INSERT INTO checkpoint_subjects (subject_id, last_seq, last_created_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(subject_id) DO UPDATE SET
                    last_seq = last_seq + 1,
                    last_created_at = MAX(last_created_at, excluded.last_created_at)
                 RETURNING last_seq, last_created_at",
                params![subject_id, now_ms()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(sqlite_err("advance sequence"))?;

        tx.execute(
            "INSERT INTO checkpoints (id, subject_id, seq, created_at, recovery_point, state_snapshot, context, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                subject_id,
                sequence,
                created_at,
                recovery_point,
                state_snapshot.to_string(),
                context.to_string(),
                metadata.to_string()
            ],
        )
        .map_err(sqlite_err("insert checkpoint"))?;

        tx.commit().map_err(sqlite_err("commit"))?;

        tracing::trace!(subject_id, sequence, recovery_point, "Checkpoint written");
        Ok(id)
    }

    /// Checkpoints for one subject in sequence order, or all in creation order.
    pub fn list_checkpoints(&self, subject_id: Option<&str>) -> Result<Vec<CheckpointRef>> {
        let conn = self.lock();
        let refs = match subject_id {
            Some(subject) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, subject_id, seq, recovery_point, created_at FROM checkpoints
                         WHERE subject_id = ?1 ORDER BY seq",
                    )
                    .map_err(sqlite_err("prepare list"))?;
                let rows = stmt
                    .query_map(params![subject], row_to_ref)
                    .map_err(sqlite_err("list checkpoints"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, subject_id, seq, recovery_point, created_at FROM checkpoints
                         ORDER BY created_at, subject_id, seq",
                    )
                    .map_err(sqlite_err("prepare list"))?;
                let rows = stmt
                    .query_map([], row_to_ref)
                    .map_err(sqlite_err("list checkpoints"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
        };
        refs.map_err(sqlite_err("read checkpoint"))
    }

    /// Full snapshot for re-application by the caller.
    pub fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, subject_id, seq, created_at, recovery_point, state_snapshot, context, metadata
             FROM checkpoints WHERE id = ?1",
            params![checkpoint_id],
            row_to_checkpoint,
        )
        .optional()
        .map_err(sqlite_err("restore checkpoint"))?
        .ok_or_else(|| Error::NotFound(format!("checkpoint {}", checkpoint_id)))
    }

    /// Most recent checkpoint for a subject.
    pub fn latest(&self, subject_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, subject_id, seq, created_at, recovery_point, state_snapshot, context, metadata
             FROM checkpoints WHERE subject_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![subject_id],
            row_to_checkpoint,
        )
        .optional()
        .map_err(sqlite_err("latest checkpoint"))
    }

    pub fn count(&self, subject_id: Option<&str>) -> Result<usize> {
        let conn = self.lock();
        let count = match subject_id {
            Some(subject) => conn.query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE subject_id = ?1",
                params![subject],
                |row| row.get::<_, i64>(0),
            ),
            None => conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |row| {
                row.get::<_, i64>(0)
            }),
        };
        let count = count.map_err(sqlite_err("count checkpoints"))?;
        Ok(count as usize)
    }

    /// Delete checkpoints created more than `max_age` ago.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = now_ms() - max_age.as_millis() as i64;
        let conn = self.lock();
        let deleted = conn
            .execute("DELETE FROM checkpoints WHERE created_at < ?1", params![cutoff])
            .map_err(sqlite_err("cleanup checkpoints"))?;
        if deleted > 0 {
            tracing::info!(deleted, "Removed aged checkpoints");
        }
        Ok(deleted)
    }

    /// Keep only the newest `keep` checkpoints of every subject.
    pub fn prune(&self, keep: usize) -> Result<usize> {
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM checkpoints WHERE id IN (
                    SELECT c.id FROM checkpoints c
                    JOIN (SELECT subject_id, MAX(seq) AS max_seq FROM checkpoints GROUP BY subject_id) m
                      ON c.subject_id = m.subject_id
                    WHERE c.seq <= m.max_seq - ?1
                 )",
                params![keep as i64],
            )
            .map_err(sqlite_err("prune checkpoints"))?;
        if deleted > 0 {
            tracing::info!(deleted, keep, "Pruned superseded checkpoints");
        }
        Ok(deleted)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            recovery_point TEXT NOT NULL,
            state_snapshot TEXT NOT NULL,
            context TEXT NOT NULL,
            metadata TEXT NOT NULL,
            UNIQUE (subject_id, seq)
        );
        CREATE TABLE IF NOT EXISTS checkpoint_subjects (
            subject_id TEXT PRIMARY KEY,
            last_seq INTEGER NOT NULL,
            last_created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_subject ON checkpoints(subject_id, seq);
        CREATE INDEX IF NOT EXISTS idx_checkpoints_created ON checkpoints(created_at);
        "#,
    )
    .map_err(sqlite_err("init"))
}

fn json_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn row_to_ref(row: &Row<'_>) -> rusqlite::Result<CheckpointRef> {
    Ok(CheckpointRef {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as u64,
        recovery_point: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_checkpoint(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as u64,
        created_at: row.get(3)?,
        recovery_point: row.get(4)?,
        state_snapshot: json_column(row, 5)?,
        context: json_column(row, 6)?,
        metadata: json_column(row, 7)?,
    })
}
