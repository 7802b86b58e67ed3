//! Versioned artifact index over a blob store.

use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::protocol::{generate_id, now_ms, AgentId};

use super::blob::{BlobStore, FsBlobStore, MemoryBlobStore};

/// An output a handler wants stored.
///
/// Drafts sharing `(task_id, key)` are versions of the same artifact. The key
/// defaults to the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub task_id: String,
    pub agent_id: AgentId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(with = "crate::protocol::part::base64_bytes")]
    pub content: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Capabilities allowed to read. Empty means anyone.
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl ArtifactDraft {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<AgentId>,
        kind: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            kind: kind.into(),
            key: None,
            content: content.into(),
            mime_type: None,
            permissions: BTreeSet::new(),
        }
    }

    /// Draft with task and agent filled in later by the task manager.
    pub fn output(kind: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self::new(String::new(), String::new(), kind, content)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_permission(mut self, capability: impl Into<String>) -> Self {
        self.permissions.insert(capability.into());
        self
    }

    fn logical_key(&self) -> (String, String) {
        (
            self.task_id.clone(),
            self.key.clone().unwrap_or_else(|| self.kind.clone()),
        )
    }
}

/// Stored artifact metadata. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub task_id: String,
    pub agent_id: AgentId,
    pub kind: String,
    pub key: String,
    pub version: u32,
    pub content_ref: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub permissions: BTreeSet<String>,
    pub created_at: i64,
}

impl Artifact {
    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            id: self.id.clone(),
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            kind: self.kind.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub task_id: String,
    pub agent_id: AgentId,
    pub kind: String,
    pub version: u32,
}

/// Metadata plus content, returned only after the permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactContent {
    pub artifact: Artifact,
    pub content: Vec<u8>,
}

/// Identity and capabilities handed in by the caller's auth layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl Requester {
    pub fn new<I, S>(id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn can_read(&self, artifact: &Artifact) -> bool {
        artifact.permissions.is_empty()
            || artifact
                .permissions
                .iter()
                .any(|p| self.capabilities.contains(p))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactFilter {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

impl ArtifactFilter {
    fn matches(&self, artifact: &Artifact) -> bool {
        self.task_id.as_deref().map_or(true, |t| t == artifact.task_id)
            && self.agent_id.as_deref().map_or(true, |a| a == artifact.agent_id)
            && self.kind.as_deref().map_or(true, |k| k == artifact.kind)
    }
}

#[derive(Debug, Default)]
struct Index {
    /// Versions per artifact id, oldest first.
    versions: HashMap<String, Vec<Artifact>>,
    by_key: HashMap<(String, String), String>,
    /// Artifact ids in first-stored order.
    order: Vec<String>,
}

impl Index {
    fn insert(&mut self, artifact: Artifact) {
        let logical = (artifact.task_id.clone(), artifact.key.clone());
        self.by_key.entry(logical).or_insert_with(|| artifact.id.clone());
        let versions = self.versions.entry(artifact.id.clone()).or_default();
        if versions.is_empty() {
            self.order.push(artifact.id.clone());
        }
        versions.push(artifact);
        versions.sort_by_key(|a| a.version);
    }

    fn latest(&self, id: &str) -> Option<&Artifact> {
        self.versions.get(id).and_then(|v| v.last())
    }
}

/// Artifact store: immutable, versioned records over content-addressed blobs.
///
/// With a journal path every stored record is appended as one JSON line and
/// replayed on open.
pub struct ArtifactStore {
    blobs: Arc<dyn BlobStore>,
    index: RwLock<Index>,
    journal: Option<PathBuf>,
    /// Held across version assignment and the journal append.
    writer: AsyncMutex<()>,
}

impl ArtifactStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            index: RwLock::new(Index::default()),
            journal: None,
            writer: AsyncMutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()))
    }

    /// Filesystem-backed store under `dir` (`blobs/` and `index.jsonl`).
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let blobs = FsBlobStore::new(dir.join("blobs"))?;
        let journal = dir.join("index.jsonl");

        let mut index = Index::default();
        if journal.exists() {
            let reader = BufReader::new(std::fs::File::open(&journal)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Artifact>(&line) {
                    Ok(artifact) => index.insert(artifact),
                    Err(e) => {
                        tracing::warn!(line = lineno + 1, "Skipping corrupt artifact record: {}", e)
                    }
                }
            }
            tracing::debug!(artifacts = index.order.len(), "Replayed artifact index");
        }

        Ok(Self {
            blobs: Arc::new(blobs),
            index: RwLock::new(index),
            journal: Some(journal),
            writer: AsyncMutex::new(()),
        })
    }

    async fn append_journal(&self, artifact: &Artifact) -> Result<()> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(artifact)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn store(&self, draft: ArtifactDraft) -> Result<ArtifactRef> {
        if draft.task_id.is_empty() {
            return Err(Error::validation("artifact task_id is empty"));
        }
        if draft.kind.is_empty() {
            return Err(Error::validation("artifact kind is empty"));
        }

        let content_ref = self.blobs.put(&draft.content).await?;
        let logical = draft.logical_key();

        let _writer = self.writer.lock().await;
        let (id, version) = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            match index.by_key.get(&logical) {
                Some(id) => {
                    let next = index.latest(id).map_or(1, |a| a.version + 1);
                    (id.clone(), next)
                }
                None => (generate_id(), 1),
            }
        };

        let artifact = Artifact {
            id,
            task_id: draft.task_id,
            agent_id: draft.agent_id,
            kind: draft.kind,
            key: logical.1,
            version,
            content_ref,
            size: draft.content.len() as u64,
            mime_type: draft.mime_type,
            permissions: draft.permissions,
            created_at: now_ms(),
        };

        self.append_journal(&artifact).await?;
        let artifact_ref = artifact.to_ref();
        tracing::debug!(
            artifact_id = %artifact.id,
            task_id = %artifact.task_id,
            version,
            "Artifact stored"
        );
        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(artifact);
        Ok(artifact_ref)
    }

    /// Latest version's metadata. No permission check, no content.
    pub fn metadata(&self, artifact_id: &str) -> Result<Artifact> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index
            .latest(artifact_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("artifact {}", artifact_id)))
    }

    /// Latest version, with content.
    pub async fn get(&self, artifact_id: &str, requester: &Requester) -> Result<ArtifactContent> {
        let artifact = self.metadata(artifact_id)?;
        self.read_checked(artifact, requester).await
    }

    pub async fn get_version(
        &self,
        artifact_id: &str,
        version: u32,
        requester: &Requester,
    ) -> Result<ArtifactContent> {
        let artifact = {
            let index = self.index.read().unwrap_or_else(|e| e.into_inner());
            index
                .versions
                .get(artifact_id)
                .and_then(|v| v.iter().find(|a| a.version == version))
                .cloned()
                .ok_or_else(|| {
                    Error::NotFound(format!("artifact {} version {}", artifact_id, version))
                })?
        };
        self.read_checked(artifact, requester).await
    }

    async fn read_checked(
        &self,
        artifact: Artifact,
        requester: &Requester,
    ) -> Result<ArtifactContent> {
        if !requester.can_read(&artifact) {
            tracing::warn!(
                artifact_id = %artifact.id,
                requester = %requester.id,
                "Artifact read denied"
            );
            return Err(Error::Permission(format!(
                "{} may not read artifact {}",
                requester.id, artifact.id
            )));
        }
        let content = self.blobs.get(&artifact.content_ref).await?;
        Ok(ArtifactContent { artifact, content })
    }

    /// Latest version of every matching artifact, in first-stored order.
    pub fn list(&self, filter: &ArtifactFilter) -> Vec<ArtifactRef> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index
            .order
            .iter()
            .filter_map(|id| index.latest(id))
            .filter(|a| filter.matches(a))
            .map(Artifact::to_ref)
            .collect()
    }

    pub fn versions(&self, artifact_id: &str) -> Vec<ArtifactRef> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index
            .versions
            .get(artifact_id)
            .map(|v| v.iter().map(Artifact::to_ref).collect())
            .unwrap_or_default()
    }
}
