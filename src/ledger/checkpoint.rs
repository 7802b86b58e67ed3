//! Checkpoint records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable snapshot taken at a recovery point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// Task id, agent id, or message id.
    pub subject_id: String,
    /// Strictly increasing per subject, never reused.
    pub sequence: u64,
    pub state_snapshot: Value,
    pub context: Value,
    pub recovery_point: String,
    pub metadata: Value,
    pub created_at: i64,
}

impl Checkpoint {
    pub fn to_ref(&self) -> CheckpointRef {
        CheckpointRef {
            id: self.id.clone(),
            subject_id: self.subject_id.clone(),
            sequence: self.sequence,
            recovery_point: self.recovery_point.clone(),
            created_at: self.created_at,
        }
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub id: String,
    pub subject_id: String,
    pub sequence: u64,
    pub recovery_point: String,
    pub created_at: i64,
}
