use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::account::{CategoryId, ConnectionId};

/// Durable position in a connection's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub connection_id: ConnectionId,
    pub cursor: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizationRule {
    /// Canonical merchant token, see [`crate::merchant::extract_pattern`].
    pub pattern: String,
    pub category_id: CategoryId,
}

/// Outcome of one `sync` call. This is the contract the UI layer consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub connection_id: ConnectionId,
    pub added: u32,
    pub modified: u32,
    pub removed: u32,
    pub upgraded: u32,
    pub errors: Vec<String>,
    pub requires_reauth: bool,
}

impl SyncResult {
    pub fn empty(connection_id: ConnectionId) -> Self {
        SyncResult {
            connection_id,
            added: 0,
            modified: 0,
            removed: 0,
            upgraded: 0,
            errors: Vec::new(),
            requires_reauth: false,
        }
    }

    pub fn is_zero_delta(&self) -> bool {
        self.added == 0 && self.modified == 0 && self.removed == 0 && self.upgraded == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Idle,
    Fetching,
    Processing,
    Deduplicating,
    Saving,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStage::Idle => write!(f, "idle"),
            SyncStage::Fetching => write!(f, "fetching"),
            SyncStage::Processing => write!(f, "processing"),
            SyncStage::Deduplicating => write!(f, "deduplicating"),
            SyncStage::Saving => write!(f, "saving"),
        }
    }
}

/// Progress notification for UI feedback only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub stage: SyncStage,
    pub progress: Option<u32>,
    pub total: Option<u32>,
}

impl SyncProgress {
    pub fn stage(stage: SyncStage) -> Self {
        SyncProgress { stage, progress: None, total: None }
    }

    pub fn step(stage: SyncStage, progress: u32, total: u32) -> Self {
        SyncProgress {
            stage,
            progress: Some(progress),
            total: Some(total),
        }
    }
}
