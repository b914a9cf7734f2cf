//! Crash-safe run snapshot. Overwritten atomically after every iteration;
//! a restart restores the pending queue and budget and rebuilds the seen
//! sets from the manifest.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use strider_common::{Budget, StriderError};

use crate::scheduler::SchedulerSnapshot;
use crate::storage::atomic_overwrite;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_url: Option<String>,
    pub pending: SchedulerSnapshot,
    pub budget: Budget,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        last_url: Option<String>,
        pending: SchedulerSnapshot,
        budget: Budget,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            last_url,
            pending,
            budget,
            started_at,
            updated_at: Utc::now(),
        }
    }

    /// Atomically overwrite the checkpoint file.
    pub fn save(&self, root: &Path) -> Result<(), StriderError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StriderError::Checkpoint(e.to_string()))?;
        atomic_overwrite(&root.join(CHECKPOINT_FILE), json.as_bytes())
            .map_err(|e| StriderError::Checkpoint(e.to_string()))
    }

    /// Load a prior checkpoint if one exists. An unreadable file is treated
    /// as absent: better a fresh crawl than a refused start.
    pub fn load(root: &Path) -> Option<Checkpoint> {
        let path = root.join(CHECKPOINT_FILE);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable checkpoint");
                None
            }
        }
    }
}
