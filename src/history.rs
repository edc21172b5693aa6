use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};

pub const HISTORY_CAPACITY: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub location_link: Option<String>,
    pub success: bool,
    pub message: String,
}

/// Newest-first log of alert attempts, capped at [`HISTORY_CAPACITY`].
/// Optionally mirrored to a JSON file after every append.
#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
    path: Option<PathBuf>,
}

impl HistoryLog {
    #[cfg(test)]
    pub fn in_memory() -> Self {
        HistoryLog::default()
    }

    /// Load the log stored at `path`. A missing or unreadable file starts
    /// an empty log.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Vec<HistoryEntry>>(&contents) {
                Ok(entries) => entries.into_iter().take(HISTORY_CAPACITY).collect(),
                Err(err) => {
                    warn!("Ignoring corrupt history at {}: {}", path.display(), err);
                    VecDeque::new()
                }
            },
            Err(err) => {
                debug!("No history at {}: {}", path.display(), err);
                VecDeque::new()
            }
        };
        HistoryLog {
            entries,
            path: Some(path),
        }
    }

    pub async fn append(&mut self, entry: HistoryEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(HISTORY_CAPACITY);
        self.save().await;
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let result = match serde_json::to_vec_pretty(&self.entries) {
            Ok(json) => tokio::fs::write(path, json).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            warn!("Could not save history to {}: {}", path.display(), err);
        }
    }
}
