use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::fsutil::{FileLock, atomic_write};
use crate::error::PersistError;

/// On-disk shape of a progress file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default)]
    pub processed_ids: BTreeSet<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_processed: usize,
}

impl ProgressState {
    /// Read a progress file. Missing or undecodable files yield `None`.
    pub fn read(path: &Path) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "progress file unreadable");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "progress file corrupt, ignoring it");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressStats {
    pub total_processed: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Progress file paired with a results file: `run.json` → `run.progress`.
pub fn progress_path_for(results_file: &Path) -> PathBuf {
    results_file.with_extension("progress")
}

/// Set of processed item ids, persisted after every mark.
pub struct ProgressTracker {
    path: PathBuf,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    /// Load `path` if it holds a valid progress document, else start empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match ProgressState::read(&path) {
            Some(state) => {
                info!(
                    path = %path.display(),
                    processed = state.processed_ids.len(),
                    "loaded progress"
                );
                state
            }
            None => ProgressState::default(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.lock().processed_ids.contains(id)
    }

    /// Record `id` as done and persist immediately.
    ///
    /// Call only after the item's result has been appended. On a failed
    /// write the id is dropped from memory again and the error returned.
    pub fn mark_processed(&self, id: &str) -> Result<(), PersistError> {
        let mut state = self.lock();
        let inserted = state.processed_ids.insert(id.to_string());
        state.total_processed = state.processed_ids.len();
        state.last_updated = Some(Utc::now());
        if let Err(err) = self.persist(&state) {
            error!(
                item_id = %id,
                path = %self.path.display(),
                error = %err,
                "failed to persist progress"
            );
            if inserted {
                state.processed_ids.remove(id);
                state.total_processed = state.processed_ids.len();
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn get_stats(&self) -> ProgressStats {
        let state = self.lock();
        ProgressStats {
            total_processed: state.total_processed,
            last_updated: state.last_updated,
        }
    }

    #[cfg(test)]
    pub fn processed_ids(&self) -> BTreeSet<String> {
        self.lock().processed_ids.clone()
    }

    /// Forget ids that have no stored result, so they are processed again.
    /// Returns how many were dropped.
    pub fn reconcile(&self, stored_ids: &HashSet<String>) -> Result<usize, PersistError> {
        let mut state = self.lock();
        let before = state.processed_ids.len();
        state.processed_ids.retain(|id| stored_ids.contains(id));
        let dropped = before - state.processed_ids.len();
        if dropped > 0 {
            warn!(dropped, "progress listed items without stored results");
            state.total_processed = state.processed_ids.len();
            state.last_updated = Some(Utc::now());
            if let Err(err) = self.persist(&state) {
                error!(path = %self.path.display(), error = %err, "failed to persist progress");
                return Err(err);
            }
        }
        Ok(dropped)
    }

    fn persist(&self, state: &ProgressState) -> Result<(), PersistError> {
        let _guard = FileLock::acquire(&self.path)?;
        let bytes = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.path, &bytes)
    }
}
