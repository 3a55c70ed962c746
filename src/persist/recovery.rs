use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::progress::ProgressState;
use crate::error::PersistError;

/// A previous run that can be resumed: a progress file and its results file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryCandidate {
    pub progress_file: PathBuf,
    pub results_file: PathBuf,
    pub processed_count: usize,
    /// Records currently in the results file, if it could be read.
    pub stored_results: Option<usize>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl RecoveryCandidate {
    /// Items still to do out of `total`.
    pub fn remaining(&self, total: usize) -> usize {
        total.saturating_sub(self.processed_count)
    }
}

/// Finds resumable runs in a results directory.
pub struct RecoveryManager {
    results_dir: PathBuf,
}

impl RecoveryManager {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    /// Every `*.progress` file with a readable document, most recently
    /// updated first. Unreadable progress files are skipped.
    pub fn find_incomplete_runs(&self) -> Result<Vec<RecoveryCandidate>, PersistError> {
        let entries = match std::fs::read_dir(&self.results_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistError::io(&self.results_dir, e)),
        };

        let mut candidates = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| PersistError::io(&self.results_dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("progress") {
                continue;
            }
            let Some(state) = ProgressState::read(&path) else {
                warn!(path = %path.display(), "skipping unreadable progress file");
                continue;
            };
            let results_file = path.with_extension("json");
            candidates.push(RecoveryCandidate {
                stored_results: count_results(&results_file),
                processed_count: state.total_processed.max(state.processed_ids.len()),
                last_updated: state.last_updated,
                progress_file: path,
                results_file,
            });
        }

        candidates.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        debug!(count = candidates.len(), dir = %self.results_dir.display(), "found resumable runs");
        Ok(candidates)
    }
}

/// Human-readable list of resumable runs against a dataset of `total` items.
pub fn suggest_recovery_options(candidates: &[RecoveryCandidate], total: usize) -> String {
    if candidates.is_empty() {
        return "No incomplete runs found. Starting fresh is the only option.".to_string();
    }
    let mut out = String::from("Recovery options found:\n");
    for (i, c) in candidates.iter().enumerate() {
        let updated = c
            .last_updated
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        let _ = writeln!(out, "{}. Resume from: {}", i + 1, c.results_file.display());
        let _ = writeln!(out, "   - Processed: {} items", c.processed_count);
        if let Some(stored) = c.stored_results {
            let _ = writeln!(out, "   - Stored results: {stored}");
        }
        let _ = writeln!(out, "   - Last updated: {updated}");
        let _ = writeln!(out, "   - Remaining: {} items", c.remaining(total));
    }
    out
}

/// Read-only count, so scanning never creates or rewrites anything.
fn count_results(results_file: &Path) -> Option<usize> {
    let contents = std::fs::read_to_string(results_file).ok()?;
    serde_json::from_str::<Vec<serde_json::Value>>(&contents)
        .map(|results| results.len())
        .ok()
}
