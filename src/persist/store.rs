use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::fsutil::{FileLock, atomic_write};
use crate::error::PersistError;
use crate::state_machine::SearchResult;

/// Ordered collection of [`SearchResult`]s kept in one JSON array file.
///
/// Every append is a locked read-modify-write of the whole file. A result
/// whose `work_item_id` is already stored replaces the older record, so
/// reprocessing after a crash never duplicates an item.
pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    /// Open `path`, creating it as an empty array if absent.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        let _guard = FileLock::acquire(&path)?;
        if !path.exists() {
            atomic_write(&path, b"[]").inspect_err(|err| {
                error!(path = %path.display(), error = %err, "failed to initialise result store");
            })?;
            info!(path = %path.display(), "created result store");
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert `result`, replacing any stored record for the same item.
    pub fn append_result(&self, result: &SearchResult) -> Result<(), PersistError> {
        let outcome = self.append_locked(result);
        if let Err(err) = &outcome {
            error!(
                item_id = %result.work_item_id,
                path = %self.path.display(),
                error = %err,
                "failed to append result"
            );
        }
        outcome
    }

    fn append_locked(&self, result: &SearchResult) -> Result<(), PersistError> {
        let _guard = FileLock::acquire(&self.path)?;
        let mut results = self.read_tolerant()?;
        match results
            .iter_mut()
            .find(|r| r.work_item_id == result.work_item_id)
        {
            Some(existing) => {
                debug!(item_id = %result.work_item_id, "replacing stored result");
                *existing = result.clone();
            }
            None => results.push(result.clone()),
        }
        let bytes = serde_json::to_vec_pretty(&results)?;
        atomic_write(&self.path, &bytes)
    }

    pub fn get_existing_results(&self) -> Result<Vec<SearchResult>, PersistError> {
        let _guard = FileLock::acquire(&self.path)?;
        self.read_tolerant()
    }

    pub fn stored_ids(&self) -> Result<HashSet<String>, PersistError> {
        Ok(self
            .get_existing_results()?
            .into_iter()
            .map(|r| r.work_item_id)
            .collect())
    }

    /// Copy the store to `<stem>.backup_<timestamp>.json` and return that path.
    pub fn backup_results(&self) -> Result<PathBuf, PersistError> {
        let _guard = FileLock::acquire(&self.path)?;
        let backup = self.sibling(&format!("backup_{}", Utc::now().format("%Y%m%d_%H%M%S")));
        std::fs::copy(&self.path, &backup).map_err(|e| {
            let err = PersistError::io(&backup, e);
            error!(path = %self.path.display(), error = %err, "failed to back up results");
            err
        })?;
        info!(backup = %backup.display(), "backed up results");
        Ok(backup)
    }

    /// Missing file reads as empty. An undecodable file is set aside as
    /// `<stem>.corrupt_<timestamp>.json` and also reads as empty.
    fn read_tolerant(&self) -> Result<Vec<SearchResult>, PersistError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistError::io(&self.path, e)),
        };
        match serde_json::from_str(&contents) {
            Ok(results) => Ok(results),
            Err(e) => {
                let aside =
                    self.sibling(&format!("corrupt_{}", Utc::now().format("%Y%m%d_%H%M%S")));
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    kept_as = %aside.display(),
                    "result store corrupt, treating as empty"
                );
                if let Err(copy_err) = std::fs::copy(&self.path, &aside) {
                    warn!(error = %copy_err, "could not keep a copy of the corrupt store");
                }
                Ok(Vec::new())
            }
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("results");
        self.path.with_file_name(format!("{stem}.{suffix}.json"))
    }
}
