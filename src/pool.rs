//! Worker pool: fans work items out over concurrent tokio tasks.
//!
//! Each finished item is appended to the result store and only then
//! marked in the progress tracker. A task that dies (panics) still yields an
//! `error_in_future` result and is marked, so a poison item cannot stall
//! the run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::SearchEngine;
use crate::error::PersistError;
use crate::inference::InferenceClient;
use crate::persist::{ProgressTracker, ResultStore};
use crate::state_machine::{ErrorDetail, ResultStatus, SearchResult, WorkItem};
use crate::ui::PoolProgress;

/// Counters for one pool run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolReport {
    /// Items whose result was stored and marked.
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
    /// Items skipped because an earlier run already marked them.
    pub skipped: usize,
    /// Items never started because the run was cancelled.
    pub not_dispatched: usize,
    /// Items whose result could not be stored or marked.
    pub persist_failures: usize,
}

impl PoolReport {
    pub fn errors(&self) -> usize {
        self.failed + self.panicked
    }

    fn record(&mut self, result: &SearchResult) {
        self.processed += 1;
        match result.status {
            ResultStatus::Success => self.succeeded += 1,
            ResultStatus::Error => self.failed += 1,
            ResultStatus::ErrorInFuture => self.panicked += 1,
        }
    }
}

pub struct WorkerPool<C> {
    engine: Arc<SearchEngine<C>>,
    tracker: Arc<ProgressTracker>,
    store: Arc<ResultStore>,
    workers: usize,
}

impl<C: InferenceClient + 'static> WorkerPool<C> {
    pub fn new(
        engine: Arc<SearchEngine<C>>,
        tracker: Arc<ProgressTracker>,
        store: Arc<ResultStore>,
        workers: usize,
    ) -> Self {
        Self {
            engine,
            tracker,
            store,
            workers: workers.max(1),
        }
    }

    /// Process every item not yet marked, at most `workers` at a time.
    ///
    /// Once `cancel` fires no new item starts; items already running finish
    /// and are stored before this returns.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        cancel: &CancellationToken,
        progress: &PoolProgress,
    ) -> PoolReport {
        let mut report = PoolReport::default();
        let pending: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| {
                let done = self.tracker.is_processed(&item.id);
                if done {
                    report.skipped += 1;
                }
                !done
            })
            .collect();
        info!(
            pending = pending.len(),
            skipped = report.skipped,
            workers = self.workers,
            "starting worker pool"
        );

        let mut queue = pending.into_iter();
        let mut tasks: JoinSet<SearchResult> = JoinSet::new();
        let mut in_flight: HashMap<Id, (WorkItem, DateTime<Utc>)> = HashMap::new();

        loop {
            while tasks.len() < self.workers && !cancel.is_cancelled() {
                let Some(item) = queue.next() else { break };
                let engine = self.engine.clone();
                let task_item = item.clone();
                let handle = tasks.spawn(async move { engine.process_item(&task_item).await });
                in_flight.insert(handle.id(), (item, Utc::now()));
            }

            let joined = tokio::select! {
                joined = tasks.join_next_with_id() => joined,
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    warn!(in_flight = tasks.len(), "cancellation requested, draining workers");
                    progress.cancelling();
                    continue;
                }
            };
            let Some(joined) = joined else { break };

            let Some(result) = Self::settle(joined, &mut in_flight) else {
                continue;
            };
            self.persist(&result, &mut report).await;
            progress.item_finished(&result);
        }

        report.not_dispatched = queue.len();
        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            errors = report.errors(),
            not_dispatched = report.not_dispatched,
            "worker pool finished"
        );
        report
    }

    /// Turn a joined task into the result to store.
    fn settle(
        joined: Result<(Id, SearchResult), JoinError>,
        in_flight: &mut HashMap<Id, (WorkItem, DateTime<Utc>)>,
    ) -> Option<SearchResult> {
        match joined {
            Ok((id, result)) => {
                in_flight.remove(&id);
                Some(result)
            }
            Err(err) => {
                let Some((item, started_at)) = in_flight.remove(&err.id()) else {
                    error!(error = %err, "untracked worker task failed");
                    return None;
                };
                error!(item_id = %item.id, error = %err, "worker task died");
                let message = if err.is_panic() {
                    "worker task panicked"
                } else {
                    "worker task was cancelled"
                };
                Some(SearchResult::failed(
                    &item,
                    ResultStatus::ErrorInFuture,
                    ErrorDetail {
                        message: message.to_string(),
                        detail: err.to_string(),
                    },
                    started_at,
                ))
            }
        }
    }

    /// Append, then mark, on the blocking pool. An item whose append failed
    /// stays unmarked and is picked up again by the next run.
    async fn persist(&self, result: &SearchResult, report: &mut PoolReport) {
        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let owned = result.clone();
        let stored = tokio::task::spawn_blocking(move || -> Result<(), PersistError> {
            store.append_result(&owned)?;
            tracker.mark_processed(&owned.work_item_id)
        })
        .await;
        match stored {
            Ok(Ok(())) => report.record(result),
            Ok(Err(_)) => report.persist_failures += 1,
            Err(err) => {
                error!(item_id = %result.work_item_id, error = %err, "persist task died");
                report.persist_failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;
    use crate::inference::mock::MockClient;
    use crate::inference::{CallPurpose, RetryConfig};
    use crate::persist::ProgressTracker;
    use std::collections::HashSet;
    use std::path::Path;

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem {
                id: format!("item-{i}"),
                question: format!("question {i}"),
                context_images: Vec::new(),
                reference_answer: "ref".into(),
                content_type: Default::default(),
            })
            .collect()
    }

    fn engine(client: MockClient) -> Arc<SearchEngine<MockClient>> {
        let config = SearchConfig {
            max_search_attempts: 1,
            retry: RetryConfig {
                max_retries: 0,
                base_delay_ms: 0,
            },
            ..SearchConfig::default()
        };
        Arc::new(SearchEngine::new(client, Arc::new(config)))
    }

    fn pool(
        client: MockClient,
        dir: &Path,
        workers: usize,
    ) -> (WorkerPool<MockClient>, Arc<ProgressTracker>, Arc<ResultStore>) {
        let tracker = Arc::new(ProgressTracker::open(dir.join("run.progress")));
        let store = Arc::new(ResultStore::new(dir.join("run.json")).unwrap());
        let pool = WorkerPool::new(engine(client), tracker.clone(), store.clone(), workers);
        (pool, tracker, store)
    }

    fn assert_marked_have_results(tracker: &ProgressTracker, store: &ResultStore) {
        let stored = store.stored_ids().unwrap();
        for id in tracker.processed_ids() {
            assert!(stored.contains(&id), "{id} marked without a stored result");
        }
    }

    #[tokio::test]
    async fn processes_every_item_once() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, tracker, store) = pool(MockClient::with_verdict("True"), dir.path(), 3);

        let report = pool
            .run(items(7), &CancellationToken::new(), &PoolProgress::hidden())
            .await;

        assert_eq!(report.processed, 7);
        assert_eq!(report.succeeded, 7);
        assert_eq!(report.not_dispatched, 0);
        assert_eq!(store.get_existing_results().unwrap().len(), 7);
        assert_eq!(tracker.get_stats().total_processed, 7);
        assert_marked_have_results(&tracker, &store);
    }

    #[tokio::test]
    async fn item_errors_are_stored_and_marked() {
        let dir = tempfile::tempdir().unwrap();
        let client = MockClient::new(|req| {
            if req.prompt.contains("question 1") {
                Err(crate::inference::InferenceError::EmptyResponse)
            } else if req.purpose == CallPurpose::Verify {
                Ok("True".into())
            } else {
                Ok("fine".into())
            }
        });
        let (pool, tracker, store) = pool(client, dir.path(), 2);

        let report = pool
            .run(items(3), &CancellationToken::new(), &PoolProgress::hidden())
            .await;

        assert_eq!(report.processed, 3);
        assert_eq!(report.failed, 1);
        let results = store.get_existing_results().unwrap();
        let failed = results.iter().find(|r| r.work_item_id == "item-1").unwrap();
        assert_eq!(failed.status, ResultStatus::Error);
        assert!(tracker.is_processed("item-1"));
    }

    #[tokio::test]
    async fn panicking_worker_yields_error_in_future() {
        let dir = tempfile::tempdir().unwrap();
        let client = MockClient::new(|req| {
            if req.prompt.contains("question 0") {
                panic!("poison item");
            }
            match req.purpose {
                CallPurpose::Verify => Ok("True".into()),
                _ => Ok("fine".into()),
            }
        });
        let (pool, tracker, store) = pool(client, dir.path(), 1);

        let report = pool
            .run(items(2), &CancellationToken::new(), &PoolProgress::hidden())
            .await;

        assert_eq!(report.panicked, 1);
        assert_eq!(report.succeeded, 1);
        let results = store.get_existing_results().unwrap();
        let poisoned = results.iter().find(|r| r.work_item_id == "item-0").unwrap();
        assert_eq!(poisoned.status, ResultStatus::ErrorInFuture);
        assert!(tracker.is_processed("item-0"));
    }

    #[tokio::test]
    async fn resumed_run_has_no_duplicates_or_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let client = MockClient::new(move |req| {
            if req.purpose == CallPurpose::Initial && req.prompt.contains("question 2") {
                trigger.cancel();
            }
            match req.purpose {
                CallPurpose::Verify => Ok("True".into()),
                _ => Ok("fine".into()),
            }
        });
        let (first, tracker, store) = pool(client, dir.path(), 1);
        let report = first.run(items(6), &cancel, &PoolProgress::hidden()).await;

        // The in-flight item finishes; the rest is left for the next run.
        assert_eq!(report.processed, 3);
        assert_eq!(report.not_dispatched, 3);
        assert_marked_have_results(&tracker, &store);

        // Crash between append and mark: item-3 is stored but not marked.
        let orphan = engine(MockClient::with_verdict("True"))
            .process_item(&items(6)[3])
            .await;
        store.append_result(&orphan).unwrap();
        drop((first, tracker, store));

        let (second, tracker, store) = pool(MockClient::with_verdict("True"), dir.path(), 2);
        let report = second
            .run(items(6), &CancellationToken::new(), &PoolProgress::hidden())
            .await;
        assert_eq!(report.skipped, 3);
        assert_eq!(report.processed, 3);

        let results = store.get_existing_results().unwrap();
        let ids: HashSet<_> = results.iter().map(|r| r.work_item_id.clone()).collect();
        assert_eq!(results.len(), 6);
        assert_eq!(ids.len(), 6);
        assert_eq!(tracker.get_stats().total_processed, 6);
        assert_marked_have_results(&tracker, &store);
    }

    #[tokio::test]
    async fn failed_append_is_counted_and_left_unmarked() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, tracker, _store) = pool(MockClient::with_verdict("True"), dir.path(), 1);
        // A directory in place of the results file makes every append fail.
        let results = dir.path().join("run.json");
        std::fs::remove_file(&results).unwrap();
        std::fs::create_dir(&results).unwrap();

        let report = pool
            .run(items(1), &CancellationToken::new(), &PoolProgress::hidden())
            .await;

        assert_eq!(report.persist_failures, 1);
        assert_eq!(report.processed, 0);
        assert!(!tracker.is_processed("item-0"));
        assert_eq!(tracker.get_stats().total_processed, 0);
    }

    #[tokio::test]
    async fn failed_mark_is_counted_after_result_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, tracker, store) = pool(MockClient::with_verdict("True"), dir.path(), 1);
        std::fs::create_dir(dir.path().join(".run.progress.tmp")).unwrap();

        let report = pool
            .run(items(1), &CancellationToken::new(), &PoolProgress::hidden())
            .await;

        assert_eq!(report.persist_failures, 1);
        assert!(!tracker.is_processed("item-0"));
        assert!(store.stored_ids().unwrap().contains("item-0"));
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _tracker, store) = pool(MockClient::with_verdict("True"), dir.path(), 4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = pool.run(items(3), &cancel, &PoolProgress::hidden()).await;
        assert_eq!(report.processed, 0);
        assert_eq!(report.not_dispatched, 3);
        assert!(store.get_existing_results().unwrap().is_empty());
    }
}
