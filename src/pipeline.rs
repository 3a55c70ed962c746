//! Startup driver for a run: pick or create the results file, reconcile
//! progress, run the pool and write the summary outputs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use dialoguer::Confirm;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::dataset::load_work_items;
use crate::engine::SearchEngine;
use crate::inference::OpenAiClient;
use crate::persist::{
    ProgressTracker, RecoveryCandidate, RecoveryManager, ResultStore, atomic_write,
    progress_path_for, suggest_recovery_options,
};
use crate::pool::{PoolReport, WorkerPool};
use crate::state_machine::SearchResult;
use crate::ui::{self, PoolProgress};

/// How to treat a resumable earlier run of the same dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    /// Ask on the terminal; anything but an explicit yes starts fresh.
    Ask,
    Resume,
    Fresh,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dataset: PathBuf,
    pub resume: ResumeChoice,
}

/// Files a run writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    pub results: PathBuf,
    pub progress: PathBuf,
    pub resumed: bool,
}

pub async fn run(
    config: Arc<SearchConfig>,
    opts: RunOptions,
    cancel: CancellationToken,
) -> Result<PoolReport> {
    let items = load_work_items(&opts.dataset, config.content_type, config.limit)?;
    if items.is_empty() {
        bail!("dataset {} has no usable records", opts.dataset.display());
    }
    let stem = dataset_stem(&opts.dataset);

    let candidates = RecoveryManager::new(&config.results_dir)
        .find_incomplete_runs()
        .context("failed to scan for resumable runs")?
        .into_iter()
        .filter(|c| belongs_to(c, &stem))
        .collect::<Vec<_>>();
    let chosen = decide_resume(candidates, items.len(), opts.resume).await;
    let files = run_files(&config.results_dir, &stem, chosen);

    let store = Arc::new(ResultStore::new(&files.results)?);
    let tracker = Arc::new(ProgressTracker::open(&files.progress));
    if files.resumed {
        let dropped = tracker.reconcile(&store.stored_ids()?)?;
        if dropped > 0 {
            warn!(dropped, "items marked without a stored result will be reprocessed");
        }
        store.backup_results()?;
        info!(
            results = %files.results.display(),
            processed = tracker.get_stats().total_processed,
            "resuming run"
        );
    } else {
        info!(results = %files.results.display(), "starting fresh run");
    }

    let pending = items.iter().filter(|i| !tracker.is_processed(&i.id)).count();
    let client = OpenAiClient::from_config(&config).context("failed to build inference client")?;
    let engine = Arc::new(SearchEngine::new(client, config.clone()));
    let pool = WorkerPool::new(engine, tracker.clone(), store.clone(), config.num_workers);

    let progress = if pending == 0 {
        PoolProgress::hidden()
    } else {
        PoolProgress::start(pending as u64)
    };
    let report = pool.run(items, &cancel, &progress).await;
    progress.finish(&report);

    let results = store.get_existing_results()?;
    for preview in results.iter().take(3) {
        debug!(
            item_id = %preview.work_item_id,
            status = %preview.status,
            answer = %preview.extracted_answer,
            "stored result"
        );
    }
    let simplified = export_simplified(&files.results, &results)?;
    info!(path = %simplified.display(), "wrote simplified results");

    ui::print_run_summary(&report, store.path(), tracker.path());

    if report.persist_failures > 0 {
        bail!(
            "{} results could not be persisted; rerun to reprocess them",
            report.persist_failures
        );
    }
    Ok(report)
}

fn dataset_stem(dataset: &Path) -> String {
    dataset
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset")
        .to_string()
}

fn belongs_to(candidate: &RecoveryCandidate, stem: &str) -> bool {
    candidate
        .results_file
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(&format!("{stem}_results_")))
}

/// Apply the operator's resume choice to the ranked candidates.
async fn decide_resume(
    candidates: Vec<RecoveryCandidate>,
    total: usize,
    choice: ResumeChoice,
) -> Option<RecoveryCandidate> {
    let most_recent = candidates.first().cloned()?;
    match choice {
        ResumeChoice::Fresh => None,
        ResumeChoice::Resume => Some(most_recent),
        ResumeChoice::Ask => {
            println!("{}", suggest_recovery_options(&candidates, total));
            let prompt = format!("Resume {}?", most_recent.results_file.display());
            let answer = tokio::task::spawn_blocking(move || {
                Confirm::new().with_prompt(prompt).default(false).interact()
            })
            .await;
            match answer {
                Ok(Ok(true)) => Some(most_recent),
                Ok(Ok(false)) => None,
                Ok(Err(e)) => {
                    warn!(error = %e, "no resume decision, starting fresh");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "resume prompt failed, starting fresh");
                    None
                }
            }
        }
    }
}

fn run_files(results_dir: &Path, stem: &str, resume: Option<RecoveryCandidate>) -> RunFiles {
    match resume {
        Some(c) => RunFiles {
            results: c.results_file,
            progress: c.progress_file,
            resumed: true,
        },
        None => {
            let ts = Utc::now().format("%Y%m%d_%H%M%S");
            let results = results_dir.join(format!("{stem}_results_{ts}.json"));
            RunFiles {
                progress: progress_path_for(&results),
                results,
                resumed: false,
            }
        }
    }
}

/// Question/answer view of one successful result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedRecord {
    pub id: String,
    pub img_urls: Vec<String>,
    pub question: String,
    pub reasoning: String,
    pub answer: String,
    pub ground_truth: String,
    pub correct: bool,
    pub strategies_used: Vec<String>,
}

impl From<&SearchResult> for SimplifiedRecord {
    fn from(r: &SearchResult) -> Self {
        Self {
            id: r.work_item_id.clone(),
            img_urls: r.context_images.clone(),
            question: r.question.clone(),
            reasoning: r.natural_reasoning.clone(),
            answer: r.final_answer.clone(),
            ground_truth: r.reference_answer.clone(),
            correct: r.found_correct_answer,
            strategies_used: r.strategies_used.clone(),
        }
    }
}

/// `results/x.json` → `results/x_simplified.json`.
pub fn simplified_path_for(results_file: &Path) -> PathBuf {
    let stem = results_file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    results_file.with_file_name(format!("{stem}_simplified.json"))
}

/// Write the simplified view of the successful `results` next to `results_file`.
pub fn export_simplified(results_file: &Path, results: &[SearchResult]) -> Result<PathBuf> {
    let records: Vec<SimplifiedRecord> = results
        .iter()
        .filter(|r| r.is_success())
        .map(SimplifiedRecord::from)
        .collect();
    let path = simplified_path_for(results_file);
    let bytes = serde_json::to_vec_pretty(&records)?;
    atomic_write(&path, &bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// `export` subcommand.
pub fn export(results_file: &Path) -> Result<PathBuf> {
    if !results_file.exists() {
        bail!("results file {} does not exist", results_file.display());
    }
    let results = ResultStore::new(results_file)?.get_existing_results()?;
    export_simplified(results_file, &results)
}

/// `status` subcommand.
pub fn status(results_file: &Path) -> Result<()> {
    if !results_file.exists() {
        bail!("results file {} does not exist", results_file.display());
    }
    let results = ResultStore::new(results_file)?.get_existing_results()?;
    let tracker = ProgressTracker::open(progress_path_for(results_file));
    ui::print_status(results_file, &results, &tracker.get_stats());
    Ok(())
}

/// `recover` subcommand.
pub fn recover(results_dir: &Path, dataset: Option<&Path>, config: &SearchConfig) -> Result<()> {
    let manager = RecoveryManager::new(results_dir);
    let mut candidates = manager.find_incomplete_runs()?;
    let total = match dataset {
        Some(path) => {
            let stem = dataset_stem(path);
            candidates.retain(|c| belongs_to(c, &stem));
            Some(load_work_items(path, config.content_type, config.limit)?.len())
        }
        None => None,
    };
    ui::print_recovery(&candidates, total);
    Ok(())
}
