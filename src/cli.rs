//! Command-line interface built on clap.
//!
//! [`Cli`] holds the subcommands ([`Command`]: run, recover, status, export)
//! and global flags that override values from `cotsearch.toml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::SearchConfig;
use crate::pipeline::ResumeChoice;
use crate::state_machine::ContentType;

/// Resumable multi-strategy reasoning search over a dataset of questions.
#[derive(Debug, Parser)]
#[command(name = "cotsearch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (defaults to ./cotsearch.toml when present).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Number of concurrent workers.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Process at most this many dataset records.
    #[arg(long, global = true)]
    pub limit: Option<usize>,

    /// Outer refinement rounds per item.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Directory for result and progress files.
    #[arg(long, global = true)]
    pub results_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Content type accepted on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ContentTypeArg {
    General,
    Ocr,
    Medical,
}

impl From<ContentTypeArg> for ContentType {
    fn from(arg: ContentTypeArg) -> Self {
        match arg {
            ContentTypeArg::General => ContentType::General,
            ContentTypeArg::Ocr => ContentType::Ocr,
            ContentTypeArg::Medical => ContentType::Medical,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search every unprocessed record of a dataset.
    Run {
        /// JSON array of question/answer records.
        dataset: PathBuf,

        /// Resume the most recent run of this dataset without asking.
        #[arg(long, conflicts_with = "fresh")]
        resume: bool,

        /// Always start a new run.
        #[arg(long)]
        fresh: bool,

        /// Content type for records that do not carry one.
        #[arg(long, value_enum)]
        content_type: Option<ContentTypeArg>,
    },

    /// List resumable runs, most recent first.
    Recover {
        /// Only runs of this dataset, with remaining counts.
        #[arg(long)]
        dataset: Option<PathBuf>,
    },

    /// Show counts for a results file and its progress file.
    Status {
        results: PathBuf,
    },

    /// Write the simplified view of a results file.
    Export {
        results: PathBuf,
    },
}

impl Cli {
    /// Fold command-line overrides into the loaded config.
    pub fn apply_overrides(&self, config: &mut SearchConfig) {
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(limit) = self.limit {
            config.limit = Some(limit);
        }
        if let Some(attempts) = self.max_attempts {
            config.max_search_attempts = attempts;
        }
        if let Some(dir) = &self.results_dir {
            config.results_dir = dir.clone();
        }
        if let Command::Run {
            content_type: Some(ct),
            ..
        } = &self.command
        {
            config.content_type = (*ct).into();
        }
    }
}

impl Command {
    pub fn resume_choice(resume: bool, fresh: bool) -> ResumeChoice {
        match (resume, fresh) {
            (true, _) => ResumeChoice::Resume,
            (_, true) => ResumeChoice::Fresh,
            _ => ResumeChoice::Ask,
        }
    }
}
