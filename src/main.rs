mod cli;
mod config;
mod dataset;
mod engine;
mod error;
mod extract;
mod inference;
mod oracle;
mod persist;
mod pipeline;
mod pool;
mod state_machine;
mod ui;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use cli::{Cli, Command};
use config::SearchConfig;
use pipeline::RunOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// The first interrupt cancels `cancel` so in-flight items can drain.
/// Returns `true` on a second interrupt, when the caller should abort.
async fn watch_interrupts<S, F>(mut interrupt: S, cancel: &CancellationToken) -> bool
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    tracing::warn!("interrupt received, finishing in-flight items (interrupt again to abort)");
    cancel.cancel();
    if interrupt().await.is_err() {
        return false;
    }
    tracing::error!("second interrupt, aborting without waiting for in-flight items");
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = SearchConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    match cli.command {
        Command::Run {
            dataset,
            resume,
            fresh,
            ..
        } => {
            if config.api_key.is_empty() {
                bail!("no API key: set OPENROUTER_API_KEY or api_key in the config file");
            }
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if watch_interrupts(tokio::signal::ctrl_c, &on_signal).await {
                    std::process::exit(130);
                }
            });

            let opts = RunOptions {
                dataset,
                resume: Command::resume_choice(resume, fresh),
            };
            pipeline::run(Arc::new(config), opts, cancel).await?;
        }
        Command::Recover { dataset } => {
            pipeline::recover(&config.results_dir, dataset.as_deref(), &config)?;
        }
        Command::Status { results } => {
            pipeline::status(&results)?;
        }
        Command::Export { results } => {
            let path = pipeline::export(&results)?;
            println!("Simplified results written to {}", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_interrupt_requests_abort() {
        let cancel = CancellationToken::new();
        let aborted = watch_interrupts(|| async { Ok(()) }, &cancel).await;
        assert!(aborted);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn single_interrupt_only_cancels() {
        let cancel = CancellationToken::new();
        let mut seen = 0;
        let aborted = watch_interrupts(
            || {
                seen += 1;
                let outcome = if seen == 1 {
                    Ok(())
                } else {
                    Err(std::io::Error::other("signal stream closed"))
                };
                async move { outcome }
            },
            &cancel,
        )
        .await;
        assert!(!aborted);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn unavailable_signal_leaves_run_alone() {
        let cancel = CancellationToken::new();
        let aborted =
            watch_interrupts(|| async { Err(std::io::Error::other("no handler")) }, &cancel).await;
        assert!(!aborted);
        assert!(!cancel.is_cancelled());
    }
}
