//! CLI entry point.

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skillshelf::cli::{Cli, Command};
use skillshelf::config::JobConfig;
use skillshelf::job::JobController;
use skillshelf::progress::ProgressTracker;
use skillshelf::topics::load_topics;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            // Job-level errors carry their own exit codes; anything else is
            // a configuration/input failure.
            let code = error
                .downcast_ref::<skillshelf::JobError>()
                .map_or(2, skillshelf::JobError::exit_code);
            eprintln!("{error:#}");
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<u8> {
    let config = JobConfig::load(cli.config.as_deref())?;
    let config = cli.apply_overrides(config);

    match &cli.command {
        Command::Discover {
            skills, update, ..
        } => {
            let mut topics = load_topics(&config.skills_file)?;
            if !skills.is_empty() {
                topics.retain(|topic| {
                    skills
                        .iter()
                        .any(|f| topic.name.to_lowercase().contains(&f.to_lowercase()))
                });
                info!(topics = topics.len(), "filtered topic catalogue");
            }

            let mut controller = JobController::new(config)?;
            install_interrupt_handler(&controller);
            let summary = controller.run_discovery(topics, *update).await?;
            controller.shutdown().await?;

            info!(
                topics = summary.skills_processed,
                books = summary.books_completed,
                failed = summary.books_failed,
                "discovery finished"
            );
            Ok(summary.exit_code())
        }

        Command::Download { skills, .. } => {
            let mut controller = JobController::new(config)?;
            install_interrupt_handler(&controller);
            let filter = (!skills.is_empty()).then(|| skills.clone());
            let summary = controller.run_download(filter.as_deref()).await?;
            controller.shutdown().await?;

            info!(
                topics = summary.skills_processed,
                downloaded = summary.books_completed,
                skipped = summary.books_skipped,
                failed = summary.books_failed,
                "download finished"
            );
            Ok(summary.exit_code())
        }

        Command::Status => {
            print_status(&config)?;
            Ok(0)
        }
    }
}

/// On Ctrl-C: finish the current book boundary, flush, exit 130. A second
/// Ctrl-C aborts immediately.
fn install_interrupt_handler(controller: &JobController) {
    let flag = controller.interrupt_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current book then stopping");
            flag.store(true, Ordering::SeqCst);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt; aborting now");
            std::process::exit(130);
        }
    });
}

fn print_status(config: &JobConfig) -> Result<()> {
    let tracker = ProgressTracker::load_or_new(&config.progress_file, true)
        .context("failed to load progress file")?;
    let state = tracker.state();

    println!("Session:  {} ({:?})", state.session_id, state.status);
    println!(
        "Skills:   {}/{} completed",
        state.completed_skills, state.total_skills
    );
    println!(
        "Books:    {}/{} completed, {} failed, {} skipped",
        state.completed_books,
        state.total_books,
        state.failed_items.len(),
        state.skipped_books
    );
    match tracker.eta() {
        Some(eta) => println!("ETA:      {:.0} minutes", eta.as_secs_f64() / 60.0),
        None => println!("ETA:      unknown"),
    }
    if !state.failed_items.is_empty() {
        println!("\nFailed items:");
        for (id, item) in &state.failed_items {
            println!("  {id}  [{}]  {}", item.kind, item.message);
        }
    }
    Ok(())
}
