//! Exam Anchor Agent
//!
//! Runs the submission anchoring worker against the local submission store, and
//! offers a few operator commands around it.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use exam_anchor::{
    canonicalize, hash_canonical, ledger_from_config, verify_submission, AnchorArgs, AnchorConfig,
    AnchorStatus, AnchorWorker, Answer, AnswerSet, SqliteStore, Submission, SubmissionStore,
    WorkerContext,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "exam-anchor")]
#[command(about = "Anchors exam submission hashes on a ledger")]
struct Cli {
    #[command(flatten)]
    anchor: AnchorArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the anchoring worker until interrupted (default)
    Run,

    /// Show a submission's anchoring status and re-check its hash
    Verify {
        /// Submission id
        id: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Insert a demo pending submission
    Seed {
        #[arg(long, default_value = "exam_math_01")]
        exam_id: String,

        #[arg(long, default_value = "student_12345")]
        student_id: String,
    },

    /// Print the canonical form and hash of a submission JSON file
    Hash {
        file: PathBuf,

        /// Submission id, when the document does not carry one
        #[arg(long)]
        id: Option<String>,
    },
}

fn init_tracing() -> Option<sentry::ClientInitGuard> {
    let sentry_guard = std::env::var("SENTRY_DSN")
        .ok()
        .filter(|dsn| !dsn.is_empty())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,exam_anchor=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_guard.as_ref().map(|_| sentry_tracing::layer()))
        .init();

    sentry_guard
}

fn open_store(config: &AnchorConfig) -> Result<SqliteStore> {
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open store at {:?}", config.database_path))?;
    Ok(store.with_feed_interval(config.feed_poll_interval))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _sentry = init_tracing();

    let cli = Cli::parse();
    let config = cli.anchor.into_config()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Verify { id, json } => verify(config, &id, json).await,
        Command::Seed {
            exam_id,
            student_id,
        } => seed(config, exam_id, student_id).await,
        Command::Hash { file, id } => hash_file(&file, id),
    }
}

async fn run(config: AnchorConfig) -> Result<()> {
    info!("Starting exam anchor agent");
    info!("  Database: {:?}", config.database_path);
    info!("  Ledger: {:?}", config.ledger);

    let store: Arc<dyn SubmissionStore> = Arc::new(open_store(&config)?);
    let ledger = ledger_from_config(&config.ledger)?;
    let ctx = WorkerContext::new(store, ledger, &config);

    AnchorWorker::new(ctx)
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Exam anchor agent stopped");
    Ok(())
}

async fn verify(config: AnchorConfig, id: &str, json: bool) -> Result<()> {
    let store = open_store(&config)?;
    let Some(report) = verify_submission(&store, id).await? else {
        bail!("Submission {} does not exist", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Submission:   {}", report.submission_id);
        println!("Status:       {}", report.anchor_status);
        println!(
            "Stored hash:  {}",
            report.stored_hash.as_deref().unwrap_or("-")
        );
        println!("Current hash: {}", report.computed_hash);
        if let Some(tx) = &report.ledger_tx_id {
            let label = if report.is_simulated() {
                " (simulated)"
            } else {
                ""
            };
            println!("Ledger tx:    {}{}", tx, label);
        }
        if let Some(sequence) = report.ledger_sequence {
            println!("Block:        {}", sequence);
        }
        if let Some(at) = report.ledger_confirmed_at {
            println!("Confirmed at: {}", at.to_rfc3339());
        }

        if report.is_intact() {
            println!("{}", "Anchored and unchanged".green().bold());
        } else if report.anchor_status != AnchorStatus::Confirmed {
            println!(
                "{}",
                format!("Not confirmed (status: {})", report.anchor_status).yellow()
            );
        }
    }

    if report.hash_matches() == Some(false) {
        bail!("Submission {} no longer matches its anchored hash", id);
    }
    Ok(())
}

async fn seed(config: AnchorConfig, exam_id: String, student_id: String) -> Result<()> {
    let store = open_store(&config)?;
    let submission = Submission {
        id: uuid::Uuid::new_v4().to_string(),
        exam_id: Some(exam_id),
        student_id: Some(student_id),
        submitted_at: Some(chrono::Utc::now().to_rfc3339()),
        anchor_status: AnchorStatus::Pending,
        answers: AnswerSet::List(vec![
            Answer::new("q_1", "A"),
            Answer::new("q_2", "C"),
            Answer::new("q_3", "B"),
        ]),
        ..Default::default()
    };

    store.insert(&submission).await?;
    println!("{}", submission.id);
    Ok(())
}

fn hash_file(file: &Path, id: Option<String>) -> Result<()> {
    let raw =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?;
    let mut submission: Submission =
        serde_json::from_str(&raw).with_context(|| format!("Invalid submission in {:?}", file))?;
    if let Some(id) = id {
        submission.id = id;
    }

    let canonical = canonicalize(&submission);
    println!("{}", String::from_utf8_lossy(&canonical));
    println!("{}", hash_canonical(&canonical));
    Ok(())
}
