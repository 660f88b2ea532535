//! `keepsake`: drive the memory consolidation engine from a terminal.
//!
//! `check` runs the attention gate alone; `ingest` pipes utterances from
//! stdin through the full gate → store → enrichment path and can finish
//! with a consolidation cycle; `daemon` keeps the process alive with the
//! scheduled consolidator until ctrl-c.

mod embedder;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keepsake_config::AppConfig;
use keepsake_llm::{AbortHandle, LlmClient};
use keepsake_memory::gate;
use keepsake_memory::{
    Extractor, MemoryEngine, MemoryGraph, SleepProgress, SpeakerRole, spawn_consolidation_task,
};

#[derive(Parser)]
#[command(name = "keepsake", about = "Long-term memory consolidation engine")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "keepsake.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    User,
    Assistant,
}

impl From<Role> for SpeakerRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => SpeakerRole::User,
            Role::Assistant => SpeakerRole::Assistant,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the attention gate over a single text and explain the verdict.
    Check {
        #[arg(long, value_enum, default_value = "user")]
        role: Role,
        text: String,
    },
    /// Ingest utterances from stdin (one per line), then optionally
    /// consolidate and print store statistics.
    Ingest {
        #[arg(long, value_enum, default_value = "user")]
        role: Role,
        /// Run one sleep cycle after ingesting.
        #[arg(long)]
        sleep: bool,
        /// Enable core promotion during the sleep cycle.
        #[arg(long)]
        promote: bool,
    },
    /// Run the scheduled consolidator until ctrl-c.
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .init();

    match cli.command {
        Command::Check { role, text } => check(role, &text),
        Command::Ingest { role, sleep, promote } => {
            ingest(&config, role, sleep, promote).await?;
        }
        Command::Daemon => daemon(&config).await?,
    }
    Ok(())
}

fn check(role: Role, text: &str) {
    let verdict = match role {
        Role::User => gate::user_gate(text),
        Role::Assistant => gate::assistant_gate(text),
    };
    match verdict {
        Ok(()) => println!("pass"),
        Err(rejection) => println!("reject: {}", rejection.as_str()),
    }
}

fn build_engine(config: &AppConfig) -> Arc<MemoryEngine> {
    let oracle = Arc::new(LlmClient::new(config.extraction.clone()));
    let extractor = Arc::new(Extractor::new(config.extraction.clone(), oracle));
    Arc::new(MemoryEngine::new(
        Arc::new(MemoryGraph::new()),
        extractor,
        embedder::hashed_embedder(),
        config.agent.agent_id.clone(),
    ))
}

async fn ingest(config: &AppConfig, role: Role, sleep: bool, promote: bool) -> Result<()> {
    let engine = build_engine(config);

    let mut stored = 0usize;
    let mut rejected = 0usize;
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match engine.ingest(&line, role.into()).await? {
            Some(_) => stored += 1,
            None => rejected += 1,
        }
    }
    info!(stored, rejected, "ingest finished");

    if sleep {
        let mut sleep_config = config.sleep.clone();
        sleep_config.skip_promotion = !promote;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<SleepProgress>();
        let reporter = tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                println!("[{}] {}", event.phase.label(), event.message);
            }
        });

        let (_abort, signal) = AbortHandle::new();
        let result = engine.run_sleep_cycle(sleep_config, signal, Some(progress_tx)).await;
        let _ = reporter.await;
        println!(
            "cycle: {} merges, {} semantic dedups, {} conflicts resolved, \
             {} promoted, {} pruned, {} noise purged in {} ms",
            result.vector_merges,
            result.semantic_invalidated,
            result.conflicts_invalidated,
            result.promoted_to_core,
            result.memories_pruned,
            result.noise_purged,
            result.duration_ms,
        );
    }

    let stats = engine.stats().await?;
    println!(
        "store: {} memories ({} pending, {} complete, {} failed, {} skipped)",
        stats.total_memories,
        stats.extraction.pending,
        stats.extraction.complete,
        stats.extraction.failed,
        stats.extraction.skipped,
    );
    Ok(())
}

async fn daemon(config: &AppConfig) -> Result<()> {
    let engine = build_engine(config);
    let (shutdown_tx, _) = watch::channel(false);
    let task = spawn_consolidation_task(
        Arc::clone(&engine),
        &shutdown_tx,
        config.scheduler.clone(),
        config.sleep.clone(),
    );
    info!(
        interval_hours = config.scheduler.interval_hours,
        quiet_start = config.scheduler.quiet_start_hour,
        quiet_end = config.scheduler.quiet_end_hour,
        "consolidation daemon running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.shutdown();
    let _ = shutdown_tx.send(true);
    if let Err(err) = task.await {
        warn!(?err, "consolidation task ended abnormally");
    }
    Ok(())
}
