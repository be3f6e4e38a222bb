//! Command-line interface for agentkit.
//!
//! Each long-running role (poller, worker, auditor) can run as its own
//! process against a shared SQLite store, or all together with `run`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{ResolvedConfig, StoreBackend};
use crate::core::{
    generate_worker_name, AuditLedger, Auditor, Routing, Worker, WorkerConfig, WorkerStats,
};
use crate::domain::TaskKind;
use crate::handlers::HandlerSet;
use crate::ingest::{CommandValidator, FileSource, Producer};
use crate::market::{MarketError, Marketplace, StartPosition};

/// agentkit - Command-to-task marketplace for agents
#[derive(Parser, Debug)]
#[command(name = "agentkit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the command file and enqueue tasks
    Produce {
        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Claim and execute tasks
    Work {
        /// Worker name reported in results (random if not given)
        #[arg(short, long)]
        name: Option<String>,

        /// Only handle these kinds (comma-separated, e.g. SCAN_SITE,SYNC_AUDIENCE)
        #[arg(short, long, value_delimiter = ',')]
        kinds: Vec<String>,

        /// Claim any kind and put back tasks without a handler
        #[arg(long)]
        shared: bool,
    },

    /// Record results in the audit ledger
    Audit {
        /// Replay every stored result before following new ones
        #[arg(long)]
        replay: bool,
    },

    /// Run poller, workers and auditor in this process
    Run {
        /// Number of workers
        #[arg(short, long, default_value = "2")]
        workers: usize,
    },

    /// Validate a command and append it to the command file
    Submit {
        /// Command line, e.g. SCAN_SITE domain=example.com
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Engage the kill switch
    Kill,

    /// Show task counts and kill switch state
    Status,

    /// Show audit ledger entries
    Ledger {
        /// Show only the last N entries
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Delete finished tasks older than the retention window
    Purge {
        /// Override the configured retention (hours)
        #[arg(long)]
        hours: Option<i64>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = ResolvedConfig::load()?;

        match self.command {
            Commands::Produce { once } => produce(&cfg, once).await,
            Commands::Work {
                name,
                kinds,
                shared,
            } => work(&cfg, name, &kinds, shared).await,
            Commands::Audit { replay } => audit(&cfg, replay).await,
            Commands::Run { workers } => run_all(&cfg, workers).await,
            Commands::Submit { command } => submit(&cfg, &command.join(" ")).await,
            Commands::Kill => kill(&cfg).await,
            Commands::Status => show_status(&cfg).await,
            Commands::Ledger { limit } => show_ledger(&cfg, limit).await,
            Commands::Purge { hours } => purge(&cfg, hours).await,
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Open the marketplace for a role running as its own process
fn open_shared_market(cfg: &ResolvedConfig) -> Result<Marketplace> {
    if cfg.store.backend == StoreBackend::Memory {
        warn!("Memory store is private to this process; use `agentkit run` or the sqlite backend");
    }
    cfg.open_marketplace()
}

/// Shutdown channel flipped on Ctrl-C
fn shutdown_on_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = tx.send(true);
        }
    });
    rx
}

fn build_producer(cfg: &ResolvedConfig, market: &Marketplace) -> Producer {
    let source = Arc::new(FileSource::new(&cfg.poller.command_file));
    Producer::new(source, market.clone(), cfg.poller.interval)
}

fn build_worker(
    cfg: &ResolvedConfig,
    market: &Marketplace,
    name: String,
    kinds: &[TaskKind],
    routing: Routing,
) -> Result<Worker> {
    let mut handlers = HandlerSet::builtin(cfg.content_distributor())?;
    if !kinds.is_empty() {
        handlers = handlers.only(kinds);
    }
    let config = WorkerConfig {
        name,
        claim_timeout: cfg.worker.claim_timeout,
        retry: cfg.worker.retry.clone(),
        routing,
    };
    Ok(Worker::new(market.clone(), handlers, config))
}

async fn attach_auditor(cfg: &ResolvedConfig, market: &Marketplace, replay: bool) -> Result<Auditor> {
    let from = if replay {
        StartPosition::Beginning
    } else {
        StartPosition::Latest
    };
    let ledger = AuditLedger::new(&cfg.auditor.ledger_path);
    Auditor::attach(market, ledger, cfg.auditor.signed_by.clone(), from)
        .await
        .context("Failed to subscribe to results")
}

fn parse_kinds(kinds: &[String]) -> Result<Vec<TaskKind>> {
    kinds
        .iter()
        .map(|k| {
            let kind: TaskKind = k
                .parse()
                .with_context(|| format!("Invalid task kind: {}", k))?;
            if kind == TaskKind::KillSwitch {
                bail!("{} is not executed by workers", kind);
            }
            Ok(kind)
        })
        .collect()
}

/// Poll the command file
async fn produce(cfg: &ResolvedConfig, once: bool) -> Result<()> {
    let market = open_shared_market(cfg)?;
    let mut producer = build_producer(cfg, &market);

    if once {
        let report = producer.poll_once().await?;
        println!(
            "Read {} lines: {} enqueued, {} duplicates, {} already queued, {} rejected",
            report.read, report.enqueued, report.duplicates, report.already_queued, report.rejected
        );
        if report.halted {
            println!("Kill switch is engaged");
        }
        return Ok(());
    }

    producer.run(shutdown_on_interrupt()).await?;
    Ok(())
}

/// Run a worker until shutdown or kill switch
async fn work(cfg: &ResolvedConfig, name: Option<String>, kinds: &[String], shared: bool) -> Result<()> {
    let market = open_shared_market(cfg)?;
    let kinds = parse_kinds(kinds)?;
    let routing = if shared { Routing::Shared } else { Routing::Topic };
    let name = name.unwrap_or_else(generate_worker_name);
    let worker = build_worker(cfg, &market, name, &kinds, routing)?;

    let stats = worker.run(shutdown_on_interrupt()).await?;
    print_stats(worker.name(), &stats);
    Ok(())
}

/// Follow the result bus into the ledger
async fn audit(cfg: &ResolvedConfig, replay: bool) -> Result<()> {
    let market = open_shared_market(cfg)?;
    let auditor = attach_auditor(cfg, &market, replay || cfg.auditor.replay).await?;
    let recorded = auditor.run(shutdown_on_interrupt()).await?;
    println!("Recorded {} results", recorded);
    Ok(())
}

async fn join_workers(
    workers: &mut JoinSet<(String, Result<WorkerStats, MarketError>)>,
) -> Result<Vec<(String, WorkerStats)>> {
    let mut all = Vec::new();
    while let Some(joined) = workers.join_next().await {
        let (name, stats) = joined.context("Worker task panicked")?;
        all.push((name, stats?));
    }
    Ok(all)
}

/// Everything in one process over one marketplace
async fn run_all(cfg: &ResolvedConfig, worker_count: usize) -> Result<()> {
    if worker_count == 0 {
        bail!("At least one worker is required");
    }
    let market = cfg.open_marketplace()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Subscribe before any worker can publish.
    let auditor = attach_auditor(cfg, &market, cfg.auditor.replay).await?;
    let auditor_handle = tokio::spawn(auditor.run(shutdown_rx.clone()));

    let mut producer = build_producer(cfg, &market);
    let producer_rx = shutdown_rx.clone();
    let producer_handle = tokio::spawn(async move { producer.run(producer_rx).await });

    let mut workers = JoinSet::new();
    for i in 1..=worker_count {
        let worker = build_worker(cfg, &market, format!("worker-{}", i), &[], Routing::Topic)?;
        let rx = shutdown_rx.clone();
        workers.spawn(async move {
            let stats = worker.run(rx).await;
            (worker.name().to_string(), stats)
        });
    }
    info!(workers = worker_count, "Marketplace running");

    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for interrupt")?;
            info!("Interrupt received, shutting down");
            None
        }
        stats = join_workers(&mut workers) => Some(stats?),
    };
    let _ = shutdown_tx.send(true);

    let stats = match finished {
        Some(stats) => stats,
        None => join_workers(&mut workers).await?,
    };
    producer_handle.await.context("Poller task panicked")??;
    let recorded = auditor_handle.await.context("Auditor task panicked")??;

    for (name, s) in &stats {
        print_stats(name, s);
    }
    println!("Auditor recorded {} results", recorded);
    Ok(())
}

/// Validate a command line and append it to the command file
async fn submit(cfg: &ResolvedConfig, line: &str) -> Result<()> {
    let command = CommandValidator::new()
        .parse(line)
        .with_context(|| format!("Rejected command: {}", line))?;

    let source = FileSource::new(&cfg.poller.command_file);
    source.ensure_exists().await?;
    append_line(source.path(), command.raw()).await?;

    println!("Queued for next poll: {}", command.raw());
    println!("Command file: {}", source.path().display());
    Ok(())
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open command file: {}", path.display()))?;
    file.write_all(format!("{}\n", line).as_bytes())
        .await
        .with_context(|| format!("Failed to write command file: {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

async fn kill(cfg: &ResolvedConfig) -> Result<()> {
    let market = open_shared_market(cfg)?;
    market.kill_switch.engage().await?;
    println!("Kill switch engaged");
    Ok(())
}

async fn show_status(cfg: &ResolvedConfig) -> Result<()> {
    let market = open_shared_market(cfg)?;
    let counts = market.queue.counts().await?;
    let engaged = market.kill_switch.is_engaged().await?;

    println!("{:<10} {:>8}", "STATUS", "TASKS");
    println!("{}", "-".repeat(19));
    println!("{:<10} {:>8}", "pending", counts.pending);
    println!("{:<10} {:>8}", "claimed", counts.claimed);
    println!("{:<10} {:>8}", "done", counts.done);
    println!("{:<10} {:>8}", "failed", counts.failed);
    println!("{:<10} {:>8}", "total", counts.total());
    println!();
    println!("Kill switch: {}", if engaged { "ENGAGED" } else { "inactive" });
    Ok(())
}

async fn show_ledger(cfg: &ResolvedConfig, limit: Option<usize>) -> Result<()> {
    let ledger = AuditLedger::new(&cfg.auditor.ledger_path);
    let entries = ledger.entries().await?;
    if entries.is_empty() {
        println!("No ledger entries");
        return Ok(());
    }

    let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
    println!(
        "{:<26} {:<14} {:<8} {:<14} {}",
        "TIMESTAMP", "JOB ID", "RESULT", "SIGNED BY", "SUBJECT"
    );
    println!("{}", "-".repeat(90));
    for entry in entries.iter().skip(skip) {
        println!(
            "{:<26} {:<14} {:<8} {:<14} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.job_id,
            entry.result,
            entry.signed_by,
            entry.subject
        );
    }
    Ok(())
}

async fn purge(cfg: &ResolvedConfig, hours: Option<i64>) -> Result<()> {
    let retention = hours.map(chrono::Duration::hours).unwrap_or(cfg.retention);
    let market = open_shared_market(cfg)?;
    let removed = market.queue.purge(retention).await?;
    println!(
        "Removed {} finished tasks older than {} hours",
        removed,
        retention.num_hours()
    );
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("agentkit configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:          {}", cfg.home.display());
    println!("  Store:         {} ({:?})", cfg.store.path.display(), cfg.store.backend);
    println!("  Command file:  {}", cfg.poller.command_file.display());
    println!("  Ledger:        {}", cfg.auditor.ledger_path.display());
    println!("  Content base:  {}", cfg.content.base_dir.display());
    println!();
    println!("Poller interval: {}s", cfg.poller.interval.as_secs());
    println!("Claim timeout:   {}s", cfg.worker.claim_timeout.as_secs());
    println!(
        "Retry:           {} attempts, {}ms initial, x{} backoff, {}ms max",
        cfg.worker.retry.max_attempts,
        cfg.worker.retry.initial_delay_ms,
        cfg.worker.retry.backoff_multiplier,
        cfg.worker.retry.max_delay_ms
    );
    println!("Retention:       {}h", cfg.retention.num_hours());
    println!("Auditor:         {} (replay: {})", cfg.auditor.signed_by, cfg.auditor.replay);
    println!("Platforms:       {}", cfg.content.platforms.join(", "));
    Ok(())
}

fn print_stats(name: &str, stats: &WorkerStats) {
    println!(
        "{}: {} succeeded, {} failed, {} retries, {} requeued",
        name, stats.succeeded, stats.failed, stats.retries, stats.requeued
    );
}
