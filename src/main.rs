// =============================================================================
// Kestrel — autonomous perpetual-futures trading engine
// =============================================================================
//
// Subcommands:
//   run       start the engine (default)
//   audit     run preflight checks and exit
//   backtest  replay a WAL file and print outcome stats
//
// Exit codes: 0 normal, 1 fatal, 2 preflight failed.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod audit;
mod backtest;
mod config;
mod engine;
mod exchange;
mod indicators;
mod limiter;
mod notify;
mod policy;
mod positions;
mod reconcile;
mod scorer;
mod screener;
mod session;
mod state;
mod trailing;
mod types;
mod wal;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::BotConfig;
use crate::engine::Engine;
use crate::exchange::binance::BinanceFutures;
use crate::notify::LogNotifier;

const EXIT_FATAL: i32 = 1;
const EXIT_PREFLIGHT_FAILED: i32 = 2;

#[derive(Parser)]
#[command(name = "kestrel", about = "Autonomous perpetual-futures trading engine")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the trading engine (default).
    Run,
    /// Run preflight checks and exit.
    Audit,
    /// Replay a WAL file and print outcome statistics.
    Backtest {
        /// WAL file to replay.
        #[arg(long)]
        wal: PathBuf,
        /// Only count trades whose opening confidence cleared this value.
        #[arg(long, default_value_t = 0.0)]
        threshold: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = BotConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, path = %cli.config.display(), "failed to load config, using defaults");
        BotConfig::default()
    });

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_engine(config).await,
        Command::Audit => run_audit(&config),
        Command::Backtest { wal, threshold } => run_backtest(&wal, threshold),
    }
}

// ── run ──────────────────────────────────────────────────────────────────────

async fn run_engine(config: BotConfig) -> anyhow::Result<()> {
    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Kestrel Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // A broken calendar would misprice every tick; refuse to start.
    let preflight = audit::run_preflight(&config)?;
    if !preflight.passed() {
        for failure in &preflight.failures {
            error!(check = %failure, "preflight failure");
        }
        error!("refusing to trade with a failing preflight — run `kestrel audit`");
        std::process::exit(EXIT_PREFLIGHT_FAILED);
    }

    let api_key = std::env::var("KESTREL_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("KESTREL_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("exchange credentials missing — signed endpoints will fail until provided");
    }
    let port = Arc::new(BinanceFutures::new(api_key, api_secret));

    info!(
        interval_secs = config.trading.trading_interval_seconds,
        max_open = config.trading.max_open_positions,
        sessions = config.sessions.len(),
        "engine configured"
    );

    let engine = Arc::new(Engine::new(config, port, Arc::new(LogNotifier))?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received — stopping gracefully");
                shutdown.cancel();
            }
        });
    }

    match engine.run(shutdown).await {
        Ok(()) => {
            info!("Kestrel shut down complete.");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "engine terminated with a fatal error");
            std::process::exit(EXIT_FATAL);
        }
    }
}

// ── audit ────────────────────────────────────────────────────────────────────

fn run_audit(config: &BotConfig) -> anyhow::Result<()> {
    let report = audit::run_preflight(config)?;

    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if report.passed() {
        println!("preflight passed ({} warnings)", report.warnings.len());
        Ok(())
    } else {
        for failure in &report.failures {
            println!("FAILURE: {failure}");
        }
        std::process::exit(EXIT_PREFLIGHT_FAILED);
    }
}

// ── backtest ─────────────────────────────────────────────────────────────────

fn run_backtest(wal: &PathBuf, threshold: f64) -> anyhow::Result<()> {
    match backtest::run(wal, threshold) {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, wal = %wal.display(), "backtest failed");
            std::process::exit(EXIT_FATAL);
        }
    }
}
