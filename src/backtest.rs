// =============================================================================
// WAL Replay Report — terminal-status census and outcome stats
// =============================================================================
//
// `backtest --wal <path> --threshold <f>` replays a WAL file and summarises
// what the engine actually did: record counts per status, realized outcomes
// of committed closures, and the win rate among trades whose opening
// confidence cleared the given threshold.  No market data is simulated.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::wal::{Wal, WalEntry, WalStatus};

/// Aggregated view of one WAL file.
#[derive(Debug, Default, Serialize)]
pub struct BacktestReport {
    pub total_records: usize,
    pub intents: usize,
    pub committed_opens: usize,
    pub failures: usize,
    pub ghost_adoptions: usize,
    pub closures: usize,
    /// Closures whose opening confidence cleared the threshold.
    pub qualified_closures: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_pnl: f64,
    pub win_rate_pct: f64,
    pub confidence_threshold: f64,
}

/// Replay `path` and fold it into a report.
pub fn run(path: impl AsRef<Path>, confidence_threshold: f64) -> Result<BacktestReport> {
    let entries = Wal::replay_path(path)?;
    Ok(fold_report(&entries, confidence_threshold))
}

fn fold_report(entries: &[WalEntry], confidence_threshold: f64) -> BacktestReport {
    let mut report = BacktestReport {
        total_records: entries.len(),
        confidence_threshold,
        ..BacktestReport::default()
    };

    // Opening confidence by id, for joining closures back to their entries.
    let mut confidence_by_id: HashMap<&str, f64> = HashMap::new();

    for entry in entries {
        match entry.status {
            WalStatus::Intent => {
                report.intents += 1;
                if let Some(c) = entry.payload.confidence {
                    confidence_by_id.insert(&entry.id, c);
                }
            }
            WalStatus::Committed if entry.payload.closes.is_none() => {
                report.committed_opens += 1;
                if let Some(c) = entry.payload.confidence {
                    confidence_by_id.insert(&entry.id, c);
                }
            }
            WalStatus::GhostAdopted => {
                report.ghost_adoptions += 1;
                if let Some(c) = entry.payload.confidence {
                    confidence_by_id.insert(&entry.id, c);
                }
            }
            WalStatus::Failed => {
                report.failures += 1;
            }
            WalStatus::Committed => {
                // A closure record.
                report.closures += 1;
                let opened_confidence = entry
                    .payload
                    .closes
                    .as_deref()
                    .and_then(|id| confidence_by_id.get(id))
                    .copied()
                    .unwrap_or(0.0);
                if opened_confidence < confidence_threshold {
                    continue;
                }

                report.qualified_closures += 1;
                let pnl = entry.payload.realized_pnl.unwrap_or(0.0);
                report.total_pnl += pnl;
                if pnl >= 0.0 {
                    report.wins += 1;
                } else {
                    report.losses += 1;
                }
            }
        }
    }

    if report.qualified_closures > 0 {
        report.win_rate_pct = report.wins as f64 / report.qualified_closures as f64 * 100.0;
    }

    info!(
        records = report.total_records,
        closures = report.closures,
        qualified = report.qualified_closures,
        wins = report.wins,
        losses = report.losses,
        total_pnl = report.total_pnl,
        win_rate_pct = report.win_rate_pct,
        "WAL replay report"
    );
    report
}
