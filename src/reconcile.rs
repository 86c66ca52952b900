// =============================================================================
// Reconciler — WAL × exchange state repair
// =============================================================================
//
// Runs at startup and on a slow timer.  The WAL says what the engine meant to
// do; the exchange says what actually exists.  Reconciliation makes the
// in-memory book agree with both:
//
//   1. Replay the WAL: open intents I, committed/adopted open positions C.
//   2. Fetch the exchange position list E.
//   3. e ∈ E with no entry in C           -> GHOST: adopt it, write
//      GHOST_ADOPTED (tagged with the intent id when the symbol matches an
//      open intent), and attach an emergency stop 1% from mark.
//   4. c ∈ C with no matching e           -> dead record: invalidated with a
//      FAILED closure entry.
//   5. (c, e) with quantity drift          -> the exchange quantity wins.
//
// Contract on return: every open position in the book carries a protective
// stop order id, or an attempt to create one was just made and alerted on
// failure.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::exchange::{ExchangePort, ExchangePosition};
use crate::limiter::{Endpoint, RateLimiter};
use crate::notify::Notifier;
use crate::positions::{Position, PositionManager};
use crate::wal::{fold_state, Wal, WalEntry};

/// Confidence assigned to adopted ghosts; sized conservatively downstream.
const GHOST_CONFIDENCE: f64 = 85.0;
/// Emergency stop distance from mark price, percent.
const EMERGENCY_STOP_PCT: f64 = 1.0;
/// Attempts for the emergency stop before alerting.
const EMERGENCY_STOP_ATTEMPTS: u32 = 3;

/// Quantity drift beyond this relative tolerance adopts the exchange value.
const QTY_TOLERANCE: f64 = 0.01;

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub matched: u32,
    pub ghosts_adopted: u32,
    pub dead_records: u32,
    pub quantity_divergences: u32,
    pub recovered: u32,
}

pub struct Reconciler {
    port: Arc<dyn ExchangePort>,
    limiter: Arc<RateLimiter>,
    wal: Arc<Wal>,
    positions: Arc<PositionManager>,
    notifier: Arc<dyn Notifier>,
    recovery_enabled: bool,
}

impl Reconciler {
    pub fn new(
        port: Arc<dyn ExchangePort>,
        limiter: Arc<RateLimiter>,
        wal: Arc<Wal>,
        positions: Arc<PositionManager>,
        notifier: Arc<dyn Notifier>,
        recovery_enabled: bool,
    ) -> Self {
        Self {
            port,
            limiter,
            wal,
            positions,
            notifier,
            recovery_enabled,
        }
    }

    /// Run one reconciliation pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        info!("reconciliation pass started");

        let entries = self.wal.replay().context("reconcile: WAL replay failed")?;
        let state = fold_state(&entries);

        if !self.limiter.allow(Endpoint::Positions) {
            anyhow::bail!("reconcile: rate limited fetching positions");
        }
        let live = self
            .port
            .list_positions()
            .await
            .context("reconcile: failed to fetch exchange positions")?;
        let live_by_symbol: HashMap<&str, &ExchangePosition> =
            live.iter().map(|p| (p.symbol.as_str(), p)).collect();

        let mut report = ReconcileReport::default();

        // --- Exchange side: ghosts, recoveries, quantity drift -----------
        for exchange_pos in &live {
            let symbol = exchange_pos.symbol.as_str();

            if let Some(wal_open) = state.open_positions.get(symbol) {
                report.matched += 1;
                self.recover_or_check(wal_open, exchange_pos, &mut report)
                    .await?;
                continue;
            }

            if self.positions.contains(symbol) {
                // In the book but not yet terminal in the WAL; the open flow
                // owns it.
                report.matched += 1;
                continue;
            }

            // No committed record: a ghost.
            if !self.recovery_enabled {
                warn!(symbol, qty = exchange_pos.quantity, "ghost detected — recovery disabled");
                self.notifier.send_risk_alert(&format!(
                    "ghost position on {symbol} (qty {:.6}) left untouched: recovery disabled",
                    exchange_pos.quantity
                ));
                continue;
            }

            self.adopt_ghost(exchange_pos, &state.open_intents, &mut report)
                .await?;
        }

        // --- WAL side: dead records --------------------------------------
        for (symbol, wal_open) in &state.open_positions {
            if live_by_symbol.contains_key(symbol.as_str()) {
                continue;
            }
            if self.positions.contains(symbol) {
                // The monitoring pass records the closure with a proper exit
                // price.
                continue;
            }
            warn!(
                symbol,
                wal_id = %wal_open.id,
                "committed position has no exchange counterpart — dead record"
            );
            self.wal
                .append(&WalEntry::dead_record(&wal_open.id, symbol))?;
            report.dead_records += 1;
        }

        // Semantic halts expire at reconciliation.
        self.positions.clear_halts();

        info!(
            matched = report.matched,
            ghosts = report.ghosts_adopted,
            dead = report.dead_records,
            drift = report.quantity_divergences,
            recovered = report.recovered,
            "reconciliation pass completed"
        );
        Ok(report)
    }

    /// The WAL and the exchange agree a position exists.  Make sure the book
    /// holds it and the quantities line up; the exchange is authoritative.
    async fn recover_or_check(
        &self,
        wal_open: &WalEntry,
        exchange_pos: &ExchangePosition,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let symbol = &exchange_pos.symbol;
        let wal_qty = wal_open.payload.quantity.unwrap_or(0.0);

        let drifted = wal_qty > 0.0
            && ((exchange_pos.quantity - wal_qty).abs() / wal_qty) > QTY_TOLERANCE;
        if drifted {
            warn!(
                symbol,
                wal_qty,
                exchange_qty = exchange_pos.quantity,
                "quantity divergence — adopting exchange value"
            );
            report.quantity_divergences += 1;
        }

        if self.positions.contains(symbol) {
            if drifted {
                self.positions
                    .adopt_quantity(symbol, exchange_pos.quantity);
            }
            return Ok(());
        }

        // Book lost it (restart): rebuild from the WAL record with the
        // exchange quantity.
        let position = Position {
            wal_id: wal_open.id.clone(),
            symbol: symbol.clone(),
            side: exchange_pos.side,
            quantity: exchange_pos.quantity,
            entry_price: wal_open
                .payload
                .fill_price
                .or(wal_open.payload.entry_price)
                .unwrap_or(exchange_pos.entry_price),
            opened_at: wal_open.timestamp,
            leverage: wal_open.payload.leverage.unwrap_or(exchange_pos.leverage),
            confidence: wal_open.payload.confidence.unwrap_or(GHOST_CONFIDENCE),
            stop_order_id: wal_open.payload.stop_order_id.clone(),
            take_profit_order_id: wal_open.payload.take_profit_order_id.clone(),
        };

        let has_stop = position.stop_order_id.is_some();
        info!(
            symbol,
            wal_id = %position.wal_id,
            qty = position.quantity,
            has_stop,
            "committed position recovered into the book"
        );
        self.positions
            .insert_managed(position, exchange_pos.mark_price);
        report.recovered += 1;

        if !has_stop {
            // Committed without a recorded guard; treat like a ghost's stop.
            self.attach_emergency_stop(exchange_pos).await;
        }
        Ok(())
    }

    /// Adopt an exchange position with no committed record.
    async fn adopt_ghost(
        &self,
        exchange_pos: &ExchangePosition,
        open_intents: &HashMap<String, WalEntry>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let symbol = &exchange_pos.symbol;
        let matching_intent = open_intents.get(symbol.as_str()).map(|e| e.id.as_str());

        let adoption = WalEntry::ghost_adopted(
            matching_intent,
            symbol,
            exchange_pos.side,
            exchange_pos.quantity,
            exchange_pos.entry_price,
            GHOST_CONFIDENCE,
        );
        self.wal.append(&adoption)?;

        warn!(
            symbol,
            qty = exchange_pos.quantity,
            intent = matching_intent.unwrap_or("none"),
            "ghost position adopted"
        );
        self.notifier.send_risk_alert(&format!(
            "ghost position adopted on {symbol} (qty {:.6}, side {})",
            exchange_pos.quantity, exchange_pos.side
        ));

        let mut position = Position {
            wal_id: adoption.id.clone(),
            symbol: symbol.clone(),
            side: exchange_pos.side,
            quantity: exchange_pos.quantity,
            entry_price: if exchange_pos.entry_price > 0.0 {
                exchange_pos.entry_price
            } else {
                exchange_pos.mark_price
            },
            opened_at: Utc::now(),
            leverage: exchange_pos.leverage,
            confidence: GHOST_CONFIDENCE,
            stop_order_id: None,
            take_profit_order_id: None,
        };

        position.stop_order_id = self.attach_emergency_stop(exchange_pos).await;
        self.positions
            .insert_managed(position, exchange_pos.mark_price);
        report.ghosts_adopted += 1;
        Ok(())
    }

    /// Place a reduce-only stop 1% from mark on the protective side.
    /// Alerts when every attempt fails; reconciliation will try again.
    async fn attach_emergency_stop(&self, exchange_pos: &ExchangePosition) -> Option<String> {
        let symbol = &exchange_pos.symbol;
        let stop_price = match exchange_pos.side {
            crate::types::Side::Long => exchange_pos.mark_price * (1.0 - EMERGENCY_STOP_PCT / 100.0),
            crate::types::Side::Short => exchange_pos.mark_price * (1.0 + EMERGENCY_STOP_PCT / 100.0),
        };

        for attempt in 0..EMERGENCY_STOP_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            if !self.limiter.allow(Endpoint::Orders) {
                continue;
            }
            match self
                .port
                .submit_stop_order(symbol, exchange_pos.side, stop_price, exchange_pos.quantity)
                .await
            {
                Ok(ack) => {
                    info!(symbol, stop_price, order_id = %ack.order_id, "emergency stop attached");
                    return Some(ack.order_id);
                }
                Err(e) => {
                    warn!(symbol, attempt, error = %e, "emergency stop attempt failed");
                }
            }
        }

        self.notifier.send_risk_alert(&format!(
            "FAILED to attach emergency stop on {symbol} — position is unguarded"
        ));
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, TradingConfig};
    use crate::exchange::mock::{MockExchange, RecordedOrder};
    use crate::notify::testing::RecordingNotifier;
    use crate::types::Side;
    use crate::wal::WalStatus;

    struct Fixture {
        port: Arc<MockExchange>,
        wal: Arc<Wal>,
        notifier: Arc<RecordingNotifier>,
        positions: Arc<PositionManager>,
        reconciler: Reconciler,
        _dir: tempfile::TempDir,
    }

    fn fixture(recovery_enabled: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let port = Arc::new(MockExchange::new());
        let wal = Arc::new(Wal::open(dir.path().join("trade.wal")).unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let limiter = Arc::new(RateLimiter::new(&LimitsConfig::default()));
        let positions = Arc::new(PositionManager::new(
            port.clone(),
            limiter.clone(),
            wal.clone(),
            notifier.clone(),
            TradingConfig::default(),
        ));
        let reconciler = Reconciler::new(
            port.clone(),
            limiter,
            wal.clone(),
            positions.clone(),
            notifier.clone(),
            recovery_enabled,
        );
        Fixture {
            port,
            wal,
            notifier,
            positions,
            reconciler,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn ghost_is_adopted_with_emergency_stop() {
        let f = fixture(true);
        // Empty WAL, one live exchange position.
        *f.port.positions.write() =
            vec![MockExchange::position("XUSDT", Side::Long, 0.02, 100.0, 100.0)];

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.ghosts_adopted, 1);
        assert_eq!(f.positions.open_count(), 1);

        // Exactly one GHOST_ADOPTED entry for X.
        let entries = f.wal.replay().unwrap();
        let ghosts: Vec<_> = entries
            .iter()
            .filter(|e| e.status == WalStatus::GhostAdopted)
            .collect();
        assert_eq!(ghosts.len(), 1);
        assert_eq!(ghosts[0].symbol, "XUSDT");
        assert_eq!(ghosts[0].payload.confidence, Some(85.0));

        // Protective stop at 1% from mark on the protective side.
        let stops: Vec<_> = f
            .port
            .recorded()
            .into_iter()
            .filter_map(|o| match o {
                RecordedOrder::Stop { stop_price, qty, .. } => Some((stop_price, qty)),
                _ => None,
            })
            .collect();
        assert_eq!(stops.len(), 1);
        assert!((stops[0].0 - 99.0).abs() < 1e-9);
        assert!((stops[0].1 - 0.02).abs() < 1e-12);

        // Book entry carries the guard id: the completeness contract.
        let managed = f.positions.snapshot_positions().pop().unwrap();
        assert!(managed.position.stop_order_id.is_some());
        assert_eq!(managed.position.confidence, 85.0);
    }

    #[tokio::test]
    async fn ghost_with_open_intent_reuses_intent_id() {
        let f = fixture(true);
        let intent = WalEntry::intent("YUSDT", Side::Short, 1.0, 50.0, 10, 125.0);
        f.wal.append(&intent).unwrap();
        *f.port.positions.write() =
            vec![MockExchange::position("YUSDT", Side::Short, 1.0, 50.0, 50.0)];

        f.reconciler.reconcile().await.unwrap();

        let entries = f.wal.replay().unwrap();
        let ghost = entries
            .iter()
            .find(|e| e.status == WalStatus::GhostAdopted)
            .unwrap();
        assert_eq!(ghost.id, intent.id, "adoption must be tagged with the intent id");
        assert_eq!(
            ghost.payload.reason.as_deref(),
            Some("adopted against open intent")
        );
    }

    #[tokio::test]
    async fn dead_committed_record_is_invalidated() {
        let f = fixture(true);
        let intent = WalEntry::intent("ZUSDT", Side::Long, 1.0, 10.0, 10, 130.0);
        f.wal.append(&intent).unwrap();
        f.wal
            .append(&WalEntry::committed(&intent, 10.0, 1.0))
            .unwrap();
        // Exchange has nothing.

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.dead_records, 1);
        assert_eq!(f.positions.open_count(), 0);

        // Replay now shows no open positions.
        let state = fold_state(&f.wal.replay().unwrap());
        assert!(state.open_positions.is_empty());
    }

    #[tokio::test]
    async fn committed_position_is_recovered_after_restart() {
        let f = fixture(true);
        let intent = WalEntry::intent("WUSDT", Side::Long, 2.0, 25.0, 15, 132.0);
        f.wal.append(&intent).unwrap();
        let mut committed = WalEntry::committed(&intent, 25.1, 2.0);
        committed.payload.stop_order_id = Some("101".into());
        committed.payload.take_profit_order_id = Some("102".into());
        f.wal.append(&committed).unwrap();
        *f.port.positions.write() =
            vec![MockExchange::position("WUSDT", Side::Long, 2.0, 25.1, 25.3)];

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.ghosts_adopted, 0);

        let managed = f.positions.snapshot_positions().pop().unwrap();
        assert_eq!(managed.position.wal_id, intent.id);
        assert!((managed.position.entry_price - 25.1).abs() < 1e-9);
        assert_eq!(managed.position.leverage, 15);
        assert_eq!(managed.position.stop_order_id.as_deref(), Some("101"));
        // No fresh orders were needed: the recorded guard still stands.
        assert!(f.port.recorded().is_empty());
    }

    #[tokio::test]
    async fn quantity_divergence_adopts_exchange_value() {
        let f = fixture(true);
        let intent = WalEntry::intent("VUSDT", Side::Long, 1.0, 10.0, 10, 130.0);
        f.wal.append(&intent).unwrap();
        let mut committed = WalEntry::committed(&intent, 10.0, 1.0);
        committed.payload.stop_order_id = Some("7".into());
        f.wal.append(&committed).unwrap();
        *f.port.positions.write() =
            vec![MockExchange::position("VUSDT", Side::Long, 1.5, 10.0, 10.0)];

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.quantity_divergences, 1);

        let managed = f.positions.snapshot_positions().pop().unwrap();
        assert!((managed.position.quantity - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recovery_disabled_only_alerts() {
        let f = fixture(false);
        *f.port.positions.write() =
            vec![MockExchange::position("XUSDT", Side::Long, 0.02, 100.0, 100.0)];

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.ghosts_adopted, 0);
        assert_eq!(f.positions.open_count(), 0);
        assert_eq!(f.notifier.risk_alerts.lock().len(), 1);
        assert!(f.wal.replay().unwrap().is_empty());
    }

    #[tokio::test]
    async fn emergency_stop_failure_raises_alert_but_adopts() {
        let f = fixture(true);
        *f.port.fail_stop.write() = Some(crate::exchange::ExchangeError::Timeout);
        f.port
            .fail_stop_times
            .store(u64::MAX, std::sync::atomic::Ordering::Relaxed);
        *f.port.positions.write() =
            vec![MockExchange::position("XUSDT", Side::Long, 0.02, 100.0, 100.0)];

        let report = f.reconciler.reconcile().await.unwrap();
        assert_eq!(report.ghosts_adopted, 1);

        let managed = f.positions.snapshot_positions().pop().unwrap();
        assert!(managed.position.stop_order_id.is_none());
        let alerts = f.notifier.risk_alerts.lock();
        assert!(alerts.iter().any(|a| a.contains("unguarded")));
    }

    #[tokio::test]
    async fn reconcile_clears_symbol_halts() {
        let f = fixture(true);
        *f.port.fail_market.write() = Some(crate::exchange::ExchangeError::InsufficientMargin);
        let target = crate::scorer::Target {
            symbol: "TUSDT".into(),
            action: Side::Long,
            confidence_score: 125.0,
            entry_zone: 100.0,
            take_profit: 102.0,
            stop_loss: 99.0,
            size_multiplier: 1.0,
        };
        let _ = f.positions.open_from_target(&target).await;
        assert!(f.positions.is_halted("TUSDT"));

        f.reconciler.reconcile().await.unwrap();
        assert!(!f.positions.is_halted("TUSDT"));
    }

    #[tokio::test]
    async fn short_ghost_gets_stop_above_mark() {
        let f = fixture(true);
        *f.port.positions.write() =
            vec![MockExchange::position("SUSDT", Side::Short, 3.0, 200.0, 200.0)];

        f.reconciler.reconcile().await.unwrap();

        let stop = f
            .port
            .recorded()
            .into_iter()
            .find_map(|o| match o {
                RecordedOrder::Stop { stop_price, .. } => Some(stop_price),
                _ => None,
            })
            .unwrap();
        assert!((stop - 202.0).abs() < 1e-9, "short stop must sit above mark");
    }
}
