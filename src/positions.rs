// =============================================================================
// Position Manager — sizing, leverage, opening, guarding, rotation, closing
// =============================================================================
//
// Owns the in-memory book of live positions, sharded by symbol.  Every open
// follows the same durable sequence:
//
//   1. INTENT to the WAL (fsynced)
//   2. set leverage
//   3. market order
//   4. reduce-only stop + take-profit guards (retried with backoff)
//   5. COMMITTED to the WAL with fill and guard ids
//
// A failed market order writes FAILED.  Guards that still fail after three
// attempts force a market close and a FAILED-with-cleanup record: a position
// never runs unguarded.
//
// Semantic rejections (margin, precision, position mode) halt the symbol
// until the next reconciliation.  The monitoring pass keeps trailing stops in
// sync with the exchange and detects positions closed from the other side.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TradingConfig;
use crate::exchange::{ExchangeError, ExchangePort};
use crate::limiter::{Endpoint, RateLimiter};
use crate::notify::Notifier;
use crate::scorer::Target;
use crate::trailing::TrailingState;
use crate::types::Side;
use crate::wal::{Wal, WalEntry};

/// Attempts for each protective guard before the cleanup close.
const GUARD_ATTEMPTS: u32 = 3;
/// Base delay for guard retry backoff.
const GUARD_RETRY_BASE_MS: u64 = 200;
/// A rotated-out position must be below this unrealized gain, percent.
const ROTATION_MAX_GAIN_PCT: f64 = 5.0;

// =============================================================================
// Position model
// =============================================================================

/// One live position as the engine tracks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// WAL id of the record that opened (or adopted) it.
    pub wal_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub leverage: u32,
    pub confidence: f64,
    pub stop_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
}

impl Position {
    /// Unleveraged price-move PnL, percent.
    pub fn unrealized_pnl_pct(&self, mark_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.direction() * (mark_price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Book entry: the position plus its trailing machine and last observation.
#[derive(Debug, Clone)]
pub struct ManagedPosition {
    pub position: Position,
    pub trailing: TrailingState,
    /// Stop price actually resting on the exchange, if known.
    pub placed_stop_price: Option<f64>,
    pub last_mark_price: f64,
}

// =============================================================================
// Manager
// =============================================================================

pub struct PositionManager {
    port: Arc<dyn ExchangePort>,
    limiter: Arc<RateLimiter>,
    wal: Arc<Wal>,
    notifier: Arc<dyn Notifier>,
    trading: TradingConfig,
    /// Live positions sharded by symbol.
    book: DashMap<String, ManagedPosition>,
    /// Symbols halted by semantic errors until the next reconciliation.
    halted: DashMap<String, String>,
}

impl PositionManager {
    pub fn new(
        port: Arc<dyn ExchangePort>,
        limiter: Arc<RateLimiter>,
        wal: Arc<Wal>,
        notifier: Arc<dyn Notifier>,
        trading: TradingConfig,
    ) -> Self {
        Self {
            port,
            limiter,
            wal,
            notifier,
            trading,
            book: DashMap::new(),
            halted: DashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Sizing and leverage
    // -------------------------------------------------------------------------

    /// Deterministic position notional in quote currency.
    pub fn position_notional(&self, confidence: f64, session_multiplier: f64) -> f64 {
        let base = self.trading.initial_capital * self.trading.aggression_factor;
        let confidence_factor = (confidence / 100.0).clamp(0.5, 1.5);
        (base * session_multiplier * confidence_factor).min(self.trading.max_position_usd)
    }

    /// Piecewise leverage ladder over confidence.
    pub fn leverage_for_confidence(confidence: f64) -> u32 {
        match confidence {
            c if c >= 150.0 => 25,
            c if c >= 130.0 => 20,
            c if c >= 120.0 => 15,
            _ => 10,
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn open_count(&self) -> usize {
        self.book.len()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.book.contains_key(symbol)
    }

    pub fn is_halted(&self, symbol: &str) -> bool {
        self.halted.contains_key(symbol)
    }

    /// Clear all semantic halts.  Called by the reconciler.
    pub fn clear_halts(&self) {
        let count = self.halted.len();
        if count > 0 {
            info!(count, "symbol halts cleared by reconciliation");
        }
        self.halted.clear();
    }

    pub fn snapshot_positions(&self) -> Vec<ManagedPosition> {
        self.book.iter().map(|e| e.value().clone()).collect()
    }

    /// Overwrite a book quantity with the exchange-reported value.  Used by
    /// the reconciler when drift exceeds tolerance.
    pub fn adopt_quantity(&self, symbol: &str, quantity: f64) {
        if let Some(mut managed) = self.book.get_mut(symbol) {
            info!(
                symbol,
                old_qty = managed.position.quantity,
                new_qty = quantity,
                "book quantity overwritten from exchange"
            );
            managed.position.quantity = quantity;
        }
    }

    fn halt(&self, symbol: &str, reason: &str) {
        warn!(symbol, reason, "symbol halted until next reconciliation");
        self.halted.insert(symbol.to_string(), reason.to_string());
        self.notifier
            .send_risk_alert(&format!("{symbol} halted: {reason}"));
    }

    // -------------------------------------------------------------------------
    // Open flow
    // -------------------------------------------------------------------------

    /// Open a position from an accepted target.  Durable sequence per the
    /// module header; returns the committed position.
    pub async fn open_from_target(&self, target: &Target) -> Result<Position> {
        let symbol = &target.symbol;

        if self.contains(symbol) {
            return Err(anyhow!("{symbol} already has an open position"));
        }
        if self.is_halted(symbol) {
            return Err(anyhow!("{symbol} is halted"));
        }

        let notional = self.position_notional(target.confidence_score, target.size_multiplier);
        let quantity = notional / target.entry_zone;
        if quantity <= 0.0 {
            return Err(anyhow!("computed quantity is zero for {symbol}"));
        }
        let leverage = Self::leverage_for_confidence(target.confidence_score);

        // 1. Durable intent before any exchange side effect.
        let intent = WalEntry::intent(
            symbol,
            target.action,
            quantity,
            target.entry_zone,
            leverage,
            target.confidence_score,
        );
        self.wal.append(&intent)?;

        // 2. Leverage must be in place before the order.
        if !self.limiter.allow(Endpoint::Leverage) {
            self.wal
                .append(&WalEntry::failed(&intent.id, symbol, "rate limited"))?;
            return Err(anyhow!("rate limited before leverage set"));
        }
        if let Err(e) = self.port.set_leverage(symbol, leverage).await {
            self.record_open_failure(&intent, &e, "set_leverage")?;
            return Err(anyhow!("set_leverage failed: {e}"));
        }

        // 3. Market entry.
        if !self.limiter.allow(Endpoint::Orders) {
            self.wal
                .append(&WalEntry::failed(&intent.id, symbol, "rate limited"))?;
            return Err(anyhow!("rate limited before market order"));
        }
        let ack = match self
            .port
            .submit_market_order(symbol, target.action, quantity, false)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.record_open_failure(&intent, &e, "market_order")?;
                return Err(anyhow!("market order failed: {e}"));
            }
        };
        let fill_price = ack.fill_price.unwrap_or(target.entry_zone);
        let filled_qty = if ack.filled_qty > 0.0 {
            ack.filled_qty
        } else {
            quantity
        };

        // 4. Protective guards; a failure here forces a cleanup close.
        let guards = self
            .place_guards(symbol, target, fill_price, filled_qty)
            .await;
        let (stop_order_id, take_profit_order_id) = match guards {
            Ok(ids) => ids,
            Err(e) => {
                self.cleanup_unguarded(&intent, target.action, filled_qty, &e)
                    .await?;
                return Err(anyhow!("guard placement failed, position cleaned up: {e}"));
            }
        };

        // 5. Commit.
        let mut committed = WalEntry::committed(&intent, fill_price, filled_qty);
        committed.payload.stop_order_id = Some(stop_order_id.clone());
        committed.payload.take_profit_order_id = Some(take_profit_order_id.clone());
        self.wal.append(&committed)?;

        let position = Position {
            wal_id: intent.id.clone(),
            symbol: symbol.clone(),
            side: target.action,
            quantity: filled_qty,
            entry_price: fill_price,
            opened_at: Utc::now(),
            leverage,
            confidence: target.confidence_score,
            stop_order_id: Some(stop_order_id),
            take_profit_order_id: Some(take_profit_order_id),
        };

        info!(
            symbol,
            side = %position.side,
            quantity = position.quantity,
            fill_price,
            leverage,
            confidence = position.confidence,
            "position opened and guarded"
        );
        self.notifier.send_trade(&format!(
            "OPEN {} {} qty={:.6} @ {:.4} lev={}x conf={:.0}",
            position.side, symbol, position.quantity, fill_price, leverage, position.confidence
        ));

        self.insert_managed(position.clone(), fill_price);
        Ok(position)
    }

    /// Record a FAILED outcome and apply the semantic halt when warranted.
    fn record_open_failure(
        &self,
        intent: &WalEntry,
        error: &ExchangeError,
        stage: &str,
    ) -> Result<()> {
        self.wal.append(&WalEntry::failed(
            &intent.id,
            &intent.symbol,
            &format!("{stage}: {error}"),
        ))?;
        if error.is_semantic() {
            self.halt(&intent.symbol, &error.to_string());
        } else {
            self.notifier
                .send_error(&format!("{}: {stage} failed: {error}", intent.symbol));
        }
        Ok(())
    }

    /// Place the stop and take-profit guards, each retried with jittered
    /// exponential backoff.
    async fn place_guards(
        &self,
        symbol: &str,
        target: &Target,
        fill_price: f64,
        quantity: f64,
    ) -> Result<(String, String), ExchangeError> {
        // Guard prices keep the target's geometry but anchor on the realized
        // fill.
        let stop_price = fill_price * (target.stop_loss / target.entry_zone);
        let tp_price = fill_price * (target.take_profit / target.entry_zone);

        let stop = self
            .submit_guard_with_retry(symbol, target.action, stop_price, quantity, true)
            .await?;
        let tp = self
            .submit_guard_with_retry(symbol, target.action, tp_price, quantity, false)
            .await?;
        Ok((stop, tp))
    }

    async fn submit_guard_with_retry(
        &self,
        symbol: &str,
        position_side: Side,
        price: f64,
        quantity: f64,
        is_stop: bool,
    ) -> Result<String, ExchangeError> {
        let mut last_err = ExchangeError::Timeout;
        for attempt in 0..GUARD_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Self::backoff_delay(attempt)).await;
            }
            if !self.limiter.allow(Endpoint::Orders) {
                last_err = ExchangeError::RateLimited;
                continue;
            }

            let result = if is_stop {
                self.port
                    .submit_stop_order(symbol, position_side, price, quantity)
                    .await
            } else {
                self.port
                    .submit_take_profit_order(symbol, position_side, price, quantity)
                    .await
            };

            match result {
                Ok(ack) => return Ok(ack.order_id),
                Err(e) if e.is_retryable() => {
                    warn!(symbol, attempt, error = %e, "guard submission retrying");
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Jittered exponential backoff for guard retries.
    fn backoff_delay(attempt: u32) -> Duration {
        let base = GUARD_RETRY_BASE_MS * 2u64.pow(attempt.saturating_sub(1));
        let jitter = rand::thread_rng().gen_range(0..GUARD_RETRY_BASE_MS / 2);
        Duration::from_millis(base + jitter)
    }

    /// Close an entry whose guards could not be placed.  An unguarded
    /// position must not survive.
    async fn cleanup_unguarded(
        &self,
        intent: &WalEntry,
        side: Side,
        quantity: f64,
        guard_err: &ExchangeError,
    ) -> Result<()> {
        warn!(
            symbol = %intent.symbol,
            error = %guard_err,
            "guards failed after retries — closing unguarded position"
        );

        let close = self
            .port
            .submit_market_order(&intent.symbol, side.closing(), quantity, true)
            .await;

        let outcome = match close {
            Ok(_) => "guards failed, position closed at market",
            Err(ref e) => {
                // The close itself failed; reconciliation is the backstop.
                self.notifier.send_risk_alert(&format!(
                    "{}: UNGUARDED position, cleanup close failed: {e}",
                    intent.symbol
                ));
                "guards failed, cleanup close failed"
            }
        };

        self.wal.append(&WalEntry::failed(
            &intent.id,
            &intent.symbol,
            &format!("{outcome}: {guard_err}"),
        ))?;
        self.notifier.send_error(&format!(
            "{}: {outcome} ({guard_err})",
            intent.symbol
        ));
        Ok(())
    }

    /// Insert a committed (or adopted) position into the book with a fresh
    /// trailing machine.
    pub fn insert_managed(&self, position: Position, mark_price: f64) {
        let trailing = TrailingState::new(
            position.side,
            position.entry_price,
            self.trading.trailing_activation_pct,
            self.trading.trailing_pct,
        );
        self.book.insert(
            position.symbol.clone(),
            ManagedPosition {
                position,
                trailing,
                placed_stop_price: None,
                last_mark_price: mark_price,
            },
        );
    }

    // -------------------------------------------------------------------------
    // Rotation
    // -------------------------------------------------------------------------

    /// The open position with the lowest unrealized PnL percent, given mark
    /// prices.  `None` when the book is empty or no mark is known.
    pub fn weakest_position(&self, marks: &HashMap<String, f64>) -> Option<(String, f64)> {
        self.book
            .iter()
            .filter_map(|entry| {
                let mark = marks
                    .get(entry.key())
                    .copied()
                    .or_else(|| (entry.last_mark_price > 0.0).then_some(entry.last_mark_price))?;
                Some((entry.key().clone(), entry.position.unrealized_pnl_pct(mark)))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Rotation policy: with a full book and a gate-clearing target, evict
    /// the weakest position only when its gain is still below 5%.  Returns
    /// whether a slot was freed.
    pub async fn rotate_for(&self, target: &Target, marks: &HashMap<String, f64>) -> Result<bool> {
        let Some((symbol, pnl_pct)) = self.weakest_position(marks) else {
            return Ok(false);
        };

        if pnl_pct >= ROTATION_MAX_GAIN_PCT {
            debug!(
                weakest = %symbol,
                pnl_pct,
                new_target = %target.symbol,
                "rotation skipped — weakest position is still running"
            );
            return Ok(false);
        }

        info!(
            evicted = %symbol,
            pnl_pct,
            new_target = %target.symbol,
            new_score = target.confidence_score,
            "rotating weakest position out"
        );
        self.close_at_market(&symbol, "rotated for stronger signal")
            .await?;
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Cancel guards and close `symbol` at market, recording the closure.
    /// Returns the realized PnL estimate.
    pub async fn close_at_market(&self, symbol: &str, reason: &str) -> Result<f64> {
        let Some((_, managed)) = self.book.remove(symbol) else {
            return Err(anyhow!("no open position on {symbol}"));
        };
        let position = &managed.position;

        for order_id in [&position.stop_order_id, &position.take_profit_order_id]
            .into_iter()
            .flatten()
        {
            if !self.limiter.allow(Endpoint::Orders) {
                warn!(symbol, %order_id, "guard cancel rate limited — relying on reduce-only");
                continue;
            }
            match self.port.cancel_order(symbol, order_id).await {
                Ok(()) | Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => warn!(symbol, %order_id, error = %e, "guard cancel failed"),
            }
        }

        if !self.limiter.allow(Endpoint::Orders) {
            // Put the position back; the caller retries next tick.
            self.book.insert(symbol.to_string(), managed.clone());
            return Err(anyhow!("rate limited before closing market order"));
        }

        let ack = self
            .port
            .submit_market_order(symbol, position.side.closing(), position.quantity, true)
            .await
            .map_err(|e| {
                self.book.insert(symbol.to_string(), managed.clone());
                anyhow!("close order failed on {symbol}: {e}")
            })?;

        let exit_price = ack.fill_price.unwrap_or(managed.last_mark_price);
        let pnl = position.side.direction()
            * (exit_price - position.entry_price)
            * position.quantity;

        self.wal.append(&WalEntry::closure(
            &position.wal_id,
            symbol,
            exit_price,
            pnl,
            reason,
        ))?;

        info!(symbol, exit_price, pnl, reason, "position closed at market");
        self.notifier.send_trade(&format!(
            "CLOSE {symbol} @ {exit_price:.4} pnl={pnl:.2} ({reason})"
        ));
        Ok(pnl)
    }

    /// Record a closure that happened on the exchange side (guard fill or
    /// manual action) and drop the book entry.
    fn record_external_close(&self, symbol: &str, exit_price: f64) -> Result<f64> {
        let Some((_, managed)) = self.book.remove(symbol) else {
            return Ok(0.0);
        };
        let position = &managed.position;
        let pnl = position.side.direction()
            * (exit_price - position.entry_price)
            * position.quantity;

        self.wal.append(&WalEntry::closure(
            &position.wal_id,
            symbol,
            exit_price,
            pnl,
            "closed on exchange (guard fill or external)",
        ))?;

        info!(symbol, exit_price, pnl, "exchange-side closure detected");
        self.notifier
            .send_trade(&format!("CLOSED {symbol} on exchange, pnl={pnl:.2}"));
        Ok(pnl)
    }

    // -------------------------------------------------------------------------
    // Monitoring pass
    // -------------------------------------------------------------------------

    /// One monitoring sweep: refresh marks, advance trailing machines, keep
    /// exchange stops in sync, detect exchange-side closures.  Never opens
    /// positions.  Returns realized PnL of detected closures.
    pub async fn monitor_tick(&self) -> Vec<(String, f64)> {
        let symbols: Vec<String> = self.book.iter().map(|e| e.key().clone()).collect();
        let mut closed = Vec::new();

        for symbol in symbols {
            if !self.limiter.allow(Endpoint::Positions) {
                debug!(symbol, "monitor skipped — rate limited");
                continue;
            }

            let live = match self.port.get_position(&symbol).await {
                Ok(live) => live,
                Err(e) => {
                    warn!(symbol, error = %e, "monitor position fetch failed");
                    continue;
                }
            };

            let Some(live) = live else {
                // Gone on the exchange: a guard filled or someone closed it.
                let exit_price = self
                    .book
                    .get(&symbol)
                    .map(|m| {
                        m.trailing
                            .current_stop_price
                            .unwrap_or(m.last_mark_price)
                    })
                    .unwrap_or(0.0);
                match self.record_external_close(&symbol, exit_price) {
                    Ok(pnl) => closed.push((symbol, pnl)),
                    Err(e) => warn!(error = %e, "failed to record external close"),
                }
                continue;
            };

            let desired = {
                let Some(mut managed) = self.book.get_mut(&symbol) else {
                    continue;
                };
                managed.last_mark_price = live.mark_price;
                managed.trailing.observe(live.mark_price);
                // Re-derive the desired stop each pass so a failed placement
                // is retried even without further price movement.
                managed.trailing.current_stop_price.filter(|desired| {
                    managed.placed_stop_price != Some(*desired)
                })
            };

            if let Some(stop_price) = desired {
                self.sync_trailing_stop(&symbol, stop_price).await;
            }
        }
        closed
    }

    /// Replace the resting stop with one at `stop_price`.
    async fn sync_trailing_stop(&self, symbol: &str, stop_price: f64) {
        let (side, quantity, old_stop) = {
            let Some(managed) = self.book.get(symbol) else {
                return;
            };
            (
                managed.position.side,
                managed.position.quantity,
                managed.position.stop_order_id.clone(),
            )
        };

        if let Some(order_id) = old_stop {
            if !self.limiter.allow(Endpoint::Orders) {
                return;
            }
            match self.port.cancel_order(symbol, &order_id).await {
                Ok(()) => {}
                Err(ExchangeError::OrderNotFound(_)) => {
                    // The old stop likely filled; the next pass records the
                    // closure.
                    debug!(symbol, %order_id, "old stop already gone");
                    return;
                }
                Err(e) => {
                    warn!(symbol, error = %e, "stop cancel failed — retrying next pass");
                    return;
                }
            }
        }

        if !self.limiter.allow(Endpoint::Orders) {
            return;
        }
        match self
            .port
            .submit_stop_order(symbol, side, stop_price, quantity)
            .await
        {
            Ok(ack) => {
                if let Some(mut managed) = self.book.get_mut(symbol) {
                    managed.position.stop_order_id = Some(ack.order_id);
                    managed.placed_stop_price = Some(stop_price);
                }
                debug!(symbol, stop_price, "trailing stop resubmitted");
            }
            Err(e) => {
                warn!(symbol, stop_price, error = %e, "trailing stop resubmit failed");
                self.notifier.send_risk_alert(&format!(
                    "{symbol}: trailing stop resubmit failed: {e}"
                ));
            }
        }
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("open_positions", &self.book.len())
            .field("halted_symbols", &self.halted.len())
            .finish()
    }
}
