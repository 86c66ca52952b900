// =============================================================================
// Engine Loop — tick orchestration, drought tracking, cooperative shutdown
// =============================================================================
//
// Cooperative tasks, all joined on one CancellationToken:
//
//   trading tick     every `trading_interval_seconds` (default 30 s)
//   monitoring tick  every 30 s, offset 15 s
//   adaptive refresh every 5 min
//   soft reconcile   every 60 min (plus once at startup)
//   state snapshot   every `save_interval_seconds`
//
// The engine owns the AdaptiveState and the daily counters behind a single
// mutex held only for the short decision phase; exchange I/O happens outside
// it.  Decision-path errors never escape a tick: a failed tick is at worst a
// skipped opportunity, and reconciliation is the ultimate repair mechanism.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BotConfig;
use crate::exchange::ExchangePort;
use crate::limiter::{Endpoint, RateLimiter};
use crate::notify::Notifier;
use crate::policy::{effective_policy, AdaptiveState, EffectivePolicy};
use crate::positions::PositionManager;
use crate::reconcile::Reconciler;
use crate::scorer::{self, ScoredCandidate, Striker};
use crate::screener::Screener;
use crate::session::SessionCalendar;
use crate::state::{EngineSnapshot, PositionSummary};
use crate::wal::Wal;

/// Hard ceiling on one trading tick, including all I/O.
const TICK_DEADLINE: Duration = Duration::from_secs(10);
/// Monitoring cadence and its offset against the trading tick.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const MONITOR_OFFSET: Duration = Duration::from_secs(15);
/// Adaptive refresh cadence.
const ADAPTIVE_INTERVAL: Duration = Duration::from_secs(300);
/// Soft reconcile cadence.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(3600);

/// Kline shape consumed by the scorer.
const KLINE_INTERVAL: &str = "5m";
const KLINE_LIMIT: usize = 40;

/// What a single trading tick did, for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Kill switch present; trading halted.
    KillSwitch,
    /// Rate limiter denied the read path; not a no-signal minute.
    SkippedRateLimited,
    /// Read path failed; not a no-signal minute.
    SkippedReadError,
    /// Nothing cleared the gate this tick.
    NoSignal,
    /// A target was emitted but an engine gate declined to act on it.
    Gated(String),
    /// A position was opened.
    Opened(String),
}

/// Mutable decision state, held only for the short decision phase.
struct EngineCore {
    adaptive: AdaptiveState,
    trades_today: u32,
    wins_today: u32,
    losses_today: u32,
    realized_pnl_today: f64,
    current_date: NaiveDate,
    cooldowns: HashMap<String, DateTime<Utc>>,
    no_signal_ticks: u64,
    kill_switch_notified: bool,
}

pub struct Engine {
    config: BotConfig,
    calendar: SessionCalendar,
    port: Arc<dyn ExchangePort>,
    limiter: Arc<RateLimiter>,
    wal: Arc<Wal>,
    positions: Arc<PositionManager>,
    reconciler: Reconciler,
    notifier: Arc<dyn Notifier>,
    core: Mutex<EngineCore>,
}

impl Engine {
    /// Wire the engine and its collaborators from config.
    pub fn new(
        config: BotConfig,
        port: Arc<dyn ExchangePort>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let now = Utc::now();
        let calendar = SessionCalendar::new(config.sessions.clone());
        let limiter = Arc::new(RateLimiter::new(&config.limits));
        let wal = Arc::new(Wal::open(config.wal_path()).context("failed to open WAL")?);
        let positions = Arc::new(PositionManager::new(
            port.clone(),
            limiter.clone(),
            wal.clone(),
            notifier.clone(),
            config.trading.clone(),
        ));
        let reconciler = Reconciler::new(
            port.clone(),
            limiter.clone(),
            wal.clone(),
            positions.clone(),
            notifier.clone(),
            config.emergency.recovery_enabled,
        );

        Ok(Self {
            config,
            calendar,
            port,
            limiter,
            wal,
            positions,
            reconciler,
            notifier,
            core: Mutex::new(EngineCore {
                adaptive: AdaptiveState::new(now),
                trades_today: 0,
                wins_today: 0,
                losses_today: 0,
                realized_pnl_today: 0.0,
                current_date: now.date_naive(),
                cooldowns: HashMap::new(),
                no_signal_ticks: 0,
                kill_switch_notified: false,
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Trading tick
    // -------------------------------------------------------------------------

    /// One trading tick: policy → screen → enrich → strike → open/rotate.
    pub async fn trading_tick(&self) -> TickOutcome {
        let now = Utc::now();

        // --- Kill switch -------------------------------------------------
        if self.config.kill_switch_path().exists() {
            let mut core = self.core.lock();
            if !core.kill_switch_notified {
                core.kill_switch_notified = true;
                warn!("kill switch present — trading halted");
                self.notifier
                    .send_kill_switch("kill switch file present, trading halted");
            }
            return TickOutcome::KillSwitch;
        }

        // --- Short decision phase: derive the effective policy -----------
        let policy = {
            let mut core = self.core.lock();
            core.kill_switch_notified = false;
            if core.current_date != now.date_naive() {
                info!(date = %now.date_naive(), "daily counters reset");
                core.current_date = now.date_naive();
                core.trades_today = 0;
                core.wins_today = 0;
                core.losses_today = 0;
                core.realized_pnl_today = 0.0;
            }

            let Some(session) = self.calendar.current_session(now) else {
                error!("no session matches the current hour — calendar is broken");
                return TickOutcome::SkippedReadError;
            };
            core.adaptive.update_session(session);
            effective_policy(
                session,
                core.adaptive.drought_minutes(now),
                self.config.scoring.min_score_gate,
            )
        };

        // --- Read path, outside the lock ---------------------------------
        if !self.limiter.allow(Endpoint::Tickers) {
            info!("tick skipped — ticker read denied by rate limiter");
            return TickOutcome::SkippedRateLimited;
        }
        let tickers = match self.port.list_ticker_snapshots().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "tick skipped — ticker read failed");
                return TickOutcome::SkippedReadError;
            }
        };
        let marks: HashMap<String, f64> = tickers
            .iter()
            .map(|t| (t.symbol.clone(), t.last_price))
            .collect();

        let candidates = Screener::screen(&tickers, &policy, &self.config.screener);
        if candidates.is_empty() {
            return self.record_no_signal(&policy);
        }

        let scored = self.enrich_candidates(candidates, &policy).await;
        let Some(target) = Striker::strike(&scored, &policy, &self.config.trading) else {
            return self.record_no_signal(&policy);
        };

        // --- The Striker accepted: drought resets immediately ------------
        {
            let mut core = self.core.lock();
            core.adaptive.record_signal(now);
        }
        info!(
            symbol = %target.symbol,
            action = %target.action,
            score = target.confidence_score,
            gate = policy.score_gate,
            "target emitted"
        );

        // --- Engine admission gates ---------------------------------------
        if let Some(reason) = self.admission_gate(&target, now) {
            debug!(symbol = %target.symbol, %reason, "target gated");
            return TickOutcome::Gated(reason);
        }

        // --- Capacity: open directly or rotate ----------------------------
        if self.positions.open_count() >= self.config.trading.max_open_positions {
            match self.positions.rotate_for(&target, &marks).await {
                Ok(true) => {}
                Ok(false) => {
                    return TickOutcome::Gated("book full, weakest position still running".into())
                }
                Err(e) => {
                    warn!(error = %e, "rotation failed");
                    return TickOutcome::Gated(format!("rotation failed: {e}"));
                }
            }
        }

        match self.positions.open_from_target(&target).await {
            Ok(position) => {
                let mut core = self.core.lock();
                core.trades_today += 1;
                core.cooldowns.insert(position.symbol.clone(), now);
                TickOutcome::Opened(position.symbol)
            }
            Err(e) => {
                // Decision-path errors never escape the tick.
                warn!(symbol = %target.symbol, error = %e, "open failed — opportunity skipped");
                TickOutcome::Gated(format!("open failed: {e}"))
            }
        }
    }

    fn record_no_signal(&self, policy: &EffectivePolicy) -> TickOutcome {
        let mut core = self.core.lock();
        core.no_signal_ticks += 1;
        debug!(
            gate = policy.score_gate,
            level = %policy.relaxation_level,
            no_signal_ticks = core.no_signal_ticks,
            "no signal this tick"
        );
        TickOutcome::NoSignal
    }

    /// Per-target admission checks that are the engine's business rather
    /// than the position manager's.
    fn admission_gate(&self, target: &scorer::Target, now: DateTime<Utc>) -> Option<String> {
        if target.confidence_score < self.config.trading.min_confidence {
            return Some(format!(
                "confidence {:.0} below floor {:.0}",
                target.confidence_score, self.config.trading.min_confidence
            ));
        }
        if self.positions.contains(&target.symbol) {
            return Some("symbol already has an open position".into());
        }
        if self.positions.is_halted(&target.symbol) {
            return Some("symbol halted until next reconcile".into());
        }

        let core = self.core.lock();
        if core.trades_today >= self.config.trading.max_trades_per_day {
            return Some("daily trade cap reached".into());
        }
        if let Some(last) = core.cooldowns.get(&target.symbol) {
            let elapsed = (now - *last).num_minutes();
            if elapsed < self.config.trading.symbol_cooldown_minutes {
                return Some(format!(
                    "symbol cooling down ({elapsed}m of {}m)",
                    self.config.trading.symbol_cooldown_minutes
                ));
            }
        }
        None
    }

    /// Pull klines and depth for each candidate and score it.  Candidates
    /// failing the spread or volume entry gates are dropped here.
    async fn enrich_candidates(
        &self,
        candidates: Vec<crate::screener::Candidate>,
        policy: &EffectivePolicy,
    ) -> Vec<ScoredCandidate> {
        let mut scored = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if candidate.quote_volume < self.config.trading.min_volume_24h_usd {
                debug!(symbol = %candidate.symbol, "candidate below entry volume floor");
                continue;
            }
            if !self.limiter.allow(Endpoint::Klines) || !self.limiter.allow(Endpoint::Depth) {
                debug!(symbol = %candidate.symbol, "enrichment skipped — rate limited");
                continue;
            }

            let klines = match self
                .port
                .get_klines(&candidate.symbol, KLINE_INTERVAL, KLINE_LIMIT)
                .await
            {
                Ok(k) => k,
                Err(e) => {
                    debug!(symbol = %candidate.symbol, error = %e, "kline fetch failed");
                    continue;
                }
            };
            let depth = match self.port.get_depth(&candidate.symbol).await {
                Ok(d) => d,
                Err(e) => {
                    debug!(symbol = %candidate.symbol, error = %e, "depth fetch failed");
                    continue;
                }
            };

            let Some(metrics) = scorer::derive_metrics(&klines, &depth, candidate.change_pct)
            else {
                debug!(symbol = %candidate.symbol, "insufficient history to score");
                continue;
            };
            if metrics.spread_pct > self.config.trading.max_spread_pct {
                debug!(
                    symbol = %candidate.symbol,
                    spread = metrics.spread_pct,
                    "candidate dropped — spread too wide"
                );
                continue;
            }

            let breakdown = scorer::score(&metrics, policy, &self.config.scoring);
            debug!(
                symbol = %candidate.symbol,
                score = breakdown.total,
                "candidate scored"
            );
            scored.push(ScoredCandidate {
                candidate,
                metrics,
                breakdown,
            });
        }
        scored
    }

    // -------------------------------------------------------------------------
    // Monitoring tick
    // -------------------------------------------------------------------------

    /// One monitoring sweep; folds detected closures into the daily stats.
    pub async fn monitoring_tick(&self) {
        let closed = self.positions.monitor_tick().await;
        if closed.is_empty() {
            return;
        }
        let mut core = self.core.lock();
        for (symbol, pnl) in closed {
            core.realized_pnl_today += pnl;
            if pnl >= 0.0 {
                core.wins_today += 1;
            } else {
                core.losses_today += 1;
            }
            debug!(symbol, pnl, "closure folded into daily stats");
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Write the operator snapshot atomically.
    pub fn write_snapshot(&self) -> Result<()> {
        let now = Utc::now();
        let open_positions: Vec<PositionSummary> = self
            .positions
            .snapshot_positions()
            .into_iter()
            .map(|m| PositionSummary {
                symbol: m.position.symbol.clone(),
                side: m.position.side,
                quantity: m.position.quantity,
                entry_price: m.position.entry_price,
                leverage: m.position.leverage,
                trailing_armed: m.trailing.activated(),
            })
            .collect();

        let snapshot = {
            let core = self.core.lock();
            EngineSnapshot {
                capital: self.config.trading.initial_capital + core.realized_pnl_today,
                trades_today: core.trades_today,
                wins_today: core.wins_today,
                losses_today: core.losses_today,
                realized_pnl_today: core.realized_pnl_today,
                drought_minutes: core.adaptive.drought_minutes(now),
                current_session: core.adaptive.current_session.clone(),
                open_positions,
                saved_at: Some(now),
            }
        };
        snapshot.save(self.config.state_snapshot_path())
    }

    // -------------------------------------------------------------------------
    // Run loop
    // -------------------------------------------------------------------------

    /// Run every cooperative task until `shutdown` fires, then drain and
    /// flush.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        // Startup reconciliation before the first tick.
        if let Err(e) = self.reconciler.reconcile().await {
            warn!(error = %e, "startup reconciliation failed — continuing, soft timer will retry");
        }

        let mut tasks = Vec::new();

        // Trading tick.
        {
            let engine = self.clone();
            let token = shutdown.clone();
            let period = Duration::from_secs(engine.config.trading.trading_interval_seconds);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            match tokio::time::timeout(TICK_DEADLINE, engine.trading_tick()).await {
                                Ok(outcome) => debug!(?outcome, "trading tick finished"),
                                Err(_) => warn!("trading tick hit the 10s deadline — relying on reconciliation"),
                            }
                        }
                    }
                }
                info!("trading task stopped");
            }));
        }

        // Monitoring tick, offset against the trading tick.
        {
            let engine = self.clone();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(MONITOR_OFFSET) => {}
                }
                let mut interval = tokio::time::interval(MONITOR_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => engine.monitoring_tick().await,
                    }
                }
                info!("monitoring task stopped");
            }));
        }

        // Adaptive refresh: keeps the session label and drought level logged
        // even through long droughts.
        {
            let engine = self.clone();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(ADAPTIVE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let now = Utc::now();
                            let mut core = engine.core.lock();
                            if let Some(session) = engine.calendar.current_session(now) {
                                core.adaptive.update_session(session);
                            }
                            info!(
                                session = %core.adaptive.current_session,
                                drought_minutes = core.adaptive.drought_minutes(now),
                                level = %core.adaptive.relaxation_level(now),
                                "adaptive state refreshed"
                            );
                        }
                    }
                }
            }));
        }

        // Soft reconcile.
        {
            let engine = self.clone();
            let token = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
                interval.tick().await; // the startup pass already ran
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = engine.reconciler.reconcile().await {
                                warn!(error = %e, "soft reconciliation failed");
                            }
                        }
                    }
                }
            }));
        }

        // State snapshot.
        {
            let engine = self.clone();
            let token = shutdown.clone();
            let period = Duration::from_secs(engine.config.state.save_interval_seconds.max(1));
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = engine.write_snapshot() {
                                warn!(error = %e, "state snapshot failed");
                            }
                        }
                    }
                }
            }));
        }

        shutdown.cancelled().await;
        info!("shutdown requested — draining tasks");
        for task in tasks {
            let _ = task.await;
        }

        // Final flush: snapshot and a compacted WAL.
        if let Err(e) = self.write_snapshot() {
            warn!(error = %e, "final snapshot failed");
        }
        if let Err(e) = self.wal.compact() {
            warn!(error = %e, "final WAL compaction failed");
        }
        info!("engine stopped cleanly");
        Ok(())
    }

    #[cfg(test)]
    fn no_signal_ticks(&self) -> u64 {
        self.core.lock().no_signal_ticks
    }

    #[cfg(test)]
    fn drought_minutes(&self) -> i64 {
        self.core.lock().adaptive.drought_minutes(Utc::now())
    }
}
