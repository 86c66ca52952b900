// =============================================================================
// Scorer / Striker — additive confidence scoring and target emission
// =============================================================================
//
// The scorer turns a candidate's market statistics into a scalar confidence
// score in [0, 200]:
//
//   Volume spike    40 (+10 at >= 15x)
//   Book delta      35 (+10 at >= 0.90)
//   ATR / price     25 (+10 at >= 8%)
//   Momentum        30 (+10 at >= 8%)
//   Trend (ADX)     20 (+5  at >= 50)
//   Breakout        25 (discrete)
//   Gap fill        25 (discrete)
//   Volatility      up to 15 (vol * 300, capped)
//
// The Striker takes the single highest-scoring candidate per tick.  Below the
// effective score gate it emits nothing and the tick counts as a no-signal
// minute; otherwise it emits exactly one Target and the drought clock resets.
// =============================================================================

use tracing::{debug, warn};

use crate::config::{ScoringConfig, TradingConfig};
use crate::exchange::{DepthSnapshot, Kline};
use crate::indicators::{adx, atr};
use crate::policy::EffectivePolicy;
use crate::screener::Candidate;
use crate::types::Side;

/// Bars consulted for volume spike, breakout, and volatility windows.
const LOOKBACK: usize = 20;
/// Wilder period for ATR and ADX.
const INDICATOR_PERIOD: usize = 14;
/// 3-bar fair-value gaps are searched this many bars back.
const FVG_LOOKBACK: usize = 10;

/// Minimum reward/risk ratio for an emitted target.
const MIN_REWARD_RISK: f64 = 1.5;

// =============================================================================
// Metrics
// =============================================================================

/// Derived scoring inputs for one candidate.  Ephemeral, one tick.
#[derive(Debug, Clone, Default)]
pub struct CandidateMetrics {
    /// Last closed bar volume over the trailing average.
    pub volume_spike_ratio: f64,
    /// Absolute top-of-book imbalance in [0, 1].
    pub book_delta: f64,
    /// ATR as percent of price.
    pub atr_pct: f64,
    /// 24h price change, percent (signed).
    pub change_pct: f64,
    /// Trend strength; `None` with insufficient history.
    pub adx: Option<f64>,
    /// Last close beyond the prior N-bar extreme in the move's direction.
    pub breakout: bool,
    /// An unfilled 3-bar fair-value gap contains the current price.
    pub gap_fill: bool,
    /// Stddev of close-to-close returns (fractional).
    pub volatility: f64,
    /// Top-of-book spread, percent of mid.
    pub spread_pct: f64,
}

/// Build metrics from raw klines and depth.  Returns `None` when the history
/// is too short to score honestly.
pub fn derive_metrics(
    klines: &[Kline],
    depth: &DepthSnapshot,
    change_pct: f64,
) -> Option<CandidateMetrics> {
    if klines.len() < LOOKBACK + 1 {
        return None;
    }

    let last = klines[klines.len() - 1];
    let history = &klines[..klines.len() - 1];

    // Volume spike: last closed bar against the trailing average.
    let window = &history[history.len().saturating_sub(LOOKBACK)..];
    let avg_volume: f64 = window.iter().map(|k| k.volume).sum::<f64>() / window.len() as f64;
    let volume_spike_ratio = if avg_volume > 0.0 {
        last.volume / avg_volume
    } else {
        0.0
    };

    // Breakout beyond the prior extreme, in the direction of the move.
    let breakout = if change_pct >= 0.0 {
        let prior_high = window.iter().map(|k| k.high).fold(f64::MIN, f64::max);
        last.close > prior_high
    } else {
        let prior_low = window.iter().map(|k| k.low).fold(f64::MAX, f64::min);
        last.close < prior_low
    };

    // Volatility: stddev of close-to-close returns over the window.
    let closes: Vec<f64> = klines[klines.len() - (LOOKBACK + 1)..]
        .iter()
        .map(|k| k.close)
        .collect();
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    let volatility = if returns.len() > 1 {
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };

    Some(CandidateMetrics {
        volume_spike_ratio,
        book_delta: depth.delta(),
        atr_pct: atr::atr_pct(klines, INDICATOR_PERIOD).unwrap_or(0.0),
        change_pct,
        adx: adx::adx(klines, INDICATOR_PERIOD),
        breakout,
        gap_fill: has_open_fair_value_gap(klines, last.close),
        volatility,
        spread_pct: depth.spread_pct(),
    })
}

/// Scan the last few 3-bar windows for a fair-value gap whose zone still
/// contains `price`.
fn has_open_fair_value_gap(klines: &[Kline], price: f64) -> bool {
    let start = klines.len().saturating_sub(FVG_LOOKBACK + 2);
    for w in klines[start..].windows(3) {
        // Bullish gap: first bar's high below third bar's low.
        if w[0].high < w[2].low && price >= w[0].high && price <= w[2].low {
            return true;
        }
        // Bearish gap: first bar's low above third bar's high.
        if w[0].low > w[2].high && price <= w[0].low && price >= w[2].high {
            return true;
        }
    }
    false
}

// =============================================================================
// Score breakdown
// =============================================================================

/// Per-component score contributions, for logs and tests.
#[derive(Debug, Clone, Default)]
pub struct ScoreBreakdown {
    pub volume_spike: f64,
    pub book_delta: f64,
    pub atr: f64,
    pub momentum: f64,
    pub trend: f64,
    pub breakout: f64,
    pub gap_fill: f64,
    pub volatility_bonus: f64,
    pub total: f64,
}

/// Score `metrics` under the effective policy.  Additive, clamped to
/// [0, 200].
pub fn score(
    metrics: &CandidateMetrics,
    policy: &EffectivePolicy,
    cfg: &ScoringConfig,
) -> ScoreBreakdown {
    let mut b = ScoreBreakdown::default();

    if metrics.volume_spike_ratio >= cfg.volume_spike_min {
        b.volume_spike = 40.0;
        if metrics.volume_spike_ratio >= 15.0 {
            b.volume_spike += 10.0;
        }
    }

    // Relaxation loosens the session delta threshold but never below the
    // absolute floor.
    let delta_threshold = policy.delta_threshold.max(cfg.delta_min);
    if metrics.book_delta >= delta_threshold {
        b.book_delta = 35.0;
        if metrics.book_delta >= 0.90 {
            b.book_delta += 10.0;
        }
    }

    let atr_scaled = metrics.atr_pct * cfg.atr_multiplier;
    if atr_scaled >= 5.0 {
        b.atr = 25.0;
        if atr_scaled >= 8.0 {
            b.atr += 10.0;
        }
    }

    let momentum_floor = policy.momentum_min.max(cfg.price_momentum_min);
    let momentum = metrics.change_pct.abs();
    if momentum >= momentum_floor {
        b.momentum = 30.0;
        if momentum >= 8.0 {
            b.momentum += 10.0;
        }
    }

    if let Some(adx_val) = metrics.adx {
        if adx_val >= cfg.adx_min {
            b.trend = 20.0;
            if adx_val >= 50.0 {
                b.trend += 5.0;
            }
        }
    }

    if metrics.breakout {
        b.breakout = cfg.breakout_bonus;
    }
    if metrics.gap_fill {
        b.gap_fill = cfg.fvg_bonus;
    }

    b.volatility_bonus = (metrics.volatility * 300.0).min(15.0);

    b.total = (b.volume_spike
        + b.book_delta
        + b.atr
        + b.momentum
        + b.trend
        + b.breakout
        + b.gap_fill
        + b.volatility_bonus)
        .clamp(0.0, 200.0);
    b
}

// =============================================================================
// Target
// =============================================================================

/// The single actionable decision a tick can produce.
#[derive(Debug, Clone)]
pub struct Target {
    pub symbol: String,
    pub action: Side,
    pub confidence_score: f64,
    pub entry_zone: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub size_multiplier: f64,
}

/// Check the target geometry invariants: ordering per side and reward/risk
/// of at least 1.5.
pub fn validate_target(t: &Target) -> Result<(), String> {
    let (risk, reward) = match t.action {
        Side::Long => {
            if !(t.stop_loss < t.entry_zone && t.entry_zone < t.take_profit) {
                return Err(format!(
                    "long ordering violated: stop {} entry {} tp {}",
                    t.stop_loss, t.entry_zone, t.take_profit
                ));
            }
            (t.entry_zone - t.stop_loss, t.take_profit - t.entry_zone)
        }
        Side::Short => {
            if !(t.stop_loss > t.entry_zone && t.entry_zone > t.take_profit) {
                return Err(format!(
                    "short ordering violated: stop {} entry {} tp {}",
                    t.stop_loss, t.entry_zone, t.take_profit
                ));
            }
            (t.stop_loss - t.entry_zone, t.entry_zone - t.take_profit)
        }
    };

    if risk <= 0.0 || reward / risk < MIN_REWARD_RISK - 1e-9 {
        return Err(format!(
            "reward/risk {:.3} below {MIN_REWARD_RISK}",
            reward / risk
        ));
    }
    Ok(())
}

// =============================================================================
// Striker
// =============================================================================

/// A candidate with its derived metrics and score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub metrics: CandidateMetrics,
    pub breakdown: ScoreBreakdown,
}

/// Emits at most one Target per tick.
pub struct Striker;

impl Striker {
    /// Pick the highest-scoring candidate; emit a Target when it clears the
    /// gate and survives geometry validation.
    pub fn strike(
        scored: &[ScoredCandidate],
        policy: &EffectivePolicy,
        trading: &TradingConfig,
    ) -> Option<Target> {
        let best = scored.iter().max_by(|a, b| {
            a.breakdown
                .total
                .partial_cmp(&b.breakdown.total)
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;

        if best.breakdown.total < policy.score_gate {
            debug!(
                symbol = %best.candidate.symbol,
                score = best.breakdown.total,
                gate = policy.score_gate,
                "top candidate below score gate — no signal"
            );
            return None;
        }

        let target = Self::build_target(best, policy, trading);
        match validate_target(&target) {
            Ok(()) => Some(target),
            Err(reason) => {
                // A target violating its own geometry is a bug upstream;
                // treated as no-signal for this tick.
                warn!(symbol = %target.symbol, %reason, "target rejected — geometry invariant");
                None
            }
        }
    }

    fn build_target(
        best: &ScoredCandidate,
        policy: &EffectivePolicy,
        trading: &TradingConfig,
    ) -> Target {
        let action = if best.metrics.change_pct >= 0.0 {
            Side::Long
        } else {
            Side::Short
        };

        let entry = best.candidate.last_price;
        let r = trading.stop_loss_pct / 100.0;
        // Clamp the take-profit fraction so reward/risk never drops below 1.5.
        let k = (trading.take_profit_pct / 100.0).max(MIN_REWARD_RISK * r);

        let (stop_loss, take_profit) = match action {
            Side::Long => (entry * (1.0 - r), entry * (1.0 + k)),
            Side::Short => (entry * (1.0 + r), entry * (1.0 - k)),
        };

        Target {
            symbol: best.candidate.symbol.clone(),
            action,
            confidence_score: best.breakdown.total,
            entry_zone: entry,
            take_profit,
            stop_loss,
            size_multiplier: policy.position_size_multiplier,
        }
    }
}
