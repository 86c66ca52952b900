// =============================================================================
// Screener — filters the universe to a bounded candidate set
// =============================================================================
//
// Stateless across ticks: output depends only on the ticker list, the
// effective policy, and the screener config.
//
// Filter order:
//   1. Tradable perpetuals whose symbol matches the quote currency.
//   2. Major-cap ignore list (skipped in high-risk mode).
//   3. Momentum band and volume floor/ceiling under the effective policy.
//   4. Sort by the configured key, truncate to `max_pairs`.
// =============================================================================

use tracing::debug;

use crate::config::{ScreenerConfig, SortKey};
use crate::exchange::TickerSnapshot;
use crate::policy::EffectivePolicy;

/// A symbol that survived screening.  Valid only for the tick that produced
/// it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub symbol: String,
    pub last_price: f64,
    pub change_pct: f64,
    pub quote_volume: f64,
}

impl Candidate {
    /// Pre-enrichment ranking proxy: momentum weighted by participation.
    fn sort_score(&self) -> f64 {
        self.change_pct.abs() * self.quote_volume.max(10.0).log10()
    }
}

/// Stateless universe filter.
pub struct Screener;

impl Screener {
    /// Reduce `tickers` to at most `cfg.max_pairs` candidates under `policy`.
    pub fn screen(
        tickers: &[TickerSnapshot],
        policy: &EffectivePolicy,
        cfg: &ScreenerConfig,
    ) -> Vec<Candidate> {
        let momentum_lo = policy.momentum_min.max(cfg.min_price_change_pct);
        let momentum_hi = policy.momentum_max.min(cfg.max_price_change_pct);
        let volume_floor = policy.volume_threshold.max(cfg.min_volume_24h);

        let mut candidates: Vec<Candidate> = tickers
            .iter()
            .filter(|t| t.tradable && t.symbol.ends_with(&cfg.quote_asset))
            .filter(|t| cfg.high_risk_mode || !cfg.ignore_symbols.contains(&t.symbol))
            .filter(|t| {
                let momentum = t.price_change_pct.abs();
                momentum >= momentum_lo && momentum <= momentum_hi
            })
            .filter(|t| {
                t.quote_volume >= volume_floor
                    && (cfg.max_volume_24h <= 0.0 || t.quote_volume <= cfg.max_volume_24h)
            })
            .filter(|t| t.last_price > 0.0)
            .map(|t| Candidate {
                symbol: t.symbol.clone(),
                last_price: t.last_price,
                change_pct: t.price_change_pct,
                quote_volume: t.quote_volume,
            })
            .collect();

        match cfg.sort_by {
            SortKey::Score | SortKey::Confidence => {
                candidates.sort_by(|a, b| {
                    b.sort_score()
                        .partial_cmp(&a.sort_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            SortKey::Volatility => {
                candidates.sort_by(|a, b| {
                    b.change_pct
                        .abs()
                        .partial_cmp(&a.change_pct.abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        candidates.truncate(cfg.max_pairs);

        debug!(
            session = %policy.session_name,
            level = %policy.relaxation_level,
            universe = tickers.len(),
            candidates = candidates.len(),
            momentum_lo,
            momentum_hi,
            volume_floor,
            "screening complete"
        );

        candidates
    }
}
