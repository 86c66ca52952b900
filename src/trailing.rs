// =============================================================================
// Trailing Stop — per-position state machine with a one-way ratchet
// =============================================================================
//
// Two states:
//
//   UNARMED  — the position runs on its initial protective stop.  A
//              favourable move of `activation_pct` from entry arms the trail;
//              on the transition the stop moves to entry (break-even).
//   ARMED    — the peak favourable price is tracked.  Whenever
//              `peak - stop >= trail_pct * peak` (mirrored for shorts) the
//              stop resubmits at `peak * (1 - trail_pct)`.
//
// The stop price is monotone on the favourable side: it never moves backward,
// in either state.  Each `observe` returns the stop the caller must place on
// the exchange, if any; actual cancel/resubmit is the position manager's job.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::Side;

/// Whether the trail has taken over stop management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrailPhase {
    Unarmed,
    Armed,
}

impl std::fmt::Display for TrailPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unarmed => write!(f, "UNARMED"),
            Self::Armed => write!(f, "ARMED"),
        }
    }
}

/// Stop adjustment the caller must mirror on the exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailAction {
    /// Cancel the initial stop and place one at the given price (break-even).
    Arm { stop_price: f64 },
    /// Cancel the current stop and place one at the given price.
    Ratchet { stop_price: f64 },
}

impl TrailAction {
    pub fn stop_price(&self) -> f64 {
        match *self {
            Self::Arm { stop_price } | Self::Ratchet { stop_price } => stop_price,
        }
    }
}

/// Per-position trailing state.  Born with its position, dies with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingState {
    pub side: Side,
    pub entry_price: f64,
    /// Favourable gain from entry (percent) that arms the trail.
    pub activation_pct: f64,
    /// Trail distance as a fraction of the peak (percent).
    pub trail_pct: f64,
    pub phase: TrailPhase,
    /// Best favourable price seen (highest for long, lowest for short).
    pub best_seen_price: f64,
    /// Stop the trail currently maintains; `None` while unarmed.
    pub current_stop_price: Option<f64>,
}

impl TrailingState {
    pub fn new(side: Side, entry_price: f64, activation_pct: f64, trail_pct: f64) -> Self {
        Self {
            side,
            entry_price,
            activation_pct,
            trail_pct,
            phase: TrailPhase::Unarmed,
            best_seen_price: entry_price,
            current_stop_price: None,
        }
    }

    pub fn activated(&self) -> bool {
        self.phase == TrailPhase::Armed
    }

    /// Feed one observed price.  Returns the stop adjustment to mirror on the
    /// exchange, if the machine moved.
    pub fn observe(&mut self, price: f64) -> Option<TrailAction> {
        if price <= 0.0 {
            return None;
        }

        if self.side.is_favourable(price, self.best_seen_price) {
            self.best_seen_price = price;
        }

        match self.phase {
            TrailPhase::Unarmed => self.try_arm(),
            TrailPhase::Armed => self.try_ratchet(),
        }
    }

    fn try_arm(&mut self) -> Option<TrailAction> {
        let activation_gain = self.entry_price * self.activation_pct / 100.0;
        let threshold = self.entry_price + self.side.direction() * activation_gain;

        let reached = match self.side {
            Side::Long => self.best_seen_price >= threshold,
            Side::Short => self.best_seen_price <= threshold,
        };
        if !reached {
            return None;
        }

        self.phase = TrailPhase::Armed;
        self.current_stop_price = Some(self.entry_price);
        info!(
            side = %self.side,
            entry = self.entry_price,
            best = self.best_seen_price,
            "trailing stop armed — stop moves to break-even"
        );
        Some(TrailAction::Arm {
            stop_price: self.entry_price,
        })
    }

    fn try_ratchet(&mut self) -> Option<TrailAction> {
        let stop = self.current_stop_price?;
        let trail_distance = self.best_seen_price * self.trail_pct / 100.0;

        let lagging = match self.side {
            Side::Long => self.best_seen_price - stop >= trail_distance,
            Side::Short => stop - self.best_seen_price >= trail_distance,
        };
        if !lagging {
            return None;
        }

        let candidate = match self.side {
            Side::Long => self.best_seen_price * (1.0 - self.trail_pct / 100.0),
            Side::Short => self.best_seen_price * (1.0 + self.trail_pct / 100.0),
        };

        // Ratchet: the stop never moves backward.
        let improves = match self.side {
            Side::Long => candidate > stop,
            Side::Short => candidate < stop,
        };
        if !improves {
            return None;
        }

        self.current_stop_price = Some(candidate);
        debug!(
            side = %self.side,
            peak = self.best_seen_price,
            stop = candidate,
            "trailing stop ratcheted"
        );
        Some(TrailAction::Ratchet {
            stop_price: candidate,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn long_trail() -> TrailingState {
        TrailingState::new(Side::Long, 100.0, 1.0, 0.5)
    }

    #[test]
    fn starts_unarmed_without_stop() {
        let t = long_trail();
        assert_eq!(t.phase, TrailPhase::Unarmed);
        assert!(t.current_stop_price.is_none());
        assert!(!t.activated());
    }

    #[test]
    fn small_move_does_not_arm() {
        let mut t = long_trail();
        assert!(t.observe(100.5).is_none());
        assert_eq!(t.phase, TrailPhase::Unarmed);
    }

    #[test]
    fn arming_moves_stop_to_breakeven() {
        let mut t = long_trail();
        let action = t.observe(101.0).unwrap();
        assert_eq!(action, TrailAction::Arm { stop_price: 100.0 });
        assert!(t.activated());
        assert_eq!(t.current_stop_price, Some(100.0));
    }

    #[test]
    fn spec_price_path_ends_at_expected_stop() {
        // Entry 100, activation 1%, trail 0.5%; prices 101, 102, 101.4, 103.
        let mut t = long_trail();
        let mut stops = Vec::new();

        for price in [101.0, 102.0, 101.4, 103.0] {
            t.observe(price);
            if let Some(stop) = t.current_stop_price {
                stops.push(stop);
            }
        }

        // Monotone non-decreasing throughout.
        for pair in stops.windows(2) {
            assert!(pair[1] >= pair[0], "stop moved backward: {:?}", stops);
        }
        let last = stops.last().copied().unwrap();
        assert!(
            (last - 103.0 * (1.0 - 0.005)).abs() < 1e-9,
            "expected final stop 102.485, got {last}"
        );
    }

    #[test]
    fn pullback_never_lowers_stop() {
        let mut t = long_trail();
        t.observe(101.0); // arms at break-even
        t.observe(102.0); // ratchets off the new peak
        let stop_at_peak = t.current_stop_price.unwrap();
        assert!((stop_at_peak - 102.0 * 0.995).abs() < 1e-9);

        // Deep pullback: peak is unchanged, stop must hold.
        assert!(t.observe(100.2).is_none());
        assert_eq!(t.current_stop_price, Some(stop_at_peak));
    }

    #[test]
    fn short_trail_is_mirrored() {
        let mut t = TrailingState::new(Side::Short, 100.0, 1.0, 0.5);

        // Favourable move down arms at break-even.
        let action = t.observe(99.0).unwrap();
        assert_eq!(action, TrailAction::Arm { stop_price: 100.0 });

        // Further drop ratchets the stop downward.
        t.observe(98.0);
        let stop = t.current_stop_price.unwrap();
        assert!((stop - 98.0 * 1.005).abs() < 1e-9);

        // Bounce does not widen.
        t.observe(99.5);
        assert_eq!(t.current_stop_price, Some(stop));
    }

    #[test]
    fn armed_stop_sequence_is_monotone_under_noise() {
        let mut t = long_trail();
        let prices = [
            101.0, 100.6, 101.8, 101.2, 102.5, 101.9, 102.4, 103.1, 102.0, 104.0,
        ];
        let mut last_stop = f64::MIN;
        for p in prices {
            t.observe(p);
            if let Some(stop) = t.current_stop_price {
                assert!(stop >= last_stop, "stop regressed from {last_stop} to {stop}");
                last_stop = stop;
            }
        }
    }

    #[test]
    fn ignores_nonpositive_prices() {
        let mut t = long_trail();
        assert!(t.observe(0.0).is_none());
        assert!(t.observe(-5.0).is_none());
        assert_eq!(t.best_seen_price, 100.0);
    }

    #[test]
    fn short_activation_threshold_is_below_entry() {
        let mut t = TrailingState::new(Side::Short, 100.0, 2.0, 0.5);
        assert!(t.observe(98.5).is_none(), "1.5% move must not arm a 2% trail");
        assert!(t.observe(98.0).is_some());
    }
}
