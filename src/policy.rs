// =============================================================================
// Adaptive Policy — session thresholds relaxed by observed signal drought
// =============================================================================
//
// The engine owns one `AdaptiveState`.  Every tick it derives an
// `EffectivePolicy` from the current session and the minutes elapsed since the
// last accepted signal.  Relaxation is monotone: a higher level never tightens
// any threshold.  Upper bounds (momentum_max, position_size_multiplier) are
// never widened.
//
// Relaxation ladder, in minutes since the last accepted signal:
//   0-29   level 0   no change                      gate = base
//   30-44  level 1   vol ×0.85  Δ −0.03  mom −0.5   gate = base − 10
//   45-59  level 2   vol ×0.75  Δ −0.05  mom −1.0   gate = base − 20
//   >=60   level 3   vol ×0.65  Δ −0.08  mom −1.5   gate = base − 30
//
// At the default base gate of 120 this yields the 120/110/100/90 ladder.
// The drought counter resets the instant the Striker accepts a Target.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::session::Session;

// =============================================================================
// Relaxation level
// =============================================================================

/// Drought-driven relaxation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelaxationLevel {
    Level0,
    Level1,
    Level2,
    Level3,
}

impl RelaxationLevel {
    /// Level implied by minutes elapsed since the last accepted signal.
    pub fn from_drought_minutes(minutes: i64) -> Self {
        match minutes {
            m if m >= 60 => Self::Level3,
            m if m >= 45 => Self::Level2,
            m if m >= 30 => Self::Level1,
            _ => Self::Level0,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Level0 => 0,
            Self::Level1 => 1,
            Self::Level2 => 2,
            Self::Level3 => 3,
        }
    }

    fn volume_factor(self) -> f64 {
        match self {
            Self::Level0 => 1.0,
            Self::Level1 => 0.85,
            Self::Level2 => 0.75,
            Self::Level3 => 0.65,
        }
    }

    fn delta_offset(self) -> f64 {
        match self {
            Self::Level0 => 0.0,
            Self::Level1 => 0.03,
            Self::Level2 => 0.05,
            Self::Level3 => 0.08,
        }
    }

    fn momentum_offset(self) -> f64 {
        match self {
            Self::Level0 => 0.0,
            Self::Level1 => 0.5,
            Self::Level2 => 1.0,
            Self::Level3 => 1.5,
        }
    }

    fn gate_offset(self) -> f64 {
        10.0 * self.as_u8() as f64
    }
}

impl std::fmt::Display for RelaxationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.as_u8())
    }
}

// =============================================================================
// Adaptive state — owned by the engine loop, read by everyone else
// =============================================================================

/// Drought tracking for the adaptive policy.  Owned exclusively by the engine
/// loop; other tasks only read derived snapshots.
#[derive(Debug, Clone)]
pub struct AdaptiveState {
    pub current_session: String,
    pub last_signal_time: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

impl AdaptiveState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_session: String::new(),
            last_signal_time: None,
            started_at: now,
        }
    }

    /// Minutes since the last accepted signal (since startup when none yet).
    pub fn drought_minutes(&self, now: DateTime<Utc>) -> i64 {
        let anchor = self.last_signal_time.unwrap_or(self.started_at);
        (now - anchor).num_minutes().max(0)
    }

    pub fn relaxation_level(&self, now: DateTime<Utc>) -> RelaxationLevel {
        RelaxationLevel::from_drought_minutes(self.drought_minutes(now))
    }

    /// Reset the drought clock.  Called the instant the Striker accepts a
    /// Target.
    pub fn record_signal(&mut self, now: DateTime<Utc>) {
        let level = self.relaxation_level(now);
        if level != RelaxationLevel::Level0 {
            info!(%level, "signal accepted — relaxation reset to L0");
        }
        self.last_signal_time = Some(now);
    }

    /// Refresh the session label, logging transitions.  Called by the
    /// adaptive refresh task.
    pub fn update_session(&mut self, session: &Session) {
        if self.current_session != session.name {
            info!(
                from = %self.current_session,
                to = %session.name,
                "market session changed"
            );
            self.current_session = session.name.clone();
        }
    }
}

// =============================================================================
// Effective policy
// =============================================================================

/// Session thresholds after drought relaxation.  Valid for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub session_name: String,
    pub relaxation_level: RelaxationLevel,
    pub volume_threshold: f64,
    pub delta_threshold: f64,
    pub momentum_min: f64,
    pub momentum_max: f64,
    pub score_gate: f64,
    pub position_size_multiplier: f64,
}

/// Derive the effective thresholds for `session` under the drought level
/// implied by `drought_minutes`.  Pure: tests drive it deterministically.
pub fn effective_policy(
    session: &Session,
    drought_minutes: i64,
    base_score_gate: f64,
) -> EffectivePolicy {
    let level = RelaxationLevel::from_drought_minutes(drought_minutes);

    EffectivePolicy {
        session_name: session.name.clone(),
        relaxation_level: level,
        volume_threshold: session.volume_threshold * level.volume_factor(),
        delta_threshold: (session.delta_threshold - level.delta_offset()).max(0.0),
        momentum_min: (session.momentum_min - level.momentum_offset()).max(0.0),
        // Upper bounds are never widened by relaxation.
        momentum_max: session.momentum_max,
        score_gate: base_score_gate - level.gate_offset(),
        position_size_multiplier: session.position_size_multiplier,
    }
}
