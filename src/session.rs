// =============================================================================
// Session Calendar — maps UTC wall-clock time to a named market session
// =============================================================================
//
// The calendar is a static, closed set declared at startup.  Sessions tile the
// 24h UTC day without gaps; wrap-around windows (start > end) cover the
// half-open interval [start, 24) ∪ [0, end).  A boundary hour resolves to the
// session whose start equals that hour.
// =============================================================================

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A named UTC time window with its own baseline screening thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub utc_start_hour: u32,
    pub utc_end_hour: u32,

    /// Minimum 24h quote volume accepted during this session.
    pub volume_threshold: f64,

    /// Minimum order-book delta accepted during this session.
    pub delta_threshold: f64,

    /// Accepted absolute 24h change band, in percent.
    pub momentum_min: f64,
    pub momentum_max: f64,

    /// Baseline signal rate this session is expected to produce.
    pub expected_signals_per_hour: f64,

    /// Scales position notional for this session.
    pub position_size_multiplier: f64,
}

impl Session {
    /// True when UTC hour `hour` falls inside this session's window.
    pub fn contains_hour(&self, hour: u32) -> bool {
        if self.utc_start_hour <= self.utc_end_hour {
            hour >= self.utc_start_hour && hour < self.utc_end_hour
        } else {
            // Wrap-around: [start, 24) ∪ [0, end)
            hour >= self.utc_start_hour || hour < self.utc_end_hour
        }
    }

    /// Built-in calendar tiling the 24h day.  Overridable from the config
    /// file; the audit validates exact coverage either way.
    pub fn default_calendar() -> Vec<Session> {
        vec![
            Session {
                name: "ASIA".to_string(),
                utc_start_hour: 0,
                utc_end_hour: 8,
                volume_threshold: 3_000_000.0,
                delta_threshold: 0.60,
                momentum_min: 2.0,
                momentum_max: 15.0,
                expected_signals_per_hour: 2.0,
                position_size_multiplier: 0.8,
            },
            Session {
                name: "EUROPE".to_string(),
                utc_start_hour: 8,
                utc_end_hour: 14,
                volume_threshold: 5_000_000.0,
                delta_threshold: 0.65,
                momentum_min: 2.5,
                momentum_max: 18.0,
                expected_signals_per_hour: 3.0,
                position_size_multiplier: 1.0,
            },
            Session {
                name: "US".to_string(),
                utc_start_hour: 14,
                utc_end_hour: 22,
                volume_threshold: 8_000_000.0,
                delta_threshold: 0.70,
                momentum_min: 3.0,
                momentum_max: 20.0,
                expected_signals_per_hour: 4.0,
                position_size_multiplier: 1.2,
            },
            Session {
                name: "OVERNIGHT".to_string(),
                utc_start_hour: 22,
                utc_end_hour: 0,
                volume_threshold: 2_000_000.0,
                delta_threshold: 0.55,
                momentum_min: 1.5,
                momentum_max: 12.0,
                expected_signals_per_hour: 1.0,
                position_size_multiplier: 0.6,
            },
        ]
    }
}

// =============================================================================
// Calendar lookup
// =============================================================================

/// Closed set of sessions with deterministic hour lookup.
#[derive(Debug, Clone)]
pub struct SessionCalendar {
    sessions: Vec<Session>,
}

impl SessionCalendar {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self { sessions }
    }

    /// The session active at `now_utc`.
    ///
    /// Boundary instants resolve to the session whose start equals the hour;
    /// otherwise the first window containing the hour wins.  Returns `None`
    /// only for a calendar with a coverage gap, which the audit rejects
    /// before the engine starts.
    pub fn current_session(&self, now_utc: DateTime<Utc>) -> Option<&Session> {
        let hour = now_utc.hour();
        self.sessions
            .iter()
            .find(|s| s.utc_start_hour == hour)
            .or_else(|| self.sessions.iter().find(|s| s.contains_hour(hour)))
    }

    /// Verify that every UTC hour matches exactly one session.  Returns the
    /// offending hours (hour, match_count) when coverage is broken.
    pub fn coverage_errors(&self) -> Vec<(u32, usize)> {
        (0..24)
            .map(|h| (h, self.sessions.iter().filter(|s| s.contains_hour(h)).count()))
            .filter(|&(_, n)| n != 1)
            .collect()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, hour, 30, 0).unwrap()
    }

    #[test]
    fn default_calendar_covers_every_hour_exactly_once() {
        let cal = SessionCalendar::new(Session::default_calendar());
        assert!(cal.coverage_errors().is_empty(), "default calendar must tile 24h");
    }

    #[test]
    fn every_hour_resolves_to_one_session() {
        let cal = SessionCalendar::new(Session::default_calendar());
        for h in 0..24 {
            assert!(
                cal.current_session(at_hour(h)).is_some(),
                "hour {h} has no session"
            );
        }
    }

    #[test]
    fn wraparound_window_spans_midnight() {
        let cal = SessionCalendar::new(Session::default_calendar());
        assert_eq!(cal.current_session(at_hour(23)).unwrap().name, "OVERNIGHT");
        // [22, 0) ends before hour 0; hour 0 belongs to ASIA.
        assert_eq!(cal.current_session(at_hour(0)).unwrap().name, "ASIA");
    }

    #[test]
    fn boundary_hour_resolves_to_starting_session() {
        let cal = SessionCalendar::new(Session::default_calendar());
        assert_eq!(cal.current_session(at_hour(8)).unwrap().name, "EUROPE");
        assert_eq!(cal.current_session(at_hour(14)).unwrap().name, "US");
        assert_eq!(cal.current_session(at_hour(22)).unwrap().name, "OVERNIGHT");
    }

    #[test]
    fn gap_is_reported() {
        let mut sessions = Session::default_calendar();
        // Shrink ASIA to [0,6): hours 6 and 7 become uncovered.
        sessions[0].utc_end_hour = 6;
        let cal = SessionCalendar::new(sessions);
        let errors = cal.coverage_errors();
        assert_eq!(errors, vec![(6, 0), (7, 0)]);
    }

    #[test]
    fn overlap_is_reported() {
        let mut sessions = Session::default_calendar();
        // Extend ASIA to [0,9): hour 8 now matches two sessions.
        sessions[0].utc_end_hour = 9;
        let cal = SessionCalendar::new(sessions);
        let errors = cal.coverage_errors();
        assert_eq!(errors, vec![(8, 2)]);
    }

    #[test]
    fn contains_hour_wraparound() {
        let s = Session {
            name: "X".into(),
            utc_start_hour: 21,
            utc_end_hour: 3,
            volume_threshold: 0.0,
            delta_threshold: 0.0,
            momentum_min: 0.0,
            momentum_max: 0.0,
            expected_signals_per_hour: 0.0,
            position_size_multiplier: 1.0,
        };
        assert!(s.contains_hour(21));
        assert!(s.contains_hour(23));
        assert!(s.contains_hour(0));
        assert!(s.contains_hour(2));
        assert!(!s.contains_hour(3));
        assert!(!s.contains_hour(12));
    }
}
