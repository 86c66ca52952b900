// =============================================================================
// Preflight Audit — validate config and durable state before trading
// =============================================================================
//
// The `audit` subcommand runs every check and exits 2 when any failure is
// found.  Failures block trading; warnings are printed but do not.
// =============================================================================

use anyhow::Result;
use tracing::{info, warn};

use crate::config::BotConfig;
use crate::session::SessionCalendar;
use crate::wal::Wal;

/// Outcome of a preflight pass.
#[derive(Debug, Default)]
pub struct AuditReport {
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
}

impl AuditReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every preflight check against `config`.
pub fn run_preflight(config: &BotConfig) -> Result<AuditReport> {
    let mut report = AuditReport::default();

    check_calendar(config, &mut report);
    check_trading(config, &mut report);
    check_screener(config, &mut report);
    check_limits(config, &mut report);
    check_state_dir(config, &mut report);
    check_wal(config, &mut report);

    for failure in &report.failures {
        warn!(check = %failure, "preflight FAILURE");
    }
    for warning in &report.warnings {
        warn!(check = %warning, "preflight warning");
    }
    if report.passed() {
        info!(warnings = report.warnings.len(), "preflight passed");
    }
    Ok(report)
}

/// Every UTC hour must match exactly one session.
fn check_calendar(config: &BotConfig, report: &mut AuditReport) {
    let calendar = SessionCalendar::new(config.sessions.clone());
    for (hour, count) in calendar.coverage_errors() {
        report.failures.push(format!(
            "session calendar: hour {hour:02} matches {count} sessions (want exactly 1)"
        ));
    }
    for session in calendar.sessions() {
        if session.momentum_min > session.momentum_max {
            report.failures.push(format!(
                "session {}: momentum_min {} exceeds momentum_max {}",
                session.name, session.momentum_min, session.momentum_max
            ));
        }
        if session.position_size_multiplier <= 0.0 {
            report.failures.push(format!(
                "session {}: position_size_multiplier must be positive",
                session.name
            ));
        }
    }
}

fn check_trading(config: &BotConfig, report: &mut AuditReport) {
    let t = &config.trading;
    if t.initial_capital <= 0.0 {
        report.failures.push("trading.initial_capital must be positive".into());
    }
    if t.aggression_factor <= 0.0 || t.aggression_factor > 1.0 {
        report
            .failures
            .push("trading.aggression_factor must be in (0, 1]".into());
    }
    if t.max_position_usd <= 0.0 {
        report.failures.push("trading.max_position_usd must be positive".into());
    }
    if t.stop_loss_pct <= 0.0 {
        report.failures.push("trading.stop_loss_pct must be positive".into());
    }
    if t.trailing_pct <= 0.0 || t.trailing_activation_pct <= 0.0 {
        report
            .failures
            .push("trading trailing settings must be positive".into());
    }
    if t.max_open_positions == 0 {
        report.failures.push("trading.max_open_positions must be >= 1".into());
    }
    if t.take_profit_pct < 1.5 * t.stop_loss_pct {
        report.warnings.push(format!(
            "trading.take_profit_pct {} below 1.5x stop_loss_pct — targets will be clamped up",
            t.take_profit_pct
        ));
    }
    if t.trading_interval_seconds == 0 {
        report
            .failures
            .push("trading.trading_interval_seconds must be >= 1".into());
    }
}

fn check_screener(config: &BotConfig, report: &mut AuditReport) {
    let s = &config.screener;
    if s.max_pairs == 0 {
        report.failures.push("screener.max_pairs must be >= 1".into());
    }
    if s.min_price_change_pct > s.max_price_change_pct {
        report.failures.push(format!(
            "screener momentum band inverted: {} > {}",
            s.min_price_change_pct, s.max_price_change_pct
        ));
    }
    if s.quote_asset.is_empty() {
        report.failures.push("screener.quote_asset must not be empty".into());
    }
    if (s.volume_spike_threshold - config.scoring.volume_spike_min).abs() > f64::EPSILON {
        report.warnings.push(format!(
            "screener.volume_spike_threshold {} differs from scoring.volume_spike_min {}",
            s.volume_spike_threshold, config.scoring.volume_spike_min
        ));
    }
}

fn check_limits(config: &BotConfig, report: &mut AuditReport) {
    let l = &config.limits;
    if l.safety_divisor < 5 {
        report.warnings.push(format!(
            "limits.safety_divisor {} below floor 5 — the limiter clamps it up",
            l.safety_divisor
        ));
    }
    if l.order_safety_divisor < 10 {
        report.warnings.push(format!(
            "limits.order_safety_divisor {} below floor 10 — the limiter clamps it up",
            l.order_safety_divisor
        ));
    }
    if l.read_rpm == 0 || l.order_rpm == 0 {
        report.failures.push("limits budgets must be positive".into());
    }
}

/// Probe that the state directory is writable before trading depends on it.
fn check_state_dir(config: &BotConfig, report: &mut AuditReport) {
    let dir = std::path::Path::new(&config.state.dir);
    if let Err(e) = std::fs::create_dir_all(dir) {
        report
            .failures
            .push(format!("state dir {} not creatable: {e}", dir.display()));
        return;
    }

    let probe = dir.join(".audit_probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
        }
        Err(e) => {
            report
                .failures
                .push(format!("state dir {} not writable: {e}", dir.display()));
        }
    }

    if config.kill_switch_path().exists() {
        report
            .warnings
            .push("kill switch file is present — trading will halt immediately".into());
    }
}

/// An existing WAL must replay cleanly.
fn check_wal(config: &BotConfig, report: &mut AuditReport) {
    let path = config.wal_path();
    if !path.exists() {
        return;
    }
    match Wal::replay_path(&path) {
        Ok(entries) => {
            info!(records = entries.len(), "WAL replays cleanly");
        }
        Err(e) => {
            report
                .failures
                .push(format!("WAL at {} does not replay: {e:#}", path.display()));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> BotConfig {
        let mut config = BotConfig::default();
        config.state.dir = dir.path().to_string_lossy().into_owned();
        config
    }

    #[test]
    fn default_config_passes() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_preflight(&config_in(&dir)).unwrap();
        assert!(report.passed(), "failures: {:?}", report.failures);
    }

    #[test]
    fn calendar_gap_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.sessions[0].utc_end_hour = 6; // hours 6,7 uncovered
        let report = run_preflight(&config).unwrap();
        assert!(!report.passed());
        assert!(report.failures.iter().any(|f| f.contains("hour 06")));
    }

    #[test]
    fn bad_geometry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.trading.stop_loss_pct = 0.0;
        config.trading.max_open_positions = 0;
        let report = run_preflight(&config).unwrap();
        assert!(report.failures.len() >= 2);
    }

    #[test]
    fn low_take_profit_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.trading.take_profit_pct = 1.0; // below 1.5x stop of 1.0
        let report = run_preflight(&config).unwrap();
        assert!(report.passed());
        assert!(report.warnings.iter().any(|w| w.contains("clamped")));
    }

    #[test]
    fn kill_switch_presence_warns() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        std::fs::write(config.kill_switch_path(), b"x").unwrap();
        let report = run_preflight(&config).unwrap();
        assert!(report.passed());
        assert!(report.warnings.iter().any(|w| w.contains("kill switch")));
    }

    #[test]
    fn corrupt_wal_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        std::fs::write(config.wal_path(), b"garbage\nmore garbage\n").unwrap();
        let report = run_preflight(&config).unwrap();
        assert!(!report.passed());
        assert!(report.failures.iter().any(|f| f.contains("does not replay")));
    }
}
