// =============================================================================
// Bot Configuration — typed settings with serde defaults and atomic save
// =============================================================================
//
// Central configuration hub for the Kestrel engine.  One JSON file holds every
// tunable parameter, split into the sections the engine subsystems consume:
// trading, screener, sessions, scoring, limits, state, emergency.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// Exchange credentials are NOT part of this file; they come from the
// environment (KESTREL_API_KEY / KESTREL_API_SECRET).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::session::Session;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_initial_capital() -> f64 {
    10_000.0
}

fn default_aggression_factor() -> f64 {
    0.02
}

fn default_max_position_usd() -> f64 {
    1_000.0
}

fn default_stop_loss_pct() -> f64 {
    1.0
}

fn default_take_profit_pct() -> f64 {
    2.0
}

fn default_trailing_pct() -> f64 {
    0.5
}

fn default_trailing_activation_pct() -> f64 {
    1.0
}

fn default_trading_interval_seconds() -> u64 {
    30
}

fn default_max_trades_per_day() -> u32 {
    30
}

fn default_symbol_cooldown_minutes() -> i64 {
    60
}

fn default_min_confidence() -> f64 {
    90.0
}

fn default_max_spread_pct() -> f64 {
    0.1
}

fn default_min_volume_24h_usd() -> f64 {
    5_000_000.0
}

fn default_max_open_positions() -> usize {
    3
}

fn default_screener_interval_seconds() -> u64 {
    30
}

fn default_max_pairs() -> usize {
    5
}

fn default_min_price_change_pct() -> f64 {
    0.5
}

fn default_max_price_change_pct() -> f64 {
    20.0
}

fn default_volume_spike_threshold() -> f64 {
    3.0
}

fn default_screener_min_volume() -> f64 {
    1_000_000.0
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_ignore_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
    ]
}

fn default_min_score_gate() -> f64 {
    120.0
}

fn default_volume_spike_min() -> f64 {
    3.0
}

fn default_delta_min() -> f64 {
    0.40
}

fn default_atr_multiplier() -> f64 {
    1.0
}

fn default_price_momentum_min() -> f64 {
    0.5
}

fn default_adx_min() -> f64 {
    25.0
}

fn default_breakout_bonus() -> f64 {
    25.0
}

fn default_fvg_bonus() -> f64 {
    25.0
}

fn default_read_rpm() -> u32 {
    1200
}

fn default_order_rpm() -> u32 {
    300
}

fn default_safety_divisor() -> u32 {
    5
}

fn default_order_safety_divisor() -> u32 {
    10
}

fn default_state_dir() -> String {
    ".kestrel".to_string()
}

fn default_wal_file() -> String {
    "trade.wal".to_string()
}

fn default_save_interval_seconds() -> u64 {
    60
}

fn default_kill_switch_path() -> String {
    "kill_switch".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Sections
// =============================================================================

/// Capital, risk geometry, and cadence settings for the trading loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Capital base used for position sizing, in quote currency.
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,

    /// Fraction of capital committed per trade before session and confidence
    /// multipliers apply.
    #[serde(default = "default_aggression_factor")]
    pub aggression_factor: f64,

    /// Hard cap on the notional of a single position.
    #[serde(default = "default_max_position_usd")]
    pub max_position_usd: f64,

    /// Stop-loss distance as a percentage of entry price.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Take-profit distance as a percentage of entry price.  Clamped upward
    /// so that reward/risk never drops below 1.5.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Trailing distance as a percentage of the peak price once armed.
    #[serde(default = "default_trailing_pct")]
    pub trailing_pct: f64,

    /// Favourable move from entry (percent) that arms the trailing stop.
    #[serde(default = "default_trailing_activation_pct")]
    pub trailing_activation_pct: f64,

    /// Trading tick cadence in seconds.
    #[serde(default = "default_trading_interval_seconds")]
    pub trading_interval_seconds: u64,

    /// Maximum positions opened per UTC day.
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    /// Minimum minutes between two entries on the same symbol.
    #[serde(default = "default_symbol_cooldown_minutes")]
    pub symbol_cooldown_minutes: i64,

    /// Minimum confidence score a target needs in addition to the score gate.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Maximum top-of-book spread (percent) accepted at entry.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,

    /// Minimum 24h quote volume accepted at entry.
    #[serde(default = "default_min_volume_24h_usd")]
    pub min_volume_24h_usd: f64,

    /// Maximum concurrently open positions before rotation is considered.
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            aggression_factor: default_aggression_factor(),
            max_position_usd: default_max_position_usd(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            trailing_pct: default_trailing_pct(),
            trailing_activation_pct: default_trailing_activation_pct(),
            trading_interval_seconds: default_trading_interval_seconds(),
            max_trades_per_day: default_max_trades_per_day(),
            symbol_cooldown_minutes: default_symbol_cooldown_minutes(),
            min_confidence: default_min_confidence(),
            max_spread_pct: default_max_spread_pct(),
            min_volume_24h_usd: default_min_volume_24h_usd(),
            max_open_positions: default_max_open_positions(),
        }
    }
}

/// How the universe is filtered down to a bounded candidate set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenerConfig {
    /// Screener cadence in seconds (informational; the trading tick drives it).
    #[serde(default = "default_screener_interval_seconds")]
    pub interval_seconds: u64,

    /// Upper bound on candidates returned per tick.
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,

    /// Ordering applied before truncation to `max_pairs`.
    #[serde(default)]
    pub sort_by: SortKey,

    /// Static 24h quote-volume floor; the session threshold layers on top.
    #[serde(default = "default_screener_min_volume")]
    pub min_volume_24h: f64,

    /// 24h quote-volume ceiling; zero or negative disables the ceiling.
    #[serde(default)]
    pub max_volume_24h: f64,

    /// Minimum absolute 24h change (percent).
    #[serde(default = "default_min_price_change_pct")]
    pub min_price_change_pct: f64,

    /// Maximum absolute 24h change (percent).
    #[serde(default = "default_max_price_change_pct")]
    pub max_price_change_pct: f64,

    /// When set, the major-cap ignore list is NOT applied.
    #[serde(default)]
    pub high_risk_mode: bool,

    /// Volume-spike ratio the audit cross-checks against `scoring.volume_spike_min`.
    #[serde(default = "default_volume_spike_threshold")]
    pub volume_spike_threshold: f64,

    /// Quote currency suffix the tradable universe must match.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Major-cap symbols excluded outside high-risk mode.
    #[serde(default = "default_ignore_symbols")]
    pub ignore_symbols: Vec<String>,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_screener_interval_seconds(),
            max_pairs: default_max_pairs(),
            sort_by: SortKey::default(),
            min_volume_24h: default_screener_min_volume(),
            max_volume_24h: 0.0,
            min_price_change_pct: default_min_price_change_pct(),
            max_price_change_pct: default_max_price_change_pct(),
            high_risk_mode: false,
            volume_spike_threshold: default_volume_spike_threshold(),
            quote_asset: default_quote_asset(),
            ignore_symbols: default_ignore_symbols(),
        }
    }
}

/// Candidate ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Score,
    Confidence,
    Volatility,
}

impl Default for SortKey {
    fn default() -> Self {
        Self::Score
    }
}

/// Thresholds and bonuses for the additive scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Baseline score gate at relaxation level 0.
    #[serde(default = "default_min_score_gate")]
    pub min_score_gate: f64,

    /// Volume ratio at which the spike component awards points.
    #[serde(default = "default_volume_spike_min")]
    pub volume_spike_min: f64,

    /// Absolute order-book-delta floor; relaxation cannot push the session
    /// threshold below it.
    #[serde(default = "default_delta_min")]
    pub delta_min: f64,

    /// Scale applied to ATR%/price before threshold comparison.
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,

    /// Absolute momentum floor the scorer enforces even when the session
    /// policy is looser.
    #[serde(default = "default_price_momentum_min")]
    pub price_momentum_min: f64,

    /// ADX value at which the trend component awards points.
    #[serde(default = "default_adx_min")]
    pub adx_min: f64,

    /// Discrete bonus for a confirmed breakout.
    #[serde(default = "default_breakout_bonus")]
    pub breakout_bonus: f64,

    /// Discrete bonus for an open fair-value gap at the current price.
    #[serde(default = "default_fvg_bonus")]
    pub fvg_bonus: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_score_gate: default_min_score_gate(),
            volume_spike_min: default_volume_spike_min(),
            delta_min: default_delta_min(),
            atr_multiplier: default_atr_multiplier(),
            price_momentum_min: default_price_momentum_min(),
            adx_min: default_adx_min(),
            breakout_bonus: default_breakout_bonus(),
            fvg_bonus: default_fvg_bonus(),
        }
    }
}

/// Per-endpoint request budgets, before the safety divisors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Documented venue budget for read endpoints, requests per minute.
    #[serde(default = "default_read_rpm")]
    pub read_rpm: u32,

    /// Documented venue budget for order endpoints, requests per minute.
    #[serde(default = "default_order_rpm")]
    pub order_rpm: u32,

    /// Global divisor applied to read budgets.  Must be >= 5.
    #[serde(default = "default_safety_divisor")]
    pub safety_divisor: u32,

    /// Divisor applied to order budgets.  Must be >= 10.
    #[serde(default = "default_order_safety_divisor")]
    pub order_safety_divisor: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            read_rpm: default_read_rpm(),
            order_rpm: default_order_rpm(),
            safety_divisor: default_safety_divisor(),
            order_safety_divisor: default_order_safety_divisor(),
        }
    }
}

/// Where durable state lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory holding the WAL, state snapshot, and kill switch.
    #[serde(default = "default_state_dir")]
    pub dir: String,

    /// WAL file name within `dir`.
    #[serde(default = "default_wal_file")]
    pub file: String,

    /// Cadence of the atomic state.json snapshot, in seconds.
    #[serde(default = "default_save_interval_seconds")]
    pub save_interval_seconds: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            file: default_wal_file(),
            save_interval_seconds: default_save_interval_seconds(),
        }
    }
}

/// Operator kill switch and crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    /// Kill-switch file; presence halts trading on the next tick.  Relative
    /// paths resolve against the state directory.
    #[serde(default = "default_kill_switch_path")]
    pub kill_switch_path: String,

    /// When false, the reconciler reports ghosts but does not adopt them.
    #[serde(default = "default_true")]
    pub recovery_enabled: bool,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            kill_switch_path: default_kill_switch_path(),
            recovery_enabled: true,
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the Kestrel engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub trading: TradingConfig,

    #[serde(default)]
    pub screener: ScreenerConfig,

    /// Session calendar.  Must tile the 24h UTC day; validated by the audit.
    #[serde(default = "Session::default_calendar")]
    pub sessions: Vec<Session>,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub emergency: EmergencyConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            screener: ScreenerConfig::default(),
            sessions: Session::default_calendar(),
            scoring: ScoringConfig::default(),
            limits: LimitsConfig::default(),
            state: StateConfig::default(),
            emergency: EmergencyConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Missing file is an error so the caller can decide whether defaults are
    /// acceptable for the current subcommand.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            sessions = config.sessions.len(),
            interval_secs = config.trading.trading_interval_seconds,
            max_open = config.trading.max_open_positions,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Absolute path of the WAL file.
    pub fn wal_path(&self) -> std::path::PathBuf {
        Path::new(&self.state.dir).join(&self.state.file)
    }

    /// Absolute path of the state snapshot file.
    pub fn state_snapshot_path(&self) -> std::path::PathBuf {
        Path::new(&self.state.dir).join("state.json")
    }

    /// Kill-switch path; relative values resolve against the state directory.
    pub fn kill_switch_path(&self) -> std::path::PathBuf {
        let p = Path::new(&self.emergency.kill_switch_path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            Path::new(&self.state.dir).join(p)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = BotConfig::default();
        assert!((cfg.trading.initial_capital - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.trading.trading_interval_seconds, 30);
        assert_eq!(cfg.trading.max_open_positions, 3);
        assert_eq!(cfg.screener.max_pairs, 5);
        assert_eq!(cfg.screener.sort_by, SortKey::Score);
        assert!((cfg.scoring.min_score_gate - 120.0).abs() < f64::EPSILON);
        assert_eq!(cfg.limits.safety_divisor, 5);
        assert_eq!(cfg.limits.order_safety_divisor, 10);
        assert_eq!(cfg.state.file, "trade.wal");
        assert!(cfg.emergency.recovery_enabled);
        assert_eq!(cfg.sessions.len(), 4);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert!((cfg.trading.stop_loss_pct - 1.0).abs() < f64::EPSILON);
        assert!((cfg.trading.take_profit_pct - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.screener.quote_asset, "USDT");
        assert!(!cfg.screener.high_risk_mode);
        assert_eq!(cfg.sessions.len(), 4);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading": { "max_open_positions": 7 },
                        "screener": { "sort_by": "volatility" } }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading.max_open_positions, 7);
        assert_eq!(cfg.screener.sort_by, SortKey::Volatility);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.trading.max_trades_per_day, 30);
        assert!((cfg.scoring.delta_min - 0.40).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = BotConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.screener.ignore_symbols, cfg2.screener.ignore_symbols);
        assert_eq!(cfg.trading.max_open_positions, cfg2.trading.max_open_positions);
        assert_eq!(cfg.sessions.len(), cfg2.sessions.len());
    }

    #[test]
    fn save_and_load_via_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = BotConfig::default();
        cfg.trading.max_trades_per_day = 12;
        cfg.save(&path).unwrap();

        let loaded = BotConfig::load(&path).unwrap();
        assert_eq!(loaded.trading.max_trades_per_day, 12);
    }

    #[test]
    fn kill_switch_path_resolves_relative_to_state_dir() {
        let cfg = BotConfig::default();
        assert_eq!(
            cfg.kill_switch_path(),
            Path::new(".kestrel").join("kill_switch")
        );
    }
}
