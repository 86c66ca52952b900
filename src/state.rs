// =============================================================================
// State Snapshot — last-known engine summary, written atomically
// =============================================================================
//
// Not a source of truth: the WAL and the exchange are.  state.json exists for
// operators and for fast inspection after a crash.  Writes go through a temp
// file + rename on every save interval and at shutdown.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Side;

/// Condensed view of one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub trailing_armed: bool,
}

/// Operator-facing engine summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    #[serde(default)]
    pub capital: f64,
    #[serde(default)]
    pub trades_today: u32,
    #[serde(default)]
    pub wins_today: u32,
    #[serde(default)]
    pub losses_today: u32,
    #[serde(default)]
    pub realized_pnl_today: f64,
    #[serde(default)]
    pub drought_minutes: i64,
    #[serde(default)]
    pub current_session: String,
    #[serde(default)]
    pub open_positions: Vec<PositionSummary>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl EngineSnapshot {
    /// Write atomically via temp + rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise state snapshot")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        debug!(path = %path.display(), "state snapshot saved (atomic)");
        Ok(())
    }

    /// Load a snapshot; missing file yields the default.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot from {}", path.display()))
    }
}
