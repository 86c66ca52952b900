// =============================================================================
// Write-Ahead Log — append-only durable record of intents and outcomes
// =============================================================================
//
// Newline-delimited JSON, one `WalEntry` per line.  Every append is fsynced
// before the corresponding exchange side effect is considered durable.
//
// Ordering invariant, per id: the latest record wins, and an INTENT may be
// followed by exactly one of {COMMITTED, FAILED, GHOST_ADOPTED}.  A position
// closure is recorded under a fresh id whose payload references the entry it
// closes, so the per-id status sequence stays a prefix of
// [INTENT, terminal].
//
// The file is truncated only by compaction, which rewrites the latest record
// per id through a temp file + rename.
// =============================================================================

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::Side;

// =============================================================================
// Records
// =============================================================================

/// Lifecycle status of a WAL id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalStatus {
    Intent,
    Committed,
    Failed,
    GhostAdopted,
}

impl WalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Intent)
    }
}

/// Free-form details carried by a record.  All optional so that every status
/// shares one shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_order_id: Option<String>,
    /// Id of the entry whose position this record closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One durable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: String,
    pub symbol: String,
    pub status: WalStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: WalPayload,
}

impl WalEntry {
    /// New open intent with a fresh id.
    pub fn intent(
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_price: f64,
        leverage: u32,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            status: WalStatus::Intent,
            timestamp: Utc::now(),
            payload: WalPayload {
                side: Some(side),
                quantity: Some(quantity),
                entry_price: Some(entry_price),
                leverage: Some(leverage),
                confidence: Some(confidence),
                ..WalPayload::default()
            },
        }
    }

    /// Terminal commit for an intent id, with realized fill details.
    pub fn committed(intent: &WalEntry, fill_price: f64, quantity: f64) -> Self {
        Self {
            id: intent.id.clone(),
            symbol: intent.symbol.clone(),
            status: WalStatus::Committed,
            timestamp: Utc::now(),
            payload: WalPayload {
                fill_price: Some(fill_price),
                quantity: Some(quantity),
                ..intent.payload.clone()
            },
        }
    }

    /// Terminal failure for an intent id.
    pub fn failed(intent_id: &str, symbol: &str, reason: &str) -> Self {
        Self {
            id: intent_id.to_string(),
            symbol: symbol.to_string(),
            status: WalStatus::Failed,
            timestamp: Utc::now(),
            payload: WalPayload {
                reason: Some(reason.to_string()),
                ..WalPayload::default()
            },
        }
    }

    /// Dead-record invalidation: a fresh FAILED entry that closes an open
    /// record whose position no longer exists on the exchange.
    pub fn dead_record(opened_id: &str, symbol: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            status: WalStatus::Failed,
            timestamp: Utc::now(),
            payload: WalPayload {
                closes: Some(opened_id.to_string()),
                reason: Some("dead record: no matching exchange position".to_string()),
                ..WalPayload::default()
            },
        }
    }

    /// Adoption record for an exchange position with no committed entry.
    /// Reuses `intent_id` when the ghost matches an open intent; otherwise a
    /// fresh id tagged as an emergency adoption.
    pub fn ghost_adopted(
        intent_id: Option<&str>,
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_price: f64,
        confidence: f64,
    ) -> Self {
        let (id, reason) = match intent_id {
            Some(id) => (id.to_string(), "adopted against open intent"),
            None => (Uuid::new_v4().to_string(), "emergency adoption"),
        };
        Self {
            id,
            symbol: symbol.to_string(),
            status: WalStatus::GhostAdopted,
            timestamp: Utc::now(),
            payload: WalPayload {
                side: Some(side),
                quantity: Some(quantity),
                entry_price: Some(entry_price),
                confidence: Some(confidence),
                reason: Some(reason.to_string()),
                ..WalPayload::default()
            },
        }
    }

    /// Closure record: a fresh id committing the exit of `opened.id`.
    pub fn closure(opened_id: &str, symbol: &str, exit_price: f64, pnl: f64, reason: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            status: WalStatus::Committed,
            timestamp: Utc::now(),
            payload: WalPayload {
                closes: Some(opened_id.to_string()),
                exit_price: Some(exit_price),
                realized_pnl: Some(pnl),
                reason: Some(reason.to_string()),
                ..WalPayload::default()
            },
        }
    }
}

// =============================================================================
// Replay folding
// =============================================================================

/// In-memory digest of a WAL replay.
#[derive(Debug, Default)]
pub struct ReplayState {
    /// Latest record per id, in first-seen order.
    pub latest: HashMap<String, WalEntry>,
    /// Ids still at INTENT, keyed by symbol.
    pub open_intents: HashMap<String, WalEntry>,
    /// Open (uncancelled, unclosed) committed or adopted positions, keyed by
    /// symbol.
    pub open_positions: HashMap<String, WalEntry>,
}

/// Fold an ordered entry list into the current state.  Deterministic: two
/// replays of the same file yield identical state.
pub fn fold_state(entries: &[WalEntry]) -> ReplayState {
    let mut latest: HashMap<String, WalEntry> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for e in entries {
        if !latest.contains_key(&e.id) {
            order.push(e.id.clone());
        }
        latest.insert(e.id.clone(), e.clone());
    }

    // Any record referencing an earlier id closes it, whether the close was
    // a committed exit or a dead-record invalidation.
    let closed_ids: std::collections::HashSet<&String> = latest
        .values()
        .filter_map(|e| e.payload.closes.as_ref())
        .collect();

    let mut state = ReplayState::default();
    for id in &order {
        let entry = &latest[id];
        match entry.status {
            WalStatus::Intent => {
                state
                    .open_intents
                    .insert(entry.symbol.clone(), entry.clone());
            }
            WalStatus::Committed | WalStatus::GhostAdopted => {
                let is_closure = entry.payload.closes.is_some();
                if !is_closure && !closed_ids.contains(id) {
                    state
                        .open_positions
                        .insert(entry.symbol.clone(), entry.clone());
                }
            }
            WalStatus::Failed => {}
        }
    }
    state.latest = latest;
    state
}

// =============================================================================
// The log
// =============================================================================

/// Append-only WAL with a single writer lock.
pub struct Wal {
    path: PathBuf,
    writer: Mutex<File>,
}

impl Wal {
    /// Open (or create) the WAL at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create WAL directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open WAL at {}", path.display()))?;

        info!(path = %path.display(), "WAL opened");
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Append one record and fsync before returning.  The corresponding
    /// exchange side effect must not proceed until this returns Ok.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("failed to serialise WAL entry")?;

        let mut file = self.writer.lock();
        writeln!(file, "{line}").context("failed to write WAL entry")?;
        file.sync_data().context("failed to fsync WAL")?;

        debug!(id = %entry.id, symbol = %entry.symbol, status = ?entry.status, "WAL appended");
        Ok(())
    }

    /// Read every record in file order.  A torn trailing line (crash during
    /// write) is skipped with a warning; any earlier malformed line is an
    /// error.
    pub fn replay(&self) -> Result<Vec<WalEntry>> {
        Self::replay_path(&self.path)
    }

    /// Replay an arbitrary WAL file (used by `backtest --wal`).
    pub fn replay_path(path: impl AsRef<Path>) -> Result<Vec<WalEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open WAL at {}", path.display()))?;
        let reader = BufReader::new(file);

        let lines: Vec<String> = reader
            .lines()
            .collect::<std::io::Result<_>>()
            .context("failed to read WAL lines")?;

        let mut entries = Vec::with_capacity(lines.len());
        let last_idx = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if i == last_idx => {
                    warn!(error = %e, "skipping torn trailing WAL line");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("corrupt WAL line {}", i + 1));
                }
            }
        }

        debug!(count = entries.len(), path = %path.display(), "WAL replayed");
        Ok(entries)
    }

    /// Rewrite the file keeping only the latest record per id, via temp +
    /// rename.  The single writer lock is held across the swap.
    pub fn compact(&self) -> Result<()> {
        let entries = self.replay()?;
        let state = fold_state(&entries);

        // Preserve first-seen order for stable output.
        let mut seen = std::collections::HashSet::new();
        let compacted: Vec<&WalEntry> = entries
            .iter()
            .filter(|e| seen.insert(e.id.clone()))
            .map(|e| &state.latest[&e.id])
            .collect();

        let mut writer = self.writer.lock();

        let tmp_path = self.path.with_extension("wal.tmp");
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        for entry in &compacted {
            let line = serde_json::to_string(entry).context("failed to serialise WAL entry")?;
            writeln!(tmp, "{line}").context("failed to write compacted WAL")?;
        }
        tmp.sync_data().context("failed to fsync compacted WAL")?;

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to swap compacted WAL into {}", self.path.display()))?;

        *writer = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to reopen WAL at {}", self.path.display()))?;

        info!(
            records_before = entries.len(),
            records_after = compacted.len(),
            "WAL compacted"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal() -> (tempfile::TempDir, Wal) {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("trade.wal")).unwrap();
        (dir, wal)
    }

    #[test]
    fn entry_roundtrips_through_json() {
        let entry = WalEntry::intent("BTCUSDT", Side::Long, 0.5, 50_000.0, 20, 140.0);
        let json = serde_json::to_string(&entry).unwrap();
        let back: WalEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn status_serialises_screaming() {
        let json = serde_json::to_string(&WalStatus::GhostAdopted).unwrap();
        assert_eq!(json, "\"GHOST_ADOPTED\"");
    }

    #[test]
    fn append_then_replay_preserves_order() {
        let (_dir, wal) = temp_wal();
        let intent = WalEntry::intent("ETHUSDT", Side::Short, 1.0, 2_000.0, 10, 125.0);
        let committed = WalEntry::committed(&intent, 1_999.5, 1.0);

        wal.append(&intent).unwrap();
        wal.append(&committed).unwrap();

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], intent);
        assert_eq!(entries[1], committed);
    }

    #[test]
    fn replay_twice_yields_identical_state() {
        let (_dir, wal) = temp_wal();
        let a = WalEntry::intent("AUSDT", Side::Long, 1.0, 10.0, 10, 130.0);
        wal.append(&a).unwrap();
        wal.append(&WalEntry::committed(&a, 10.1, 1.0)).unwrap();
        let b = WalEntry::intent("BUSDT", Side::Short, 2.0, 5.0, 15, 125.0);
        wal.append(&b).unwrap();

        let first = fold_state(&wal.replay().unwrap());
        let second = fold_state(&wal.replay().unwrap());
        assert_eq!(first.latest, second.latest);
        assert_eq!(
            first.open_positions.keys().collect::<Vec<_>>(),
            second.open_positions.keys().collect::<Vec<_>>()
        );
        assert_eq!(first.open_intents.len(), second.open_intents.len());
    }

    #[test]
    fn latest_record_wins_per_id() {
        let intent = WalEntry::intent("CUSDT", Side::Long, 1.0, 10.0, 10, 130.0);
        let failed = WalEntry::failed(&intent.id, "CUSDT", "order rejected");

        let state = fold_state(&[intent.clone(), failed.clone()]);
        assert_eq!(state.latest[&intent.id].status, WalStatus::Failed);
        assert!(state.open_intents.is_empty());
        assert!(state.open_positions.is_empty());
    }

    #[test]
    fn closure_removes_open_position() {
        let intent = WalEntry::intent("DUSDT", Side::Long, 1.0, 10.0, 10, 130.0);
        let committed = WalEntry::committed(&intent, 10.0, 1.0);
        let close = WalEntry::closure(&intent.id, "DUSDT", 10.5, 0.5, "TakeProfit");

        let open = fold_state(&[intent.clone(), committed.clone()]);
        assert!(open.open_positions.contains_key("DUSDT"));

        let closed = fold_state(&[intent, committed, close]);
        assert!(closed.open_positions.is_empty());
    }

    #[test]
    fn ghost_adoption_is_an_open_position() {
        let ghost = WalEntry::ghost_adopted(None, "EUSDT", Side::Long, 0.02, 100.0, 85.0);
        let state = fold_state(&[ghost.clone()]);
        assert!(state.open_positions.contains_key("EUSDT"));
        assert_eq!(
            state.open_positions["EUSDT"].payload.reason.as_deref(),
            Some("emergency adoption")
        );

        // Adoption against an open intent reuses the intent id.
        let intent = WalEntry::intent("FUSDT", Side::Long, 1.0, 10.0, 10, 130.0);
        let adopted =
            WalEntry::ghost_adopted(Some(&intent.id), "FUSDT", Side::Long, 1.0, 10.0, 85.0);
        assert_eq!(adopted.id, intent.id);
        let state = fold_state(&[intent, adopted]);
        assert!(state.open_intents.is_empty());
        assert!(state.open_positions.contains_key("FUSDT"));
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let (_dir, wal) = temp_wal();
        let intent = WalEntry::intent("GUSDT", Side::Long, 1.0, 10.0, 10, 130.0);
        wal.append(&intent).unwrap();

        // Simulate a crash mid-write.
        {
            let mut f = OpenOptions::new().append(true).open(&wal.path).unwrap();
            write!(f, "{{\"id\":\"trunc").unwrap();
        }

        let entries = wal.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], intent);
    }

    #[test]
    fn corrupt_interior_line_is_an_error() {
        let (_dir, wal) = temp_wal();
        {
            let mut f = OpenOptions::new().append(true).open(&wal.path).unwrap();
            writeln!(f, "not json at all").unwrap();
        }
        wal.append(&WalEntry::intent("HUSDT", Side::Long, 1.0, 10.0, 10, 130.0))
            .unwrap();

        assert!(wal.replay().is_err());
    }

    #[test]
    fn compaction_keeps_latest_per_id_and_state() {
        let (_dir, wal) = temp_wal();
        let a = WalEntry::intent("IUSDT", Side::Long, 1.0, 10.0, 10, 130.0);
        wal.append(&a).unwrap();
        wal.append(&WalEntry::committed(&a, 10.0, 1.0)).unwrap();
        let b = WalEntry::intent("JUSDT", Side::Short, 1.0, 20.0, 10, 130.0);
        wal.append(&b).unwrap();

        let before = fold_state(&wal.replay().unwrap());
        wal.compact().unwrap();
        let entries = wal.replay().unwrap();
        // One record per id survives.
        assert_eq!(entries.len(), 2);
        let after = fold_state(&entries);
        assert_eq!(
            before.open_positions.keys().collect::<Vec<_>>(),
            after.open_positions.keys().collect::<Vec<_>>()
        );
        assert_eq!(before.open_intents.len(), after.open_intents.len());

        // The log stays appendable after the swap.
        wal.append(&WalEntry::failed(&b.id, "JUSDT", "abandoned"))
            .unwrap();
        assert_eq!(wal.replay().unwrap().len(), 3);
    }

    #[test]
    fn missing_file_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = Wal::replay_path(dir.path().join("absent.wal")).unwrap();
        assert!(entries.is_empty());
    }
}
