// =============================================================================
// Exchange Port — abstract capability set over a perpetual-futures venue
// =============================================================================
//
// Everything the engine needs from the exchange: ticker snapshots, klines,
// depth, positions, and market/stop/take-profit orders with reduce-only
// semantics.  The engine never talks HTTP; it talks this trait.
//
// Every call returns a typed `ExchangeError` that says whether a retry is
// safe.  Order submission carries a client-generated id so that retries are
// idempotent at the venue.
// =============================================================================

pub mod binance;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Side;

// =============================================================================
// Error taxonomy
// =============================================================================

/// Typed failure from the exchange.  `is_retryable` partitions the taxonomy:
/// transient errors may be retried with backoff, semantic errors must surface
/// and halt the symbol until the next reconciliation.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by venue")]
    RateLimited,

    #[error("venue unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("insufficient margin")]
    InsufficientMargin,

    #[error("order precision rejected: {0}")]
    Precision(String),

    #[error("position mode mismatch")]
    PositionModeMismatch,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("venue error {code}: {message}")]
    Venue { code: i64, message: String },
}

impl ExchangeError {
    /// True when retrying the same request (with the same client order id)
    /// is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Unavailable(_) | Self::Transport(_)
        )
    }

    /// True for semantic rejections that must halt the symbol until the next
    /// reconciliation.
    pub fn is_semantic(&self) -> bool {
        matches!(
            self,
            Self::InsufficientMargin | Self::Precision(_) | Self::PositionModeMismatch
        )
    }

    /// Map a venue error code + message to a typed variant.  Substring
    /// matching on the message is the last-resort fallback for codes we do
    /// not recognise.
    pub fn classify(code: i64, message: &str) -> Self {
        match code {
            -1003 | -1015 => Self::RateLimited,
            -1111 | -1013 | -4003 => Self::Precision(message.to_string()),
            -2019 => Self::InsufficientMargin,
            -4061 | -4059 => Self::PositionModeMismatch,
            -2013 | -2011 => Self::OrderNotFound(message.to_string()),
            -1021 | -1022 | -2014 | -2015 => Self::Auth(message.to_string()),
            _ => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("insufficient") && lower.contains("margin") {
                    Self::InsufficientMargin
                } else if lower.contains("precision") || lower.contains("lot size") {
                    Self::Precision(message.to_string())
                } else if lower.contains("position side") || lower.contains("position mode") {
                    Self::PositionModeMismatch
                } else {
                    Self::Venue {
                        code,
                        message: message.to_string(),
                    }
                }
            }
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// Immutable 24h market snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub last_price: f64,
    /// 24h price change, percent.
    pub price_change_pct: f64,
    /// 24h traded volume in quote currency.
    pub quote_volume: f64,
    /// Perpetual contract with status TRADING.
    pub tradable: bool,
    pub observed_at: DateTime<Utc>,
}

/// One OHLCV bar, oldest-first in every slice the port returns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub close_time: i64,
}

/// Top-of-book snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_qty: f64,
    pub ask_qty: f64,
}

impl DepthSnapshot {
    /// Absolute order-book imbalance in [0, 1].
    pub fn delta(&self) -> f64 {
        let total = self.bid_qty + self.ask_qty;
        if total <= 0.0 {
            return 0.0;
        }
        ((self.bid_qty - self.ask_qty) / total).abs()
    }

    /// Top-of-book spread as a percentage of the mid price.
    pub fn spread_pct(&self) -> f64 {
        let mid = (self.best_bid + self.best_ask) / 2.0;
        if mid <= 0.0 {
            return f64::INFINITY;
        }
        (self.best_ask - self.best_bid).max(0.0) / mid * 100.0
    }
}

/// Authoritative position as reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    /// Absolute position size in base units; always > 0 for a live position.
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

/// Acknowledgement for a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    /// Average fill price when the venue reports one (market orders).
    pub fill_price: Option<f64>,
    pub filled_qty: f64,
}

// =============================================================================
// The port
// =============================================================================

/// Abstract exchange capability set.  All calls are cancellable; callers wrap
/// them in deadlines and treat a cancelled call as possibly-executed,
/// relying on reconciliation.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// 24h snapshots for the full tradable universe.
    async fn list_ticker_snapshots(&self) -> Result<Vec<TickerSnapshot>, ExchangeError>;

    /// Most recent `limit` klines for `symbol`, oldest first.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError>;

    /// Top-of-book depth for `symbol`.
    async fn get_depth(&self, symbol: &str) -> Result<DepthSnapshot, ExchangeError>;

    /// All live positions.
    async fn list_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    /// Live position on `symbol`, if any.
    async fn get_position(&self, symbol: &str)
        -> Result<Option<ExchangePosition>, ExchangeError>;

    /// Market order.  `reduce_only` guards closing flows against flipping
    /// into a fresh position.
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError>;

    /// Reduce-only stop-market protecting a position on `position_side`.
    async fn submit_stop_order(
        &self,
        symbol: &str,
        position_side: Side,
        stop_price: f64,
        qty: f64,
    ) -> Result<OrderAck, ExchangeError>;

    /// Reduce-only take-profit-market for a position on `position_side`.
    async fn submit_take_profit_order(
        &self,
        symbol: &str,
        position_side: Side,
        price: f64,
        qty: f64,
    ) -> Result<OrderAck, ExchangeError>;

    /// Cancel an open order by venue id.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// Set isolated leverage for `symbol`.  Must precede order submission.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_partition() {
        assert!(ExchangeError::Timeout.is_retryable());
        assert!(ExchangeError::RateLimited.is_retryable());
        assert!(ExchangeError::Transport("reset".into()).is_retryable());
        assert!(!ExchangeError::InsufficientMargin.is_retryable());
        assert!(!ExchangeError::Precision("qty".into()).is_retryable());
        assert!(!ExchangeError::PositionModeMismatch.is_retryable());
    }

    #[test]
    fn semantic_partition() {
        assert!(ExchangeError::InsufficientMargin.is_semantic());
        assert!(ExchangeError::PositionModeMismatch.is_semantic());
        assert!(!ExchangeError::Timeout.is_semantic());
        assert!(!ExchangeError::Auth("bad key".into()).is_semantic());
    }

    #[test]
    fn classify_known_codes() {
        assert!(matches!(
            ExchangeError::classify(-2019, "Margin is insufficient."),
            ExchangeError::InsufficientMargin
        ));
        assert!(matches!(
            ExchangeError::classify(-1111, "Precision is over the maximum"),
            ExchangeError::Precision(_)
        ));
        assert!(matches!(
            ExchangeError::classify(-4061, "Order's position side does not match"),
            ExchangeError::PositionModeMismatch
        ));
        assert!(matches!(
            ExchangeError::classify(-1003, "Too many requests"),
            ExchangeError::RateLimited
        ));
    }

    #[test]
    fn classify_falls_back_to_substring_then_opaque() {
        assert!(matches!(
            ExchangeError::classify(-9999, "insufficient margin for order"),
            ExchangeError::InsufficientMargin
        ));
        assert!(matches!(
            ExchangeError::classify(-9999, "something novel"),
            ExchangeError::Venue { code: -9999, .. }
        ));
    }

    #[test]
    fn depth_delta_and_spread() {
        let d = DepthSnapshot {
            best_bid: 99.95,
            best_ask: 100.05,
            bid_qty: 30.0,
            ask_qty: 10.0,
        };
        assert!((d.delta() - 0.5).abs() < 1e-9);
        assert!((d.spread_pct() - 0.1).abs() < 1e-6);

        let empty = DepthSnapshot {
            best_bid: 0.0,
            best_ask: 0.0,
            bid_qty: 0.0,
            ask_qty: 0.0,
        };
        assert_eq!(empty.delta(), 0.0);
    }
}
