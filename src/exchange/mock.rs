// =============================================================================
// Mock Exchange — scripted Exchange Port for unit tests
// =============================================================================
//
// Holds scripted tickers, klines, depth, and positions behind locks, records
// every order it receives, and can be told to fail specific operations.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::exchange::{
    DepthSnapshot, ExchangeError, ExchangePort, ExchangePosition, Kline, OrderAck,
    TickerSnapshot,
};
use crate::types::Side;

/// A single order the mock received, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOrder {
    Market {
        symbol: String,
        side: Side,
        qty: f64,
        reduce_only: bool,
    },
    Stop {
        symbol: String,
        position_side: Side,
        stop_price: f64,
        qty: f64,
    },
    TakeProfit {
        symbol: String,
        position_side: Side,
        price: f64,
        qty: f64,
    },
    Cancel {
        symbol: String,
        order_id: String,
    },
    Leverage {
        symbol: String,
        leverage: u32,
    },
}

#[derive(Default)]
pub struct MockExchange {
    pub tickers: RwLock<Vec<TickerSnapshot>>,
    pub klines: RwLock<HashMap<String, Vec<Kline>>>,
    pub depth: RwLock<HashMap<String, DepthSnapshot>>,
    pub positions: RwLock<Vec<ExchangePosition>>,
    pub orders: Mutex<Vec<RecordedOrder>>,
    /// Fill price reported for market orders.
    pub market_fill_price: RwLock<Option<f64>>,
    /// When set, market orders fail with this error.
    pub fail_market: RwLock<Option<ExchangeError>>,
    /// When set, stop orders fail with this error.
    pub fail_stop: RwLock<Option<ExchangeError>>,
    /// Remaining number of stop-order failures before succeeding.
    pub fail_stop_times: AtomicU64,
    next_order_id: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticker(symbol: &str, last_price: f64, change_pct: f64, quote_volume: f64) -> TickerSnapshot {
        TickerSnapshot {
            symbol: symbol.to_string(),
            last_price,
            price_change_pct: change_pct,
            quote_volume,
            tradable: true,
            observed_at: Utc::now(),
        }
    }

    pub fn position(symbol: &str, side: Side, qty: f64, entry: f64, mark: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            side,
            quantity: qty,
            entry_price: entry,
            mark_price: mark,
            leverage: 10,
            unrealized_pnl: side.direction() * (mark - entry) * qty,
        }
    }

    pub fn recorded(&self) -> Vec<RecordedOrder> {
        self.orders.lock().clone()
    }

    fn ack(&self, fill_price: Option<f64>, qty: f64) -> OrderAck {
        let id = self.next_order_id.fetch_add(1, Ordering::Relaxed) + 1;
        OrderAck {
            order_id: id.to_string(),
            client_order_id: format!("mock-{id}"),
            fill_price,
            filled_qty: qty,
        }
    }
}

#[async_trait]
impl ExchangePort for MockExchange {
    async fn list_ticker_snapshots(&self) -> Result<Vec<TickerSnapshot>, ExchangeError> {
        Ok(self.tickers.read().clone())
    }

    async fn get_klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let map = self.klines.read();
        let all = map.get(symbol).cloned().unwrap_or_default();
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    async fn get_depth(&self, symbol: &str) -> Result<DepthSnapshot, ExchangeError> {
        Ok(self
            .depth
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(DepthSnapshot {
                best_bid: 99.9,
                best_ask: 100.0,
                bid_qty: 50.0,
                ask_qty: 50.0,
            }))
    }

    async fn list_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        Ok(self.positions.read().clone())
    }

    async fn get_position(
        &self,
        symbol: &str,
    ) -> Result<Option<ExchangePosition>, ExchangeError> {
        Ok(self
            .positions
            .read()
            .iter()
            .find(|p| p.symbol == symbol)
            .cloned())
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        if let Some(err) = self.fail_market.read().clone() {
            return Err(err);
        }
        self.orders.lock().push(RecordedOrder::Market {
            symbol: symbol.to_string(),
            side,
            qty,
            reduce_only,
        });
        let fill = self.market_fill_price.read().unwrap_or(100.0);
        Ok(self.ack(Some(fill), qty))
    }

    async fn submit_stop_order(
        &self,
        symbol: &str,
        position_side: Side,
        stop_price: f64,
        qty: f64,
    ) -> Result<OrderAck, ExchangeError> {
        if let Some(err) = self.fail_stop.read().clone() {
            let remaining = self.fail_stop_times.load(Ordering::Relaxed);
            if remaining == u64::MAX {
                return Err(err);
            }
            if remaining > 0 {
                self.fail_stop_times.fetch_sub(1, Ordering::Relaxed);
                return Err(err);
            }
        }
        self.orders.lock().push(RecordedOrder::Stop {
            symbol: symbol.to_string(),
            position_side,
            stop_price,
            qty,
        });
        Ok(self.ack(None, 0.0))
    }

    async fn submit_take_profit_order(
        &self,
        symbol: &str,
        position_side: Side,
        price: f64,
        qty: f64,
    ) -> Result<OrderAck, ExchangeError> {
        self.orders.lock().push(RecordedOrder::TakeProfit {
            symbol: symbol.to_string(),
            position_side,
            price,
            qty,
        });
        Ok(self.ack(None, 0.0))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.orders.lock().push(RecordedOrder::Cancel {
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
        });
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        self.orders.lock().push(RecordedOrder::Leverage {
            symbol: symbol.to_string(),
            leverage,
        });
        Ok(())
    }
}
