// =============================================================================
// Binance USDⓈ-M Futures adapter — HMAC-SHA256 signed REST implementation
// of the Exchange Port
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized.  All signed
// requests carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to
// tolerate minor clock drift between the bot and the venue.
//
// Deadlines: read endpoints 2 s, order endpoints 5 s, applied per request.
// Order submission always carries a client-generated id so that a retry after
// a timeout cannot double-fill.
// =============================================================================

use std::collections::HashSet;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::exchange::{
    DepthSnapshot, ExchangeError, ExchangePort, ExchangePosition, Kline, OrderAck,
    TickerSnapshot,
};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Deadline for read endpoints.
const READ_DEADLINE: Duration = Duration::from_secs(2);
/// Deadline for order endpoints.
const ORDER_DEADLINE: Duration = Duration::from_secs(5);

/// How long the cached tradable-universe set stays fresh.
const INSTRUMENT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Binance futures REST client implementing [`ExchangePort`].
pub struct BinanceFutures {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// Perpetual symbols with status TRADING, refreshed lazily.
    instruments: RwLock<Option<(HashSet<String>, Instant)>>,
}

impl BinanceFutures {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key` — API key (sent as a header, never in query params).
    /// * `secret`  — secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        debug!("BinanceFutures initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            instruments: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Full query string for a signed request (appends timestamp, recvWindow,
    /// and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send a request and decode the body, mapping transport and venue
    /// failures into `ExchangeError`.
    async fn execute(
        &self,
        req: reqwest::RequestBuilder,
        deadline: Duration,
    ) -> Result<serde_json::Value, ExchangeError> {
        let resp = req.timeout(deadline).send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout
            } else {
                ExchangeError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("body decode: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(ExchangeError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ExchangeError::Unavailable(format!("HTTP {status}")));
        }

        let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
        let msg = body
            .get("msg")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown venue error");
        Err(ExchangeError::classify(code, msg))
    }

    async fn get_json(
        &self,
        path_and_query: &str,
        deadline: Duration,
    ) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        self.execute(self.client.get(&url), deadline).await
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    // -------------------------------------------------------------------------
    // Instrument cache
    // -------------------------------------------------------------------------

    /// The set of perpetual symbols with status TRADING, cached for an hour.
    async fn tradable_universe(&self) -> Result<HashSet<String>, ExchangeError> {
        if let Some((set, at)) = self.instruments.read().as_ref() {
            if at.elapsed() < INSTRUMENT_CACHE_TTL {
                return Ok(set.clone());
            }
        }

        let body = self
            .get_json("/fapi/v1/exchangeInfo", READ_DEADLINE)
            .await?;

        let set: HashSet<String> = body["symbols"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|s| {
                        s["contractType"].as_str() == Some("PERPETUAL")
                            && s["status"].as_str() == Some("TRADING")
                    })
                    .filter_map(|s| s["symbol"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        debug!(count = set.len(), "tradable universe refreshed");
        *self.instruments.write() = Some((set.clone(), Instant::now()));
        Ok(set)
    }

    /// Parse one positionRisk entry into an `ExchangePosition`, skipping flat
    /// entries.
    fn parse_position(entry: &serde_json::Value) -> Option<ExchangePosition> {
        let amt = Self::parse_f64(&entry["positionAmt"]);
        if amt == 0.0 {
            return None;
        }
        let symbol = entry["symbol"].as_str()?.to_string();
        Some(ExchangePosition {
            symbol,
            side: if amt > 0.0 { Side::Long } else { Side::Short },
            quantity: amt.abs(),
            entry_price: Self::parse_f64(&entry["entryPrice"]),
            mark_price: Self::parse_f64(&entry["markPrice"]),
            leverage: Self::parse_f64(&entry["leverage"]) as u32,
            unrealized_pnl: Self::parse_f64(&entry["unRealizedProfit"]),
        })
    }
}

#[async_trait]
impl ExchangePort for BinanceFutures {
    #[instrument(skip(self), name = "binance::tickers")]
    async fn list_ticker_snapshots(&self) -> Result<Vec<TickerSnapshot>, ExchangeError> {
        let universe = self.tradable_universe().await?;
        let body = self.get_json("/fapi/v1/ticker/24hr", READ_DEADLINE).await?;
        let now = Utc::now();

        let snapshots = body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| {
                        let symbol = t["symbol"].as_str()?.to_string();
                        Some(TickerSnapshot {
                            tradable: universe.contains(&symbol),
                            symbol,
                            last_price: Self::parse_f64(&t["lastPrice"]),
                            price_change_pct: Self::parse_f64(&t["priceChangePercent"]),
                            quote_volume: Self::parse_f64(&t["quoteVolume"]),
                            observed_at: now,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        debug!(count = snapshots.len(), "ticker snapshots fetched");
        Ok(snapshots)
    }

    #[instrument(skip(self), name = "binance::klines")]
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let body = self
            .get_json(
                &format!("/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}"),
                READ_DEADLINE,
            )
            .await?;

        let raw = body.as_array().cloned().unwrap_or_default();
        let mut klines = Vec::with_capacity(raw.len());

        // Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
        // [5] volume, [6] closeTime, [7] quoteAssetVolume.
        for entry in &raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 8 => a,
                _ => {
                    warn!(symbol, "skipping malformed kline entry");
                    continue;
                }
            };
            klines.push(Kline {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_f64(&arr[1]),
                high: Self::parse_f64(&arr[2]),
                low: Self::parse_f64(&arr[3]),
                close: Self::parse_f64(&arr[4]),
                volume: Self::parse_f64(&arr[5]),
                close_time: arr[6].as_i64().unwrap_or(0),
                quote_volume: Self::parse_f64(&arr[7]),
            });
        }

        Ok(klines)
    }

    #[instrument(skip(self), name = "binance::depth")]
    async fn get_depth(&self, symbol: &str) -> Result<DepthSnapshot, ExchangeError> {
        let body = self
            .get_json(&format!("/fapi/v1/depth?symbol={symbol}&limit=5"), READ_DEADLINE)
            .await?;

        let top = |side: &str, idx: usize| {
            body[side]
                .as_array()
                .and_then(|lvls| lvls.first())
                .and_then(|lvl| lvl.as_array())
                .and_then(|lvl| lvl.get(idx))
                .map(Self::parse_f64)
                .unwrap_or(0.0)
        };

        Ok(DepthSnapshot {
            best_bid: top("bids", 0),
            bid_qty: top("bids", 1),
            best_ask: top("asks", 0),
            ask_qty: top("asks", 1),
        })
    }

    #[instrument(skip(self), name = "binance::positions")]
    async fn list_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let qs = self.signed_query("");
        let body = self
            .get_json(&format!("/fapi/v2/positionRisk?{qs}"), READ_DEADLINE)
            .await?;

        let positions = body
            .as_array()
            .map(|arr| arr.iter().filter_map(Self::parse_position).collect::<Vec<_>>())
            .unwrap_or_default();

        debug!(count = positions.len(), "live positions fetched");
        Ok(positions)
    }

    #[instrument(skip(self), name = "binance::position")]
    async fn get_position(
        &self,
        symbol: &str,
    ) -> Result<Option<ExchangePosition>, ExchangeError> {
        let qs = self.signed_query(&format!("symbol={symbol}"));
        let body = self
            .get_json(&format!("/fapi/v2/positionRisk?{qs}"), READ_DEADLINE)
            .await?;

        Ok(body
            .as_array()
            .and_then(|arr| arr.iter().find_map(Self::parse_position)))
    }

    #[instrument(skip(self), name = "binance::market_order")]
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let client_order_id = Uuid::new_v4().to_string();
        let order_side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let params = format!(
            "symbol={symbol}&side={order_side}&type=MARKET&quantity={qty}\
             &reduceOnly={reduce_only}&newClientOrderId={client_order_id}&newOrderRespType=RESULT"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side = %side, qty, reduce_only, "submitting market order");
        let body = self.execute(self.client.post(&url), ORDER_DEADLINE).await?;

        let fill = Self::parse_f64(&body["avgPrice"]);
        Ok(OrderAck {
            order_id: body["orderId"]
                .as_i64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            client_order_id,
            fill_price: if fill > 0.0 { Some(fill) } else { None },
            filled_qty: Self::parse_f64(&body["executedQty"]),
        })
    }

    #[instrument(skip(self), name = "binance::stop_order")]
    async fn submit_stop_order(
        &self,
        symbol: &str,
        position_side: Side,
        stop_price: f64,
        qty: f64,
    ) -> Result<OrderAck, ExchangeError> {
        let client_order_id = Uuid::new_v4().to_string();
        let order_side = match position_side.closing() {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let params = format!(
            "symbol={symbol}&side={order_side}&type=STOP_MARKET&stopPrice={stop_price}\
             &quantity={qty}&reduceOnly=true&newClientOrderId={client_order_id}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, position_side = %position_side, stop_price, qty, "submitting stop order");
        let body = self.execute(self.client.post(&url), ORDER_DEADLINE).await?;

        Ok(OrderAck {
            order_id: body["orderId"]
                .as_i64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            client_order_id,
            fill_price: None,
            filled_qty: 0.0,
        })
    }

    #[instrument(skip(self), name = "binance::take_profit_order")]
    async fn submit_take_profit_order(
        &self,
        symbol: &str,
        position_side: Side,
        price: f64,
        qty: f64,
    ) -> Result<OrderAck, ExchangeError> {
        let client_order_id = Uuid::new_v4().to_string();
        let order_side = match position_side.closing() {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let params = format!(
            "symbol={symbol}&side={order_side}&type=TAKE_PROFIT_MARKET&stopPrice={price}\
             &quantity={qty}&reduceOnly=true&newClientOrderId={client_order_id}"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, position_side = %position_side, price, qty, "submitting take-profit order");
        let body = self.execute(self.client.post(&url), ORDER_DEADLINE).await?;

        Ok(OrderAck {
            order_id: body["orderId"]
                .as_i64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            client_order_id,
            fill_price: None,
            filled_qty: 0.0,
        })
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let qs = self.signed_query(&format!("symbol={symbol}&orderId={order_id}"));
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, order_id, "cancelling order");
        self.execute(self.client.delete(&url), ORDER_DEADLINE)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), name = "binance::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let qs = self.signed_query(&format!("symbol={symbol}&leverage={leverage}"));
        let url = format!("{}/fapi/v1/leverage?{}", self.base_url, qs);

        debug!(symbol, leverage, "setting leverage");
        self.execute(self.client.post(&url), ORDER_DEADLINE)
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for BinanceFutures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFutures")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceFutures::new("key", "secret");
        let sig1 = client.sign("symbol=BTCUSDT&side=BUY");
        let sig2 = client.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signed_query_carries_signature_and_window() {
        let client = BinanceFutures::new("key", "secret");
        let qs = client.signed_query("symbol=BTCUSDT");
        assert!(qs.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(qs.contains("recvWindow=5000"));
        assert!(qs.contains("&signature="));
    }

    #[test]
    fn parse_position_skips_flat_entries() {
        let flat = serde_json::json!({
            "symbol": "BTCUSDT", "positionAmt": "0", "entryPrice": "0",
            "markPrice": "0", "leverage": "20", "unRealizedProfit": "0"
        });
        assert!(BinanceFutures::parse_position(&flat).is_none());

        let short = serde_json::json!({
            "symbol": "ETHUSDT", "positionAmt": "-1.5", "entryPrice": "2000",
            "markPrice": "1990", "leverage": "10", "unRealizedProfit": "15.0"
        });
        let pos = BinanceFutures::parse_position(&short).unwrap();
        assert_eq!(pos.side, Side::Short);
        assert!((pos.quantity - 1.5).abs() < 1e-9);
        assert_eq!(pos.leverage, 10);
    }

    #[test]
    fn parse_f64_accepts_string_and_number() {
        assert!((BinanceFutures::parse_f64(&serde_json::json!("1.25")) - 1.25).abs() < 1e-9);
        assert!((BinanceFutures::parse_f64(&serde_json::json!(1.25)) - 1.25).abs() < 1e-9);
        assert_eq!(BinanceFutures::parse_f64(&serde_json::json!(null)), 0.0);
    }
}
