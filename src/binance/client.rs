// =============================================================================
// Binance USD-M Futures Client — HMAC-SHA256 signed REST requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
//
// Grounded on original_source/backend/trading/binance_connector.py, ported to
// the teacher's signed-query + #[instrument] idiom (src/binance/client.rs).
// Targets the Futures Testnet by default — matching the original's safety
// posture — with `with_base_url` to switch to mainnet.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio::time::{sleep, Duration};
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::types::{Direction, Side};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;
const DEFAULT_BASE_URL: &str = "https://testnet.binancefuture.com";
const EXECUTION_PRICE_RETRIES: u32 = 3;

fn opposite_side(side: Side) -> Side {
    match side {
        Side::Buy => Side::Sell,
        Side::Sell => Side::Buy,
    }
}

/// Exchange-reported precision/step constraints for a single symbol, cached
/// after the first `exchangeInfo` lookup.
#[derive(Debug, Clone, Copy)]
pub struct SymbolInfo {
    pub qty_precision: u32,
    pub min_qty: f64,
    pub step_size: f64,
    pub price_precision: u32,
    pub tick_size: f64,
}

/// A currently open futures position as reported by the exchange.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub side: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub unrealized_pnl: f64,
}

/// Outcome of an order-placing operation (open/close). Never throws across
/// component boundaries: transport errors and non-2xx responses collapse
/// into `success: false` with a human-readable `message`.
#[derive(Debug, Clone)]
pub struct TradeResult {
    pub success: bool,
    pub price: f64,
    pub order_id: String,
    pub message: Option<String>,
}

impl TradeResult {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            price: 0.0,
            order_id: String::new(),
            message: Some(message.into()),
        }
    }
}

/// Binance USD-M Futures REST client with HMAC-SHA256 request signing.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: Arc<RateLimitTracker>,
    symbol_info_cache: RwLock<std::collections::HashMap<String, SymbolInfo>>,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = DEFAULT_BASE_URL, "BinanceClient initialised");

        Self {
            api_key,
            secret,
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
            rate_limiter: Arc::new(RateLimitTracker::new()),
            symbol_info_cache: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn rate_limiter(&self) -> Arc<RateLimitTracker> {
        self.rate_limiter.clone()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

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

    async fn get_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{path}?{qs}", self.base_url);
        let resp = self.client.get(&url).send().await.context("GET request failed")?;
        self.finish(resp).await
    }

    async fn post_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{path}?{qs}", self.base_url);
        let resp = self.client.post(&url).send().await.context("POST request failed")?;
        self.finish(resp).await
    }

    async fn delete_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{path}?{qs}", self.base_url);
        let resp = self.client.delete(&url).send().await.context("DELETE request failed")?;
        self.finish(resp).await
    }

    async fn finish(&self, resp: reqwest::Response) -> Result<serde_json::Value> {
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("Binance returned {}: {}", status, body);
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Account / balance / price
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "binance::get_account")]
    pub async fn get_account(&self) -> Result<serde_json::Value> {
        self.get_signed("/fapi/v2/account", "").await
    }

    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self) -> Result<f64> {
        let account = self.get_account().await?;
        let balance = account["totalWalletBalance"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        debug!(balance, "futures wallet balance retrieved");
        Ok(balance)
    }

    #[instrument(skip(self), name = "binance::get_price")]
    pub async fn get_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={symbol}", self.base_url);
        let resp = self.client.get(&url).send().await.context("GET ticker/price failed")?;
        let body = self.finish(resp).await?;
        body["price"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .context("ticker response missing 'price'")
    }

    #[instrument(skip(self), name = "binance::get_position")]
    pub async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let account = self.get_account().await?;
        let positions = account["positions"].as_array().context("account response missing 'positions'")?;

        for p in positions {
            if p["symbol"].as_str() != Some(symbol) {
                continue;
            }
            let amt: f64 = p["positionAmt"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            if amt.abs() < 1e-12 {
                continue;
            }
            let entry_price: f64 = p["entryPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            let unrealized_pnl: f64 = p["unrealizedProfit"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
            return Ok(Some(Position {
                symbol: symbol.to_string(),
                side: if amt > 0.0 { Direction::Long } else { Direction::Short },
                entry_price,
                quantity: amt.abs(),
                unrealized_pnl,
            }));
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Symbol info / precision
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "binance::get_symbol_info")]
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        if let Some(info) = self.symbol_info_cache.read().get(symbol).copied() {
            return Ok(info);
        }

        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await.context("GET exchangeInfo failed")?;
        let body = self.finish(resp).await?;

        let entry = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .with_context(|| format!("symbol {symbol} not found in exchangeInfo"))?;

        let filters = entry["filters"].as_array().context("symbol entry missing 'filters'")?;

        let mut step_size = 0.001;
        let mut min_qty = 0.001;
        let mut tick_size = 0.01;
        for f in filters {
            match f["filterType"].as_str() {
                Some("LOT_SIZE") => {
                    step_size = f["stepSize"].as_str().and_then(|s| s.parse().ok()).unwrap_or(step_size);
                    min_qty = f["minQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(min_qty);
                }
                Some("PRICE_FILTER") => {
                    tick_size = f["tickSize"].as_str().and_then(|s| s.parse().ok()).unwrap_or(tick_size);
                }
                _ => {}
            }
        }

        let info = SymbolInfo {
            qty_precision: decimals(step_size),
            min_qty,
            step_size,
            price_precision: decimals(tick_size),
            tick_size,
        };
        self.symbol_info_cache.write().insert(symbol.to_string(), info);
        Ok(info)
    }

    pub async fn round_quantity(&self, symbol: &str, qty: f64) -> Result<f64> {
        let info = self.get_symbol_info(symbol).await?;
        Ok(round_to_step(qty, info.step_size, info.qty_precision))
    }

    pub async fn round_price(&self, symbol: &str, price: f64) -> Result<f64> {
        let info = self.get_symbol_info(symbol).await?;
        Ok(round_to_step(price, info.tick_size, info.price_precision))
    }

    // -------------------------------------------------------------------------
    // Leverage / orders
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "binance::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.post_signed("/fapi/v1/leverage", &params).await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}");
        self.delete_signed("/fapi/v1/allOpenOrders", &params).await?;
        debug!(symbol, "all open orders cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "binance::get_open_orders")]
    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<serde_json::Value>> {
        let params = format!("symbol={symbol}");
        let body = self.get_signed("/fapi/v1/openOrders", &params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<serde_json::Value> {
        let mut params = format!("symbol={symbol}&side={side}&type=MARKET&quantity={quantity}");
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }
        self.rate_limiter.record_order_sent();
        self.post_signed("/fapi/v1/order", &params).await
    }

    async fn place_protective_order(
        &self,
        symbol: &str,
        side: Side,
        order_type: &str,
        stop_price: f64,
    ) -> Result<()> {
        let params =
            format!("symbol={symbol}&side={side}&type={order_type}&stopPrice={stop_price}&closePosition=true");
        self.rate_limiter.record_order_sent();
        self.post_signed("/fapi/v1/order", &params).await?;
        Ok(())
    }

    /// Resolve the actual fill price for a just-placed order with a four-step
    /// fallback ladder: response avg → fills VWAP → order-status retry → the
    /// caller-supplied last-resort (position entry, then current ticker).
    async fn resolve_execution_price(&self, symbol: &str, order: &serde_json::Value) -> f64 {
        if let Some(avg) = order["avgPrice"].as_str().and_then(|s| s.parse::<f64>().ok()) {
            if avg > 0.0 {
                return avg;
            }
        }

        if let Some(fills) = order["fills"].as_array() {
            let (mut notional, mut qty) = (0.0, 0.0);
            for f in fills {
                let p: f64 = f["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let q: f64 = f["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                notional += p * q;
                qty += q;
            }
            if qty > 0.0 {
                return notional / qty;
            }
        }

        if let Some(order_id) = order["orderId"].as_u64() {
            for attempt in 1..=EXECUTION_PRICE_RETRIES {
                sleep(Duration::from_millis((500 * attempt) as u64)).await;
                let params = format!("symbol={symbol}&orderId={order_id}");
                if let Ok(status) = self.get_signed("/fapi/v1/order", &params).await {
                    if let Some(avg) = status["avgPrice"].as_str().and_then(|s| s.parse::<f64>().ok()) {
                        if avg > 0.0 {
                            return avg;
                        }
                    }
                }
            }
        }

        if let Ok(Some(pos)) = self.get_position(symbol).await {
            if pos.entry_price > 0.0 {
                return pos.entry_price;
            }
        }

        self.get_price(symbol).await.unwrap_or(0.0)
    }

    // -------------------------------------------------------------------------
    // Position open / close
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "binance::open_long")]
    pub async fn open_long(
        &self,
        symbol: &str,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradeResult {
        self.open_position(symbol, Side::Buy, quantity, stop_loss, take_profit).await
    }

    #[instrument(skip(self), name = "binance::open_short")]
    pub async fn open_short(
        &self,
        symbol: &str,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradeResult {
        self.open_position(symbol, Side::Sell, quantity, stop_loss, take_profit).await
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> TradeResult {
        let order = match self.place_market_order(symbol, side, quantity, false).await {
            Ok(o) => o,
            Err(e) => {
                warn!(symbol, error = %e, "open position order failed");
                return TradeResult::failure(format!("order placement failed: {e}"));
            }
        };

        let price = self.resolve_execution_price(symbol, &order).await;
        let order_id = order["orderId"].as_u64().unwrap_or(0).to_string();

        let opposite = opposite_side(side);
        if let Some(sl) = stop_loss {
            if let Err(e) = self.place_protective_order(symbol, opposite, "STOP_MARKET", sl).await {
                warn!(symbol, error = %e, "stop-loss placement failed (best-effort)");
            }
        }
        if let Some(tp) = take_profit {
            if let Err(e) = self.place_protective_order(symbol, opposite, "TAKE_PROFIT_MARKET", tp).await {
                warn!(symbol, error = %e, "take-profit placement failed (best-effort)");
            }
        }

        debug!(symbol, side = %side, price, order_id, "position opened");
        TradeResult { success: true, price, order_id, message: None }
    }

    #[instrument(skip(self), name = "binance::close_position")]
    pub async fn close_position(&self, symbol: &str) -> TradeResult {
        let position = match self.get_position(symbol).await {
            Ok(Some(p)) => p,
            Ok(None) => return TradeResult::failure("no open position to close"),
            Err(e) => return TradeResult::failure(format!("failed to fetch position: {e}")),
        };

        let close_side = position.side.closing_side();
        let order = match self.place_market_order(symbol, close_side, position.quantity, true).await {
            Ok(o) => o,
            Err(e) => {
                warn!(symbol, error = %e, "close position order failed");
                return TradeResult::failure(format!("order placement failed: {e}"));
            }
        };

        let price = self.resolve_execution_price(symbol, &order).await;
        let order_id = order["orderId"].as_u64().unwrap_or(0).to_string();

        if let Err(e) = self.cancel_all_orders(symbol).await {
            warn!(symbol, error = %e, "failed to cancel remaining orders after close");
        }

        debug!(symbol, price, order_id, "position closed");
        TradeResult { success: true, price, order_id, message: None }
    }
}

fn decimals(step: f64) -> u32 {
    if step <= 0.0 {
        return 0;
    }
    let s = format!("{step}");
    s.split('.').nth(1).map(|frac| frac.trim_end_matches('0').len() as u32).unwrap_or(0)
}

fn round_to_step(value: f64, step: f64, precision: u32) -> f64 {
    if step <= 0.0 {
        return value;
    }
    let stepped = (value / step).round() * step;
    let factor = 10f64.powi(precision as i32);
    (stepped * factor).round() / factor
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_step_rounds_to_nearest_then_rounds_precision() {
        assert!((round_to_step(1.23456, 0.001, 3) - 1.235).abs() < 1e-9);
        assert!((round_to_step(0.0009, 0.001, 3) - 0.001).abs() < 1e-9);
    }

    #[test]
    fn decimals_counts_fractional_digits() {
        assert_eq!(decimals(0.001), 3);
        assert_eq!(decimals(1.0), 0);
        assert_eq!(decimals(0.1), 1);
    }

    #[test]
    fn direction_opening_and_closing_sides_are_mirrored() {
        assert_eq!(Direction::Long.opening_side(), Side::Buy);
        assert_eq!(Direction::Long.closing_side(), Side::Sell);
        assert_eq!(opposite_side(Side::Buy), Side::Sell);
    }
}
