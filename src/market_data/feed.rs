// =============================================================================
// MarketDataFeed — one WebSocket kline stream per (symbol, interval)
// =============================================================================
//
// Grounded on market_data/candle_buffer.rs::run_kline_stream for the
// connect/parse/reconnect shape, narrowed from a shared keyed buffer to one
// feed per StreamRunner, and on
// original_source/backend/trading/binance_connector.py (`WS_URL =
// "wss://stream.binancefuture.com/ws"`) / live_runner.py (mainnet
// `wss://fstream.binance.com/ws`) for the concrete futures stream host.
//
// Push interface: callers register bar-callbacks; the feed invokes them
// with a *closed* bar exactly once per close. `current_bar`/`get_bars`
// expose the in-progress bar and recent closed history directly.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::time::Duration;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::bar_window::Bar;

const DEFAULT_WS_URL: &str = "wss://stream.binancefuture.com/ws";
const IDLE_TIMEOUT_SECS: u64 = 30;
const HISTORY_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Closing => write!(f, "CLOSING"),
        }
    }
}

type BarCallback = Box<dyn Fn(&Bar) + Send + Sync>;

pub struct MarketDataFeed {
    symbol: String,
    interval: String,
    ws_url: String,
    state: RwLock<FeedState>,
    running: AtomicBool,
    last_message_time: RwLock<Option<DateTime<Utc>>>,
    current_bar: RwLock<Option<Bar>>,
    history: RwLock<std::collections::VecDeque<Bar>>,
    callbacks: RwLock<Vec<BarCallback>>,
    lag: AtomicU32,
}

impl MarketDataFeed {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            ws_url: DEFAULT_WS_URL.to_string(),
            state: RwLock::new(FeedState::Disconnected),
            running: AtomicBool::new(false),
            last_message_time: RwLock::new(None),
            current_bar: RwLock::new(None),
            history: RwLock::new(std::collections::VecDeque::with_capacity(HISTORY_CAPACITY)),
            callbacks: RwLock::new(Vec::new()),
            lag: AtomicU32::new(0),
        }
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into();
        self
    }

    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    pub fn connected(&self) -> bool {
        self.state() == FeedState::Connected
    }

    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        *self.last_message_time.read()
    }

    pub fn current_bar(&self) -> Option<Bar> {
        self.current_bar.read().clone()
    }

    pub fn get_bars(&self, n: usize) -> Vec<Bar> {
        let history = self.history.read();
        let start = history.len().saturating_sub(n);
        history.iter().skip(start).cloned().collect()
    }

    pub fn lag(&self) -> u32 {
        self.lag.load(Ordering::Relaxed)
    }

    /// Register a callback invoked once per closed bar. Not removable —
    /// runners register exactly one handler at construction time.
    pub fn on_bar(&self, callback: impl Fn(&Bar) + Send + Sync + 'static) {
        self.callbacks.write().push(Box::new(callback));
    }

    /// Drive the connect/read/reconnect loop until `stop()` is called.
    /// Runs forever (or until cancelled) — intended to be spawned as its
    /// own task by the owning StreamRunner.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut attempt: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            *self.state.write() = FeedState::Connecting;
            match self.connect_and_read().await {
                Ok(()) => {
                    attempt = 0;
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, interval = %self.interval, error = %e, "kline stream error");
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            *self.state.write() = FeedState::Disconnected;
            attempt += 1;
            let backoff = (5 * attempt).min(60);
            info!(symbol = %self.symbol, interval = %self.interval, backoff, "reconnecting kline stream");
            tokio::time::sleep(Duration::from_secs(backoff as u64)).await;
        }

        *self.state.write() = FeedState::Closing;
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn connect_and_read(&self) -> Result<()> {
        let lower = self.symbol.to_lowercase();
        let url = format!("{}/{lower}@kline_{}", self.ws_url, self.interval);
        info!(url = %url, "connecting to kline WebSocket");

        let (ws_stream, _response) = connect_async(&url).await.context("failed to connect to kline WebSocket")?;
        *self.state.write() = FeedState::Connected;
        info!(symbol = %self.symbol, interval = %self.interval, "kline WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            let next = tokio::time::timeout(Duration::from_secs(IDLE_TIMEOUT_SECS), read.next()).await;
            let frame = match next {
                Ok(frame) => frame,
                Err(_) => {
                    warn!(symbol = %self.symbol, interval = %self.interval, "kline stream idle timeout");
                    return Ok(());
                }
            };

            match frame {
                Some(Ok(msg)) => {
                    *self.last_message_time.write() = Some(Utc::now());
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_kline_bar(&text) {
                            Ok(bar) => self.handle_bar(bar),
                            Err(e) => warn!(error = %e, "failed to parse kline message"),
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "kline WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol = %self.symbol, interval = %self.interval, "kline WebSocket stream ended");
                    return Ok(());
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    fn handle_bar(&self, bar: Bar) {
        if bar.is_closed {
            *self.current_bar.write() = None;
            {
                let mut history = self.history.write();
                history.push_back(bar.clone());
                while history.len() > HISTORY_CAPACITY {
                    history.pop_front();
                }
            }
            let callbacks = self.callbacks.read();
            for cb in callbacks.iter() {
                cb(&bar);
            }
        } else {
            *self.current_bar.write() = Some(bar);
        }
    }
}

/// Parse a single-stream kline message into a `Bar`, deriving
/// `buy_volume`/`sell_volume` from Binance's taker-buy-volume field
/// (`buy = taker_buy_volume`, `sell = volume - taker_buy_volume`).
fn parse_kline_bar(text: &str) -> Result<Bar> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse kline JSON")?;
    let k = &root["k"];

    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let open = parse_f64(&k["o"], "k.o")?;
    let high = parse_f64(&k["h"], "k.h")?;
    let low = parse_f64(&k["l"], "k.l")?;
    let close = parse_f64(&k["c"], "k.c")?;
    let volume = parse_f64(&k["v"], "k.v")?;
    let taker_buy_volume = parse_f64(&k["V"], "k.V")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(Bar {
        timestamp: DateTime::from_timestamp_millis(open_time).unwrap_or_else(Utc::now),
        open,
        high,
        low,
        close,
        volume,
        buy_volume: Some(taker_buy_volume),
        sell_volume: Some(volume - taker_buy_volume),
        is_closed,
    })
}

fn parse_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n.as_f64().with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn parse_kline_bar_splits_taker_buy_volume() {
        let json = r#"{
            "e": "kline",
            "s": "BTCUSDT",
            "k": {
                "t": 1700000000000,
                "o": "37000.00",
                "h": "37050.00",
                "l": "36990.00",
                "c": "37020.00",
                "v": "100.0",
                "V": "60.0",
                "x": true
            }
        }"#;
        let bar = parse_kline_bar(json).unwrap();
        assert!((bar.close - 37020.0).abs() < f64::EPSILON);
        assert_eq!(bar.buy_volume, Some(60.0));
        assert_eq!(bar.sell_volume, Some(40.0));
        assert!(bar.is_closed);
    }

    #[test]
    fn handle_bar_invokes_callback_only_on_close() {
        let feed = MarketDataFeed::new("BTCUSDT", "1m");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        feed.on_bar(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let open_bar = Bar {
            timestamp: Utc::now(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            buy_volume: Some(0.5),
            sell_volume: Some(0.5),
            is_closed: false,
        };
        feed.handle_bar(open_bar.clone());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(feed.current_bar().is_some());

        let mut closed_bar = open_bar;
        closed_bar.is_closed = true;
        feed.handle_bar(closed_bar);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(feed.current_bar().is_none());
        assert_eq!(feed.get_bars(10).len(), 1);
    }

    #[test]
    fn new_feed_starts_disconnected() {
        let feed = MarketDataFeed::new("ETHUSDT", "5m");
        assert_eq!(feed.state(), FeedState::Disconnected);
        assert!(!feed.connected());
    }
}
