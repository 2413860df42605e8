pub mod client;
pub mod rate_limit;

pub use client::{BinanceClient, Position, SymbolInfo, TradeResult};
pub use rate_limit::RateLimitTracker;
