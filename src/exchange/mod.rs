//! Upstream market data: domain types, the exchange client seam and the
//! caching service built on top of it.

pub mod binance;
pub mod service;
pub mod tools;

pub use binance::BinanceClient;
pub use service::MarketDataService;
pub use tools::register_market_tools;

use crate::error::ExchangeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    /// Milliseconds since the Unix epoch, 0 if the exchange did not say.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// `[price, amount]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel(pub f64, pub f64);

impl PriceLevel {
    pub fn price(&self) -> f64 {
        self.0
    }

    pub fn amount(&self) -> f64 {
        self.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[default]
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::OneMinute,
        Timeframe::FiveMinutes,
        Timeframe::FifteenMinutes,
        Timeframe::OneHour,
        Timeframe::FourHours,
        Timeframe::OneDay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| ExchangeError::UnsupportedTimeframe(s.to_string()))
    }
}

/// Outbound calls to an exchange. Implementations map every upstream
/// failure to `ExchangeError::Unavailable`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    /// Tradable symbols in `BASE/QUOTE` form.
    async fn load_markets(&self) -> Result<BTreeSet<String>, ExchangeError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Ohlcv>, ExchangeError>;

    async fn fetch_order_book(&self, symbol: &str, limit: u32) -> Result<OrderBook, ExchangeError>;
}
