//! Binance spot REST client.

use super::{ExchangeClient, Ohlcv, OrderBook, PriceLevel, Ticker, Timeframe};
use crate::error::ExchangeError;
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    status: String,
    base_asset: String,
    quote_asset: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: String,
    close_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Depth {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

impl BinanceClient {
    pub fn new(base_url: &str) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("market-relay/0.1")
            .build()
            .map_err(|e| ExchangeError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `BTC/USDT` -> `BTCUSDT`
    pub fn market_id(symbol: &str) -> String {
        symbol.replace('/', "").to_ascii_uppercase()
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, query);

        let response = self.client.get(&url).query(query).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Unavailable(format!(
                "Binance API error {} on {}: {}",
                status, path, text
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("Failed to parse {} response: {}", path, e)))
    }
}

fn parse_f64(raw: &str, field: &str) -> Result<f64, ExchangeError> {
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::Unavailable(format!("non-numeric {}: {:?}", field, raw)))
}

fn value_f64(value: &Value, field: &str) -> Result<f64, ExchangeError> {
    match value {
        Value::String(s) => parse_f64(s, field),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExchangeError::Unavailable(format!("non-numeric {}", field))),
        _ => Err(ExchangeError::Unavailable(format!("unexpected {} value: {}", field, value))),
    }
}

/// Binance klines are `[openTime, open, high, low, close, volume, closeTime, ...]`.
fn parse_kline(row: &[Value]) -> Result<Ohlcv, ExchangeError> {
    if row.len() < 6 {
        return Err(ExchangeError::Unavailable(format!(
            "kline row has {} fields, expected at least 6",
            row.len()
        )));
    }
    let timestamp = row[0]
        .as_i64()
        .ok_or_else(|| ExchangeError::Unavailable("kline open time is not an integer".to_string()))?;
    Ok(Ohlcv {
        timestamp,
        open: value_f64(&row[1], "open")?,
        high: value_f64(&row[2], "high")?,
        low: value_f64(&row[3], "low")?,
        close: value_f64(&row[4], "close")?,
        volume: value_f64(&row[5], "volume")?,
    })
}

fn parse_levels(levels: &[(String, String)]) -> Result<Vec<PriceLevel>, ExchangeError> {
    levels
        .iter()
        .map(|(price, amount)| Ok(PriceLevel(parse_f64(price, "price")?, parse_f64(amount, "amount")?)))
        .collect()
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn load_markets(&self) -> Result<BTreeSet<String>, ExchangeError> {
        let info: ExchangeInfo = self.get_json("/api/v3/exchangeInfo", &[]).await?;
        Ok(info
            .symbols
            .into_iter()
            .filter(|s| s.status == "TRADING")
            .map(|s| format!("{}/{}", s.base_asset, s.quote_asset))
            .collect())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let raw: Ticker24h = self
            .get_json("/api/v3/ticker/24hr", &[("symbol", Self::market_id(symbol))])
            .await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            price: parse_f64(&raw.last_price, "lastPrice")?,
            timestamp: raw.close_time.unwrap_or(0),
        })
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Ohlcv>, ExchangeError> {
        let mut query = vec![
            ("symbol", Self::market_id(symbol)),
            ("interval", timeframe.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(since) = since {
            query.push(("startTime", since.to_string()));
        }
        let rows: Vec<Vec<Value>> = self.get_json("/api/v3/klines", &query).await?;
        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn fetch_order_book(&self, symbol: &str, limit: u32) -> Result<OrderBook, ExchangeError> {
        let depth: Depth = self
            .get_json(
                "/api/v3/depth",
                &[("symbol", Self::market_id(symbol)), ("limit", limit.to_string())],
            )
            .await?;
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: parse_levels(&depth.bids)?,
            asks: parse_levels(&depth.asks)?,
            timestamp: None,
        })
    }
}
