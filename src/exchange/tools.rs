//! Market data tools served by a [`WorkerLoop`].

use super::{MarketDataService, Timeframe};
use crate::error::{ToolError, ToolResult};
use crate::pubsub::{ToolHandler, WorkerLoop};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketTool {
    GetTicker,
    GetOhlcv,
    GetOrderBook,
    /// Single ticker snapshot; clients poll it to stream.
    StreamTicker,
}

impl MarketTool {
    pub const ALL: [MarketTool; 4] = [
        MarketTool::GetTicker,
        MarketTool::GetOhlcv,
        MarketTool::GetOrderBook,
        MarketTool::StreamTicker,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MarketTool::GetTicker => "get_ticker",
            MarketTool::GetOhlcv => "get_ohlcv",
            MarketTool::GetOrderBook => "get_order_book",
            MarketTool::StreamTicker => "stream_ticker",
        }
    }
}

#[derive(Debug, Deserialize)]
struct TickerArgs {
    symbol: String,
    // Accepted for compatibility with polling clients, unused.
    #[serde(default)]
    #[allow(dead_code)]
    interval_seconds: Option<f64>,
}

fn default_ohlcv_limit() -> u32 {
    100
}

fn default_book_limit() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
struct OhlcvArgs {
    symbol: String,
    #[serde(default)]
    timeframe: Timeframe,
    #[serde(default = "default_ohlcv_limit")]
    limit: u32,
    #[serde(default)]
    since: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OrderBookArgs {
    symbol: String,
    #[serde(default = "default_book_limit")]
    limit: u32,
}

fn parse_args<T: DeserializeOwned>(tool: MarketTool, arguments: Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|e| ToolError::Fatal(format!("Invalid arguments for {}: {}", tool.name(), e)))
}

fn to_result<T: Serialize>(value: &T) -> ToolResult {
    serde_json::to_value(value).map_err(|e| ToolError::Fatal(format!("Could not encode result: {}", e)))
}

struct MarketToolHandler {
    tool: MarketTool,
    service: MarketDataService,
}

#[async_trait]
impl ToolHandler for MarketToolHandler {
    async fn call(&self, arguments: Map<String, Value>) -> ToolResult {
        match self.tool {
            MarketTool::GetTicker | MarketTool::StreamTicker => {
                let args: TickerArgs = parse_args(self.tool, arguments)?;
                to_result(&self.service.get_ticker(&args.symbol).await?)
            }
            MarketTool::GetOhlcv => {
                let args: OhlcvArgs = parse_args(self.tool, arguments)?;
                let candles = self
                    .service
                    .get_ohlcv(&args.symbol, args.timeframe, args.limit, args.since)
                    .await?;
                to_result(&candles)
            }
            MarketTool::GetOrderBook => {
                let args: OrderBookArgs = parse_args(self.tool, arguments)?;
                to_result(&self.service.get_order_book(&args.symbol, args.limit).await?)
            }
        }
    }
}

/// Registers every [`MarketTool`] on `worker`, all backed by `service`.
pub fn register_market_tools(worker: &mut WorkerLoop, service: MarketDataService) {
    for tool in MarketTool::ALL {
        worker.register_handler(
            tool.name(),
            Arc::new(MarketToolHandler {
                tool,
                service: service.clone(),
            }),
        );
    }
}
