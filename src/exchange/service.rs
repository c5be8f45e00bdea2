use super::{ExchangeClient, Ohlcv, OrderBook, Ticker, Timeframe};
use crate::cache::{cache_key, MarketCache};
use crate::error::ExchangeError;
use log::debug;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const MARKETS_CACHE_KEY: &str = "markets";

/// Read-through cache in front of an exchange, with symbol validation.
#[derive(Clone)]
pub struct MarketDataService {
    exchange: Arc<dyn ExchangeClient>,
    cache: Arc<MarketCache>,
}

impl MarketDataService {
    pub fn new(exchange: Arc<dyn ExchangeClient>, cache: Arc<MarketCache>) -> Self {
        Self { exchange, cache }
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }

    pub fn cache(&self) -> &MarketCache {
        &self.cache
    }

    pub async fn load_markets(&self) -> Result<BTreeSet<String>, ExchangeError> {
        self.cache
            .try_get_or_set(MARKETS_CACHE_KEY, || self.exchange.load_markets())
            .await
    }

    async fn ensure_symbol(&self, symbol: &str) -> Result<(), ExchangeError> {
        let markets = self.load_markets().await?;
        if markets.contains(symbol) {
            Ok(())
        } else {
            debug!("Rejecting unknown symbol {}", symbol);
            Err(ExchangeError::InvalidSymbol(format!(
                "Symbol not found on {}: {}",
                self.exchange.name(),
                symbol
            )))
        }
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.ensure_symbol(symbol).await?;
        let key = cache_key("ticker", &[symbol]);
        self.cache
            .try_get_or_set(&key, || self.exchange.fetch_ticker(symbol))
            .await
    }

    pub async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Ohlcv>, ExchangeError> {
        if limit == 0 {
            return Err(ExchangeError::InvalidTimeRange("limit must be positive".to_string()));
        }
        self.ensure_symbol(symbol).await?;

        let limit_str = limit.to_string();
        let since_str = since.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        let key = cache_key("ohlcv", &[symbol, timeframe.as_str(), &limit_str, &since_str]);
        self.cache
            .try_get_or_set(&key, || self.exchange.fetch_ohlcv(symbol, timeframe, limit, since))
            .await
    }

    pub async fn get_order_book(&self, symbol: &str, limit: u32) -> Result<OrderBook, ExchangeError> {
        self.ensure_symbol(symbol).await?;
        let key = cache_key("orderbook", &[symbol, &limit.to_string()]);
        self.cache
            .try_get_or_set(&key, || self.exchange.fetch_order_book(symbol, limit))
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockExchange;
    use super::*;
    use crate::config::CacheSettings;
    use std::sync::atomic::Ordering;

    fn service() -> (Arc<MockExchange>, MarketDataService) {
        let exchange = Arc::new(MockExchange::default());
        let cache = Arc::new(MarketCache::local(&CacheSettings::default()));
        let service = MarketDataService::new(exchange.clone(), cache);
        (exchange, service)
    }

    #[tokio::test]
    async fn test_ticker_is_cached() {
        let (exchange, service) = service();
        let first = service.get_ticker("BTC/USDT").await.unwrap();
        let second = service.get_ticker("BTC/USDT").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exchange.ticker_calls.load(Ordering::SeqCst), 1);
        assert_eq!(exchange.market_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_rejected_without_fetch() {
        let (exchange, service) = service();
        let err = service.get_ticker("DOGE/EUR").await.unwrap_err();
        assert_eq!(
            err,
            ExchangeError::InvalidSymbol("Symbol not found on mock: DOGE/EUR".to_string())
        );
        assert_eq!(exchange.ticker_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ohlcv_zero_limit() {
        let (exchange, service) = service();
        let err = service
            .get_ohlcv("BTC/USDT", Timeframe::OneHour, 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidTimeRange(_)));
        assert_eq!(exchange.market_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ohlcv_cache_key_includes_parameters() {
        let (exchange, service) = service();
        let candles = service
            .get_ohlcv("ETH/USDT", Timeframe::FiveMinutes, 3, Some(1_000))
            .await
            .unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[1].timestamp, 61_000);

        service
            .get_ohlcv("ETH/USDT", Timeframe::FiveMinutes, 3, Some(1_000))
            .await
            .unwrap();
        service
            .get_ohlcv("ETH/USDT", Timeframe::FiveMinutes, 5, Some(1_000))
            .await
            .unwrap();
        assert_eq!(exchange.ohlcv_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_not_cached() {
        let (exchange, service) = service();
        service.load_markets().await.unwrap();

        exchange.failing.store(true, Ordering::SeqCst);
        let err = service.get_order_book("BTC/USDT", 5).await.unwrap_err();
        assert!(err.is_recoverable());

        exchange.failing.store(false, Ordering::SeqCst);
        let book = service.get_order_book("BTC/USDT", 5).await.unwrap();
        assert_eq!(book.bids.len(), 5);
        assert_eq!(exchange.book_calls.load(Ordering::SeqCst), 2);
    }
}
