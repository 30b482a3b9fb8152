use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_feed_core::{Candle, Granularity, Product, Stats, Ticker};

use crate::error::UpstreamError;

/// Read-only market data from an exchange.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Source name (for logging/display).
    fn name(&self) -> &str;

    async fn list_products(&self) -> Result<Vec<Product>, UpstreamError>;

    async fn get_ticker(&self, product_id: &str) -> Result<Ticker, UpstreamError>;

    /// Candles covering `[start, end]`, ascending by time with no duplicate
    /// timestamps. Empty when the upstream has nothing in range.
    async fn get_candles(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<Candle>, UpstreamError>;

    async fn get_stats(&self, product_id: &str) -> Result<Stats, UpstreamError>;
}
