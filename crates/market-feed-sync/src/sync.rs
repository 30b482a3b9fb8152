use chrono::{DateTime, Duration, Utc};
use market_feed_core::{CandleRecord, CandleStore, Granularity};
use tracing::{debug, info};

use crate::error::SyncError;
use crate::provider::MarketDataSource;

/// Keeps stored candle series current by fetching only what is newer than
/// the latest stored candle.
pub struct SyncManager<S, St> {
    source: S,
    store: St,
    granularity: Granularity,
    default_lookback: Duration,
}

impl<S: MarketDataSource, St: CandleStore> SyncManager<S, St> {
    /// 15 minute candles, 24 hours of history on first sync.
    pub fn new(source: S, store: St) -> Self {
        Self {
            source,
            store,
            granularity: Granularity::default(),
            default_lookback: Duration::hours(24),
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// How far back the first sync of a product reaches.
    pub fn with_default_lookback(mut self, lookback: Duration) -> Self {
        self.default_lookback = lookback;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Latest stored candle time, or `now - default_lookback` when the
    /// product has nothing stored yet.
    pub async fn watermark(
        &self,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SyncError> {
        Ok(self
            .store
            .latest_timestamp(product_id)
            .await?
            .unwrap_or(now - self.default_lookback))
    }

    pub async fn sync(&self, product_id: &str) -> Result<Vec<CandleRecord>, SyncError> {
        self.sync_at(product_id, Utc::now()).await
    }

    /// Fetch `[watermark, now]` and upsert it. The watermark candle itself is
    /// fetched again and overwritten, so a repeated sync never duplicates rows.
    /// Returns the rows written, empty when the upstream had nothing.
    pub async fn sync_at(
        &self,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CandleRecord>, SyncError> {
        let since = self.watermark(product_id, now).await?;
        debug!("{product_id}: syncing from {since} to {now} at {}", self.granularity);

        let candles = self
            .source
            .get_candles(product_id, since, now, self.granularity)
            .await?;

        if candles.is_empty() {
            debug!("{product_id}: nothing new");
            return Ok(Vec::new());
        }

        let records: Vec<CandleRecord> = candles
            .iter()
            .map(|c| CandleRecord::from_candle(product_id, c))
            .collect();

        self.store.upsert(product_id, &candles).await?;
        info!(
            "{product_id}: stored {} candle(s) up to {}",
            records.len(),
            records.last().map(|r| r.time.as_str()).unwrap_or_default()
        );
        Ok(records)
    }

    /// Sync each product in turn. A failure is reported for its product and
    /// does not stop the others.
    pub async fn sync_all(
        &self,
        product_ids: &[String],
    ) -> Vec<(String, Result<Vec<CandleRecord>, SyncError>)> {
        let now = Utc::now();
        let mut results = Vec::with_capacity(product_ids.len());
        for id in product_ids {
            results.push((id.clone(), self.sync_at(id, now).await));
        }
        results
    }
}
