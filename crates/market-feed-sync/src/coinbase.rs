use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use market_feed_core::{Candle, Granularity, Product, Stats, Ticker};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::UpstreamError;
use crate::provider::MarketDataSource;
use crate::throttle::Throttle;

const COINBASE_BASE_URL: &str = "https://api.exchange.coinbase.com";

/// The candle endpoint returns at most this many rows per request.
pub const MAX_CANDLES_PER_REQUEST: i32 = 300;

/// The exchange rejects requests without a User-Agent.
const USER_AGENT: &str = concat!("market-feed/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Requests per second.
    pub rate_limit: f64,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: COINBASE_BASE_URL.to_string(),
            rate_limit: 10.0,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Coinbase Exchange public market data.
/// No authentication required. All calls share one throttle.
pub struct CoinbaseClient {
    client: Client,
    base_url: String,
    throttle: Throttle,
    timeout: Duration,
}

/// `[time, low, high, open, close, volume]`, time in epoch seconds.
type RawCandle = (i64, Decimal, Decimal, Decimal, Decimal, Decimal);

fn raw_to_candle(raw: &RawCandle) -> Result<Candle, UpstreamError> {
    let (time, low, high, open, close, volume) = *raw;
    let timestamp = Utc
        .timestamp_opt(time, 0)
        .single()
        .ok_or_else(|| UpstreamError::Parse(format!("invalid unix timestamp: {time}")))?;

    Ok(Candle {
        timestamp,
        open,
        high,
        low,
        close,
        volume,
    })
}

fn iso(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Split `[start, end]` into consecutive closed windows that each hold at
/// most [`MAX_CANDLES_PER_REQUEST`] candle open times. Windows neither
/// overlap nor leave a gap at one-second resolution.
pub fn candle_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    granularity: Granularity,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let span = granularity.duration() * (MAX_CANDLES_PER_REQUEST - 1);
    let mut windows = Vec::new();
    let mut from = start;
    while from <= end {
        let to = (from + span).min(end);
        windows.push((from, to));
        from = to + chrono::Duration::seconds(1);
    }
    windows
}

impl CoinbaseClient {
    pub fn new(config: ClientConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| UpstreamError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            throttle: Throttle::per_second(config.rate_limit)?,
            timeout: config.timeout,
        })
    }

    /// Create with a custom base URL and default limits (for testing).
    pub fn with_base_url(base_url: String) -> Result<Self, UpstreamError> {
        Self::new(ClientConfig {
            base_url,
            ..ClientConfig::default()
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Http(e)
        }
    }

    /// Throttled GET returning the decoded JSON body.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        self.throttle.wait().await;

        let url = format!("{}{}", self.base_url, path);
        debug!("GET {url} {query:?}");

        let mut request = self.client.get(&url);
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Api {
                status,
                message: body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(e))?;
        serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Parse(format!("failed to parse response from {path}: {e}")))
    }

    async fn fetch_window(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<Candle>, UpstreamError> {
        let rows: Vec<RawCandle> = self
            .get_json(
                &format!("/products/{product_id}/candles"),
                &[
                    ("start", iso(&start)),
                    ("end", iso(&end)),
                    ("granularity", granularity.seconds().to_string()),
                ],
            )
            .await?;

        rows.iter().map(raw_to_candle).collect()
    }
}

#[async_trait]
impl MarketDataSource for CoinbaseClient {
    fn name(&self) -> &str {
        "coinbase"
    }

    async fn list_products(&self) -> Result<Vec<Product>, UpstreamError> {
        self.get_json("/products", &[]).await
    }

    async fn get_ticker(&self, product_id: &str) -> Result<Ticker, UpstreamError> {
        self.get_json(&format!("/products/{product_id}/ticker"), &[])
            .await
    }

    async fn get_candles(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<Candle>, UpstreamError> {
        let windows = candle_windows(start, end, granularity);
        if windows.len() > 1 {
            debug!(
                "{product_id}: splitting {} to {} into {} request(s)",
                iso(&start),
                iso(&end),
                windows.len()
            );
        }

        let mut candles = Vec::new();
        for (from, to) in windows {
            candles.extend(self.fetch_window(product_id, from, to, granularity).await?);
        }

        // The upstream answers newest first.
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn get_stats(&self, product_id: &str) -> Result<Stats, UpstreamError> {
        self.get_json(&format!("/products/{product_id}/stats"), &[])
            .await
    }
}
