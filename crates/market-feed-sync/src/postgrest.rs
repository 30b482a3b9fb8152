use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_feed_core::candle::{canonical_time, parse_time};
use market_feed_core::{Candle, CandleRecord, CandleStore, StoreError};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_TABLE: &str = "crypto_data";

/// Candle store backed by a hosted Postgres table exposed over PostgREST.
/// The table needs a unique constraint on `(product_id, time)`.
pub struct PostgrestStore {
    client: Client,
    base_url: String,
    api_key: String,
    table: String,
}

#[derive(Debug, Deserialize)]
struct TimeRow {
    time: String,
}

fn backend(context: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{context}: {e}"))
}

impl PostgrestStore {
    /// Create from `SUPABASE_URL` and `SUPABASE_KEY`; the table name can be
    /// overridden with `MARKET_FEED_TABLE`.
    pub fn from_env() -> Result<Self, StoreError> {
        let base_url = std::env::var("SUPABASE_URL")
            .map_err(|_| StoreError::Backend("SUPABASE_URL not set".into()))?;
        let api_key = std::env::var("SUPABASE_KEY")
            .map_err(|_| StoreError::Backend("SUPABASE_KEY not set".into()))?;
        let table = std::env::var("MARKET_FEED_TABLE").unwrap_or_else(|_| DEFAULT_TABLE.into());

        Self::new(base_url, api_key, Some(table))
    }

    pub fn new(base_url: String, api_key: String, table: Option<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| backend("failed to build HTTP client", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            table: table.unwrap_or_else(|| DEFAULT_TABLE.to_string()),
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn check(response: Response, context: &str) -> Result<Response, StoreError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Backend(format!("{context} ({status}): {body}")))
    }
}

#[async_trait]
impl CandleStore for PostgrestStore {
    async fn latest_timestamp(
        &self,
        product_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let response = self
            .authed(self.client.get(self.table_url()))
            .query(&[
                ("select", "time".to_string()),
                ("product_id", format!("eq.{product_id}")),
                ("order", "time.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await
            .map_err(|e| backend("watermark query failed", e))?;

        let rows: Vec<TimeRow> = Self::check(response, "watermark query")
            .await?
            .json()
            .await
            .map_err(|e| backend("invalid watermark response", e))?;

        rows.first().map(|row| parse_time(&row.time)).transpose()
    }

    async fn upsert(&self, product_id: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        if candles.is_empty() {
            return Ok(0);
        }

        let records: Vec<CandleRecord> = candles
            .iter()
            .map(|c| CandleRecord::from_candle(product_id, c))
            .collect();
        debug!("{product_id}: upserting {} row(s) into {}", records.len(), self.table);

        let response = self
            .authed(self.client.post(self.table_url()))
            .query(&[("on_conflict", "product_id,time")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&records)
            .send()
            .await
            .map_err(|e| backend("upsert failed", e))?;

        Self::check(response, "upsert").await?;
        Ok(records.len())
    }

    async fn read_range(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        let response = self
            .authed(self.client.get(self.table_url()))
            .query(&[
                ("select", "*".to_string()),
                ("product_id", format!("eq.{product_id}")),
                ("time", format!("gte.{}", canonical_time(&start))),
                ("time", format!("lte.{}", canonical_time(&end))),
                ("order", "time.asc".to_string()),
            ])
            .send()
            .await
            .map_err(|e| backend("range query failed", e))?;

        let records: Vec<CandleRecord> = Self::check(response, "range query")
            .await?
            .json()
            .await
            .map_err(|e| backend("invalid range response", e))?;

        records.iter().map(CandleRecord::to_candle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Request head (request line plus headers) and body as received.
    struct Seen {
        head: String,
        body: String,
    }

    impl Seen {
        fn request_line(&self) -> &str {
            self.head.lines().next().unwrap_or_default()
        }

        fn header(&self, name: &str) -> Option<&str> {
            self.head.lines().skip(1).find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.eq_ignore_ascii_case(name).then(|| value.trim())
            })
        }
    }

    async fn read_request(socket: &mut TcpStream) -> Seen {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break buf.len();
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let length: usize = head
            .lines()
            .find_map(|l| {
                let (k, v) = l.split_once(':')?;
                k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse().ok())?
            })
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();
        Seen { head, body }
    }

    /// Answers one connection per canned response and hands back what it saw.
    async fn serve(canned: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<Seen>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in canned {
                let (mut socket, _) = listener.accept().await.unwrap();
                seen.push(read_request(&mut socket).await);
                let response = format!(
                    "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            seen
        });

        (format!("http://{addr}"), handle)
    }

    fn store(base_url: String) -> PostgrestStore {
        PostgrestStore::new(base_url, "secret".into(), None).unwrap()
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, 0).unwrap()
    }

    fn candle(timestamp: DateTime<Utc>) -> Candle {
        Candle {
            timestamp,
            open: dec!(101),
            high: dec!(103),
            low: dec!(99.5),
            close: dec!(102),
            volume: dec!(5.25),
        }
    }

    #[test]
    fn table_url_defaults_to_crypto_data() {
        let store =
            PostgrestStore::new("https://db.example.co/".into(), "key".into(), None).unwrap();
        assert_eq!(store.table_url(), "https://db.example.co/rest/v1/crypto_data");
    }

    #[test]
    fn parse_stored_records() {
        let json = r#"[{
            "id": 17,
            "product_id": "BTC-USD",
            "time": "2025-03-01T00:15:00+00:00",
            "low": 99.5,
            "high": 103,
            "open": 101,
            "close": 102,
            "volume": 5.25
        }]"#;
        let records: Vec<CandleRecord> = serde_json::from_str(json).unwrap();
        let candle = records[0].to_candle().unwrap();
        assert_eq!(candle.timestamp, t(0, 15));
        assert!(candle.is_consistent());
    }

    #[tokio::test]
    async fn latest_timestamp_queries_newest_row() {
        let (url, server) = serve(vec![(200, r#"[{"time":"2025-03-01T00:15:00+00:00"}]"#)]).await;

        let latest = store(url).latest_timestamp("BTC-USD").await.unwrap();
        assert_eq!(latest, Some(t(0, 15)));

        let seen = server.await.unwrap();
        let line = seen[0].request_line();
        assert!(line.starts_with("GET /rest/v1/crypto_data?"), "{line}");
        assert!(line.contains("select=time"), "{line}");
        assert!(line.contains("product_id=eq.BTC-USD"), "{line}");
        assert!(line.contains("order=time.desc"), "{line}");
        assert!(line.contains("limit=1"), "{line}");
        assert_eq!(seen[0].header("apikey"), Some("secret"));
        assert_eq!(seen[0].header("authorization"), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn latest_timestamp_reads_times_without_offset() {
        let (url, server) = serve(vec![(200, r#"[{"time":"2025-03-01T00:15:00"}]"#)]).await;

        let latest = store(url).latest_timestamp("BTC-USD").await.unwrap();
        assert_eq!(latest, Some(t(0, 15)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn latest_timestamp_of_empty_table() {
        let (url, server) = serve(vec![(200, "[]")]).await;

        assert_eq!(store(url).latest_timestamp("ETH-USD").await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn upsert_posts_merge_on_conflict() {
        let (url, server) = serve(vec![(201, "")]).await;

        let written = store(url)
            .upsert("BTC-USD", &[candle(t(0, 0)), candle(t(0, 15))])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let seen = server.await.unwrap();
        let line = seen[0].request_line();
        assert!(line.starts_with("POST /rest/v1/crypto_data?"), "{line}");
        assert!(line.contains("on_conflict=product_id%2Ctime"), "{line}");
        let prefer = seen[0].header("prefer").unwrap();
        assert!(prefer.contains("resolution=merge-duplicates"), "{prefer}");
        assert_eq!(seen[0].header("apikey"), Some("secret"));
        assert_eq!(seen[0].header("authorization"), Some("Bearer secret"));

        let sent: Vec<CandleRecord> = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].product_id, "BTC-USD");
        assert_eq!(sent[1].time, "2025-03-01T00:15:00+00:00");
    }

    #[tokio::test]
    async fn upsert_nothing_sends_no_request() {
        let store = store("http://127.0.0.1:9".into());
        assert_eq!(store.upsert("BTC-USD", &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_range_sends_encoded_bounds() {
        let body = r#"[
            {"product_id":"BTC-USD","time":"2025-03-01T00:00:00+00:00","low":"99.5","high":"103","open":"101","close":"102","volume":"5.25"},
            {"product_id":"BTC-USD","time":"2025-03-01T00:15:00","low":"99.5","high":"103","open":"101","close":"102","volume":"5.25"}
        ]"#;
        let (url, server) = serve(vec![(200, body)]).await;

        let rows = store(url)
            .read_range("BTC-USD", t(0, 0), t(1, 0))
            .await
            .unwrap();
        assert_eq!(rows, vec![candle(t(0, 0)), candle(t(0, 15))]);

        let seen = server.await.unwrap();
        let line = seen[0].request_line();
        assert!(line.contains("product_id=eq.BTC-USD"), "{line}");
        assert!(line.contains("time=gte.2025-03-01T00%3A00%3A00%2B00%3A00"), "{line}");
        assert!(line.contains("time=lte.2025-03-01T01%3A00%3A00%2B00%3A00"), "{line}");
        assert!(line.contains("order=time.asc"), "{line}");
    }

    #[tokio::test]
    async fn rejected_request_is_backend_error() {
        let (url, server) = serve(vec![
            (401, r#"{"message":"Invalid API key"}"#),
            (401, r#"{"message":"Invalid API key"}"#),
        ])
        .await;
        let store = store(url);

        match store.latest_timestamp("BTC-USD").await {
            Err(StoreError::Backend(msg)) => {
                assert!(msg.contains("401"), "{msg}");
                assert!(msg.contains("Invalid API key"), "{msg}");
            }
            other => panic!("expected Backend error, got {other:?}"),
        }
        assert!(matches!(
            store.upsert("BTC-USD", &[candle(t(0, 0))]).await,
            Err(StoreError::Backend(_))
        ));
        server.await.unwrap();
    }
}
