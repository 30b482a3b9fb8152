use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A single OHLCV candle. `timestamp` is the start of the interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// High bounds open/close from above and low bounds them from below.
    pub fn is_consistent(&self) -> bool {
        self.high >= self.open.max(self.close) && self.low <= self.open.min(self.close)
    }

    /// High minus low.
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }
}

/// Candle interval sizes accepted by the upstream candle endpoint.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub enum Granularity {
    OneMinute,
    FiveMinutes,
    #[default]
    FifteenMinutes,
    OneHour,
    SixHours,
    OneDay,
}

impl Granularity {
    pub const ALL: [Granularity; 6] = [
        Granularity::OneMinute,
        Granularity::FiveMinutes,
        Granularity::FifteenMinutes,
        Granularity::OneHour,
        Granularity::SixHours,
        Granularity::OneDay,
    ];

    pub fn seconds(self) -> u32 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 300,
            Granularity::FifteenMinutes => 900,
            Granularity::OneHour => 3_600,
            Granularity::SixHours => 21_600,
            Granularity::OneDay => 86_400,
        }
    }

    pub fn duration(self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.seconds()))
    }

    /// Pick an interval for a lookback window. Longer windows get coarser
    /// candles so a chart stays within a few hundred points.
    pub fn for_lookback(lookback: Duration) -> Self {
        const DAY: u64 = 86_400;
        match lookback.as_secs() {
            s if s <= 3 * DAY => Granularity::FifteenMinutes,
            s if s <= 14 * DAY => Granularity::OneHour,
            s if s <= 60 * DAY => Granularity::SixHours,
            _ => Granularity::OneDay,
        }
    }
}

impl TryFrom<u32> for Granularity {
    type Error = StoreError;

    fn try_from(seconds: u32) -> Result<Self, Self::Error> {
        Granularity::ALL
            .into_iter()
            .find(|g| g.seconds() == seconds)
            .ok_or_else(|| {
                StoreError::InvalidData(format!(
                    "unsupported granularity {seconds}s, expected one of 60, 300, 900, 3600, 21600, 86400"
                ))
            })
    }
}

impl From<Granularity> for u32 {
    fn from(g: Granularity) -> Self {
        g.seconds()
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.seconds())
    }
}

/// A candle tagged with its product, in the row shape of the hosted
/// `crypto_data` table. `time` is RFC 3339 text in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub product_id: String,
    pub time: String,
    pub low: Decimal,
    pub high: Decimal,
    pub open: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Canonical text form of a candle time.
pub fn canonical_time(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parse a stored candle time. RFC 3339 with any offset is accepted, and
/// times without an offset are read as UTC.
pub fn parse_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|t| t.and_utc())
        .map_err(|e| StoreError::InvalidData(format!("invalid time '{text}': {e}")))
}

impl CandleRecord {
    pub fn from_candle(product_id: &str, candle: &Candle) -> Self {
        Self {
            product_id: product_id.to_string(),
            time: canonical_time(&candle.timestamp),
            low: candle.low,
            high: candle.high,
            open: candle.open,
            close: candle.close,
            volume: candle.volume,
        }
    }

    pub fn to_candle(&self) -> Result<Candle, StoreError> {
        let timestamp = parse_time(&self.time)?;

        Ok(Candle {
            timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        })
    }
}
