use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::calendar;
use crate::candle::Candle;
use crate::error::StoreError;
use crate::schema;

/// Durable candle series keyed by `(product_id, timestamp)`.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Open time of the most recent stored candle for a product.
    async fn latest_timestamp(
        &self,
        product_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Insert or overwrite candles by `(product_id, timestamp)`.
    /// Returns the number of rows written.
    async fn upsert(&self, product_id: &str, candles: &[Candle]) -> Result<usize, StoreError>;

    /// Candles with `start <= timestamp <= end`, ascending.
    async fn read_range(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError>;
}

#[async_trait]
impl<T: CandleStore + ?Sized> CandleStore for Box<T> {
    async fn latest_timestamp(
        &self,
        product_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        (**self).latest_timestamp(product_id).await
    }

    async fn upsert(&self, product_id: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        (**self).upsert(product_id, candles).await
    }

    async fn read_range(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        (**self).read_range(product_id, start, end).await
    }
}

/// Filesystem-backed candle store in Parquet format, one file per UTC day.
///
/// Directory layout: `{root}/data/{PRODUCT}/{YYYY}/{MM}/{YYYY-MM-DD}.parquet`
///
/// The inherent methods block on filesystem I/O; the `CandleStore` impl runs
/// them on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct ParquetStore {
    data_dir: PathBuf,
}

impl ParquetStore {
    /// Create a store rooted at the given directory.
    /// The `data/` subdirectory is used automatically.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            data_dir: root.as_ref().join("data"),
        }
    }

    /// Directory holding one product's files. Ids that could escape
    /// `data/` are rejected.
    fn product_dir(&self, product_id: &str) -> Result<PathBuf, StoreError> {
        let invalid = product_id.is_empty()
            || product_id.contains(['/', '\\'])
            || product_id.contains("..");
        if invalid {
            return Err(StoreError::InvalidData(format!(
                "invalid product id '{product_id}'"
            )));
        }
        Ok(self.data_dir.join(product_id))
    }

    pub fn file_path(&self, product_id: &str, date: NaiveDate) -> Result<PathBuf, StoreError> {
        Ok(self
            .product_dir(product_id)?
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(format!("{}.parquet", date.format("%Y-%m-%d"))))
    }

    pub fn has_data(&self, product_id: &str, date: NaiveDate) -> bool {
        self.file_path(product_id, date)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    /// Read all candles for a product on a specific date.
    pub fn read_day(&self, product_id: &str, date: NaiveDate) -> Result<Vec<Candle>, StoreError> {
        let path = self.file_path(product_id, date)?;
        if !path.exists() {
            return Err(StoreError::NoData {
                product_id: product_id.to_string(),
                date,
            });
        }
        schema::read_parquet(&path)
    }

    /// Replace the day file. Written to a sibling temp file first so a
    /// crash mid-write leaves the previous file intact.
    fn write_day(
        &self,
        product_id: &str,
        date: NaiveDate,
        candles: &[Candle],
    ) -> Result<(), StoreError> {
        let path = self.file_path(product_id, date)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("parquet.tmp");
        schema::write_parquet(&tmp, candles)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Merge candles into one day file, overwriting rows with equal timestamps.
    fn merge_day(
        &self,
        product_id: &str,
        date: NaiveDate,
        candles: &[&Candle],
    ) -> Result<(), StoreError> {
        let mut rows: BTreeMap<DateTime<Utc>, Candle> = if self.has_data(product_id, date) {
            self.read_day(product_id, date)?
                .into_iter()
                .map(|c| (c.timestamp, c))
                .collect()
        } else {
            BTreeMap::new()
        };

        for candle in candles {
            rows.insert(candle.timestamp, (*candle).clone());
        }

        let merged: Vec<Candle> = rows.into_values().collect();
        debug!("{product_id} {date}: writing {} row(s)", merged.len());
        self.write_day(product_id, date, &merged)
    }

    /// List all products that have data in the store.
    pub fn list_products(&self) -> Result<Vec<String>, StoreError> {
        if !self.data_dir.exists() {
            return Ok(Vec::new());
        }

        let mut products = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                products.push(name.to_string());
            }
        }
        products.sort();
        Ok(products)
    }

    /// All dates with a day file for a product, ascending.
    pub fn list_dates(&self, product_id: &str) -> Result<Vec<NaiveDate>, StoreError> {
        let product_dir = self.product_dir(product_id)?;
        if !product_dir.exists() {
            return Ok(Vec::new());
        }

        let mut dates = BTreeSet::new();
        for year in subdirs(&product_dir)? {
            for month in subdirs(&year)? {
                for file in std::fs::read_dir(&month)? {
                    let name = file?.file_name();
                    let name = name.to_string_lossy();
                    if let Some(stem) = name.strip_suffix(".parquet")
                        && let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d")
                    {
                        dates.insert(date);
                    }
                }
            }
        }

        Ok(dates.into_iter().collect())
    }

    /// First and last stored dates for a product, or None if no data.
    pub fn date_range(
        &self,
        product_id: &str,
    ) -> Result<Option<(NaiveDate, NaiveDate)>, StoreError> {
        let dates = self.list_dates(product_id)?;
        Ok(dates.first().copied().zip(dates.last().copied()))
    }

    /// Total stored rows for a product.
    pub fn count(&self, product_id: &str) -> Result<usize, StoreError> {
        let mut total = 0;
        for date in self.list_dates(product_id)? {
            total += self.read_day(product_id, date)?.len();
        }
        Ok(total)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

impl ParquetStore {
    fn latest_stored(&self, product_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        // Walk back from the newest day file in case it was written empty.
        for date in self.list_dates(product_id)?.into_iter().rev() {
            let latest = self
                .read_day(product_id, date)?
                .into_iter()
                .map(|c| c.timestamp)
                .max();
            if latest.is_some() {
                return Ok(latest);
            }
        }
        Ok(None)
    }

    fn upsert_days(&self, product_id: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        let mut by_day: BTreeMap<NaiveDate, Vec<&Candle>> = BTreeMap::new();
        for candle in candles {
            by_day
                .entry(candle.timestamp.date_naive())
                .or_default()
                .push(candle);
        }

        for (date, day_candles) in &by_day {
            self.merge_day(product_id, *date, day_candles)?;
        }
        Ok(candles.len())
    }

    fn read_days(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        self.product_dir(product_id)?;
        let mut candles = Vec::new();
        for date in calendar::utc_days(&start, &end) {
            if self.has_data(product_id, date) {
                candles.extend(
                    self.read_day(product_id, date)?
                        .into_iter()
                        .filter(|c| c.timestamp >= start && c.timestamp <= end),
                );
            }
        }
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(ParquetStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl CandleStore for ParquetStore {
    async fn latest_timestamp(
        &self,
        product_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let product_id = product_id.to_string();
        self.blocking(move |store| store.latest_stored(&product_id))
            .await
    }

    async fn upsert(&self, product_id: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        let product_id = product_id.to_string();
        let candles = candles.to_vec();
        self.blocking(move |store| store.upsert_days(&product_id, &candles))
            .await
    }

    async fn read_range(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        let product_id = product_id.to_string();
        self.blocking(move |store| store.read_days(&product_id, start, end))
            .await
    }
}
