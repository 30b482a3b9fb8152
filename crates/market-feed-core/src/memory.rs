use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::candle::Candle;
use crate::error::StoreError;
use crate::store::CandleStore;

type Key = (String, DateTime<Utc>);

/// In-process candle store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<Key, Candle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Key, Candle>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    /// Stored rows for one product.
    pub fn count(&self, product_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .rows()?
            .keys()
            .filter(|(p, _)| p == product_id)
            .count())
    }

    /// Every stored row for one product, ascending.
    pub fn all(&self, product_id: &str) -> Result<Vec<Candle>, StoreError> {
        Ok(self
            .rows()?
            .iter()
            .filter(|((p, _), _)| p == product_id)
            .map(|(_, c)| c.clone())
            .collect())
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn latest_timestamp(
        &self,
        product_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .rows()?
            .keys()
            .filter(|(p, _)| p == product_id)
            .map(|(_, t)| *t)
            .next_back())
    }

    async fn upsert(&self, product_id: &str, candles: &[Candle]) -> Result<usize, StoreError> {
        let mut rows = self.rows()?;
        for candle in candles {
            rows.insert((product_id.to_string(), candle.timestamp), candle.clone());
        }
        Ok(candles.len())
    }

    async fn read_range(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let from = (product_id.to_string(), start);
        let to = (product_id.to_string(), end);
        Ok(self
            .rows()?
            .range(from..=to)
            .map(|(_, c)| c.clone())
            .collect())
    }
}
