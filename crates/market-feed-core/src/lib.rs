pub mod calendar;
pub mod candle;
pub mod error;
pub mod indicators;
pub mod memory;
pub mod product;
pub mod schema;
pub mod store;

pub use candle::{Candle, CandleRecord, Granularity};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use product::{Product, Stats, Ticker};
pub use store::{CandleStore, ParquetStore};
