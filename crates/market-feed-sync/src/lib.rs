pub mod coinbase;
pub mod error;
pub mod poll;
pub mod postgrest;
pub mod provider;
pub mod sync;
pub mod throttle;

pub use coinbase::{ClientConfig, CoinbaseClient};
pub use error::{SyncError, UpstreamError};
pub use poll::{Backoff, PollOutcome, PollSchedule};
pub use postgrest::PostgrestStore;
pub use provider::MarketDataSource;
pub use sync::SyncManager;
pub use throttle::Throttle;
