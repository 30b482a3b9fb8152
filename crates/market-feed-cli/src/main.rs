use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use market_feed_core::indicators::{IndicatorFrame, mean, pct_change, volumes};
use market_feed_core::product::{default_pair, tradable_pairs};
use market_feed_core::{Candle, CandleStore, Granularity, MemoryStore, ParquetStore, Ticker};
use market_feed_sync::{
    Backoff, ClientConfig, CoinbaseClient, MarketDataSource, PollOutcome, PollSchedule,
    PostgrestStore, SyncManager,
};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "market-feed",
    about = "Sync and watch crypto candle data from Coinbase"
)]
struct Cli {
    /// Root directory for the local store (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Where candles are persisted
    #[arg(long, value_enum, default_value_t = StoreKind::Local)]
    store: StoreKind,

    /// Market data API base URL
    #[arg(long, default_value = "https://api.exchange.coinbase.com")]
    base_url: String,

    /// Maximum requests per second to the market data API
    #[arg(long, default_value_t = 10.0)]
    rate_limit: f64,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// Parquet files under --data-dir
    Local,
    /// Hosted table via SUPABASE_URL / SUPABASE_KEY
    Hosted,
    /// In-process only, lost on exit
    Memory,
}

#[derive(Subcommand)]
enum Commands {
    /// List tradable products
    Products {
        /// Quote currency to filter on
        #[arg(long, default_value = "USD")]
        quote: String,

        /// Minimum number of listings a base currency needs
        #[arg(long, default_value_t = 5)]
        min_listings: usize,

        /// Show every product, unfiltered
        #[arg(long)]
        all: bool,
    },

    /// Show the latest ticker for a product
    Ticker {
        #[arg(short, long)]
        product: String,
    },

    /// Show 24h stats for a product
    Stats {
        #[arg(short, long)]
        product: String,
    },

    /// Fetch candles straight from the API without storing them
    Candles {
        #[arg(short, long)]
        product: String,

        /// Lookback in days
        #[arg(long, default_value_t = 1)]
        days: u32,

        /// Candle size in seconds (picked from the lookback if omitted)
        #[arg(long)]
        granularity: Option<u32>,
    },

    /// Fetch and store candles newer than what is already stored
    Sync {
        /// Products to sync (comma-separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        products: Vec<String>,

        /// Candle size in seconds
        #[arg(long, default_value_t = 900)]
        granularity: u32,
    },

    /// Sync on a timer and log indicators after each cycle
    Watch {
        /// Product to watch (defaults to BTC-USD or the first USD pair)
        #[arg(short, long)]
        product: Option<String>,

        /// Window of stored history to compute indicators over, in days
        #[arg(long, default_value_t = 1)]
        days: u32,

        /// Candle size in seconds
        #[arg(long, default_value_t = 900)]
        granularity: u32,

        /// Seconds between successful cycles
        #[arg(long, default_value_t = 60)]
        interval: u64,

        /// Seconds to wait after a failed cycle
        #[arg(long, default_value_t = 5)]
        backoff: u64,

        /// Upper bound in seconds on the wait after repeated failures
        #[arg(long, default_value_t = 300)]
        max_backoff: u64,
    },

    /// Print stored candles with indicators
    History {
        #[arg(short, long)]
        product: String,

        /// Lookback in days
        #[arg(long, default_value_t = 30)]
        days: u32,

        /// Number of most recent rows to print
        #[arg(long, default_value_t = 20)]
        rows: usize,
    },

    /// Show what data exists in the local store
    Status {
        /// Filter by product (shows all if omitted)
        #[arg(short, long)]
        product: Option<String>,
    },
}

fn create_client(cli: &Cli) -> Result<CoinbaseClient> {
    CoinbaseClient::new(ClientConfig {
        base_url: cli.base_url.clone(),
        rate_limit: cli.rate_limit,
        timeout: Duration::from_secs(cli.timeout_secs),
    })
    .context("failed to create market data client")
}

fn create_store(cli: &Cli) -> Result<Box<dyn CandleStore>> {
    match cli.store {
        StoreKind::Local => Ok(Box::new(ParquetStore::new(&cli.data_dir))),
        StoreKind::Hosted => Ok(Box::new(
            PostgrestStore::from_env().context("failed to create hosted store")?,
        )),
        StoreKind::Memory => Ok(Box::new(MemoryStore::new())),
    }
}

fn granularity(seconds: u32) -> Result<Granularity> {
    Granularity::try_from(seconds).context("invalid --granularity")
}

fn fmt_opt(value: Option<Decimal>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "-".to_string())
}

async fn cmd_products(
    client: &CoinbaseClient,
    quote: &str,
    min_listings: usize,
    all: bool,
) -> Result<()> {
    let products = client
        .list_products()
        .await
        .context("failed to list products")?;

    if all {
        let mut products = products;
        products.sort_by(|a, b| a.id.cmp(&b.id));
        for p in &products {
            println!("{:<14} {:<8} {:<8} {}", p.id, p.base_currency, p.quote_currency, p.status);
        }
        return Ok(());
    }

    let pairs = tradable_pairs(&products, quote, min_listings);
    if pairs.is_empty() {
        println!("No tradable {quote} pairs.");
        return Ok(());
    }
    for pair in &pairs {
        println!("{pair}");
    }
    if let Some(default) = default_pair(&pairs) {
        info!("{} pair(s), default {default}", pairs.len());
    }
    Ok(())
}

async fn cmd_ticker(client: &CoinbaseClient, product: &str) -> Result<()> {
    let t = client
        .get_ticker(product)
        .await
        .with_context(|| format!("failed to fetch ticker for {product}"))?;
    println!(
        "{product}: price {} bid {} ask {} (spread {}) volume {} at {}",
        t.price,
        t.bid,
        t.ask,
        t.spread(),
        t.volume,
        t.time.to_rfc3339()
    );
    Ok(())
}

async fn cmd_stats(client: &CoinbaseClient, product: &str) -> Result<()> {
    let s = client
        .get_stats(product)
        .await
        .with_context(|| format!("failed to fetch stats for {product}"))?;
    println!(
        "{product} 24h: open {} high {} low {} last {} ({}%) volume {}",
        s.open,
        s.high,
        s.low,
        s.last,
        fmt_opt(s.change_pct()),
        s.volume
    );
    Ok(())
}

fn print_candles(candles: &[Candle]) {
    for c in candles {
        println!(
            "{}  O {:>12}  H {:>12}  L {:>12}  C {:>12}  V {:>14}",
            c.timestamp.format("%Y-%m-%d %H:%M"),
            c.open,
            c.high,
            c.low,
            c.close,
            c.volume
        );
    }
}

async fn cmd_candles(
    client: &CoinbaseClient,
    product: &str,
    days: u32,
    granularity_secs: Option<u32>,
) -> Result<()> {
    let lookback = Duration::from_secs(u64::from(days) * 86_400);
    let g = match granularity_secs {
        Some(s) => granularity(s)?,
        None => Granularity::for_lookback(lookback),
    };
    let end = Utc::now();
    let start = end - chrono::Duration::days(i64::from(days));

    let candles = client
        .get_candles(product, start, end, g)
        .await
        .with_context(|| format!("failed to fetch candles for {product}"))?;

    print_candles(&candles);
    info!("{product}: {} candle(s) at {g}", candles.len());
    Ok(())
}

async fn cmd_sync(
    manager: &SyncManager<CoinbaseClient, Box<dyn CandleStore>>,
    products: &[String],
) -> Result<()> {
    let products: Vec<String> = products.iter().map(|p| p.to_uppercase()).collect();
    let mut failed = 0;

    for (product, result) in manager.sync_all(&products).await {
        match result {
            Ok(records) if records.is_empty() => info!("{product}: up to date"),
            Ok(records) => info!("{product}: wrote {} candle(s)", records.len()),
            Err(e) => {
                warn!("{product}: sync failed: {e}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} product(s) failed to sync", products.len());
    }
    Ok(())
}

/// One pass of the watch loop: sync, read the window back, summarize.
async fn watch_cycle<S: MarketDataSource, St: CandleStore>(
    manager: &SyncManager<S, St>,
    product: &str,
    days: u32,
) -> Result<()> {
    manager.sync(product).await?;

    let end = Utc::now();
    let start = end - chrono::Duration::days(i64::from(days));
    let window = manager
        .store()
        .read_range(product, start, end)
        .await
        .context("failed to read stored window")?;
    let ticker = manager
        .source()
        .get_ticker(product)
        .await
        .context("failed to fetch ticker")?;

    if window.is_empty() {
        info!("{product}: price {} (no stored candles yet)", ticker.price);
        return Ok(());
    }

    log_summary(product, &window, &ticker);
    Ok(())
}

fn log_summary(product: &str, window: &[Candle], ticker: &Ticker) {
    if let Some(line) = summary_line(product, window, ticker) {
        info!("{line}");
    }
}

/// Price and volume against the stored window, plus the latest indicators.
fn summary_line(product: &str, window: &[Candle], ticker: &Ticker) -> Option<String> {
    let frame = IndicatorFrame::compute(window);
    let latest = frame.latest()?;
    let last_candle = window.last()?;

    let price_change = pct_change(ticker.price, last_candle.open);
    let volume_change = mean(&volumes(window)).and_then(|avg| pct_change(ticker.volume, avg));

    Some(format!(
        "{product}: price {} ({}%) | volume {:.2} ({}% vs avg) | SMA20 {} | EMA20 {} | range {:.2} (avg {}) | {} candle(s)",
        ticker.price,
        fmt_opt(price_change),
        ticker.volume,
        fmt_opt(volume_change),
        fmt_opt(latest.sma20),
        fmt_opt(latest.ema20),
        latest.range,
        fmt_opt(latest.range_sma10),
        window.len()
    ))
}

async fn cmd_watch(
    manager: &SyncManager<CoinbaseClient, Box<dyn CandleStore>>,
    product: Option<String>,
    days: u32,
    schedule: PollSchedule,
) -> Result<()> {
    let product = match product {
        Some(p) => p.to_uppercase(),
        None => {
            let products = manager
                .source()
                .list_products()
                .await
                .context("failed to list products")?;
            let pairs = tradable_pairs(&products, "USD", 5);
            default_pair(&pairs)
                .context("no tradable USD pairs listed")?
                .to_string()
        }
    };

    info!(
        "Watching {product} every {:?} at {}",
        schedule.interval,
        manager.granularity()
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    watch_loop(manager, &product, days, schedule, shutdown).await
}

/// Run cycles until `shutdown` resolves, which also cancels a cycle in flight.
async fn watch_loop<S: MarketDataSource, St: CandleStore>(
    manager: &SyncManager<S, St>,
    product: &str,
    days: u32,
    schedule: PollSchedule,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    let mut backoff = Backoff::new(schedule);

    loop {
        let cycle = tokio::select! {
            result = watch_cycle(manager, product, days) => result,
            _ = &mut shutdown => {
                info!("Stopping");
                return Ok(());
            }
        };
        let outcome = match cycle {
            Ok(()) => PollOutcome::Success,
            Err(e) => {
                error!("Error updating {product}: {e:#}");
                PollOutcome::Failure
            }
        };
        let delay = backoff.next_delay(outcome);
        if outcome == PollOutcome::Failure {
            warn!(
                "Retrying in {delay:?} ({} consecutive failure(s))",
                backoff.consecutive_failures()
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => {
                info!("Stopping");
                return Ok(());
            }
        }
    }
}

async fn cmd_history(store: &dyn CandleStore, product: &str, days: u32, rows: usize) -> Result<()> {
    let end = Utc::now();
    let start = end - chrono::Duration::days(i64::from(days));
    let candles = store
        .read_range(product, start, end)
        .await
        .with_context(|| format!("failed to read {product} history"))?;

    if candles.is_empty() {
        println!("{product}: no stored candles in the last {days} day(s)");
        return Ok(());
    }

    let frame = IndicatorFrame::compute(&candles);
    println!(
        "{:<16} {:>12} {:>12} {:>12} {:>14} {:>14} {:>10} {:>10}",
        "time", "close", "SMA20", "EMA20", "volume", "volSMA20", "range", "rangeSMA10"
    );
    let skip = candles.len().saturating_sub(rows);
    for (i, c) in candles.iter().enumerate().skip(skip) {
        let Some(row) = frame.row(i) else { continue };
        println!(
            "{:<16} {:>12} {:>12} {:>12} {:>14} {:>14} {:>10.2} {:>10}",
            c.timestamp.format("%Y-%m-%d %H:%M"),
            c.close,
            fmt_opt(row.sma20),
            fmt_opt(row.ema20),
            c.volume,
            fmt_opt(row.volume_sma20),
            row.range,
            fmt_opt(row.range_sma10)
        );
    }
    Ok(())
}

fn cmd_status(store: &ParquetStore, product: Option<&str>) -> Result<()> {
    let products = match product {
        Some(p) => vec![p.to_uppercase()],
        None => store.list_products().context("failed to list products")?,
    };

    if products.is_empty() {
        println!("No data in store.");
        return Ok(());
    }

    for id in &products {
        let range = store
            .date_range(id)
            .with_context(|| format!("failed to list dates for {id}"))?;
        let Some((first, last)) = range else {
            println!("{id}: no data");
            continue;
        };
        let rows = store
            .count(id)
            .with_context(|| format!("failed to count rows for {id}"))?;
        println!("{id}: {rows} candle(s), {first} to {last}");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match &cli.command {
        Commands::Products {
            quote,
            min_listings,
            all,
        } => {
            let client = create_client(&cli)?;
            cmd_products(&client, quote, *min_listings, *all).await?;
        }
        Commands::Ticker { product } => {
            cmd_ticker(&create_client(&cli)?, &product.to_uppercase()).await?;
        }
        Commands::Stats { product } => {
            cmd_stats(&create_client(&cli)?, &product.to_uppercase()).await?;
        }
        Commands::Candles {
            product,
            days,
            granularity,
        } => {
            let client = create_client(&cli)?;
            cmd_candles(&client, &product.to_uppercase(), *days, *granularity).await?;
        }
        Commands::Sync {
            products,
            granularity: secs,
        } => {
            let manager = SyncManager::new(create_client(&cli)?, create_store(&cli)?)
                .with_granularity(granularity(*secs)?);
            cmd_sync(&manager, products).await?;
        }
        Commands::Watch {
            product,
            days,
            granularity: secs,
            interval,
            backoff,
            max_backoff,
        } => {
            let manager = SyncManager::new(create_client(&cli)?, create_store(&cli)?)
                .with_granularity(granularity(*secs)?);
            let schedule = PollSchedule {
                interval: Duration::from_secs(*interval),
                error_backoff: Duration::from_secs(*backoff),
                max_backoff: Duration::from_secs((*max_backoff).max(*backoff)),
            };
            cmd_watch(&manager, product.clone(), *days, schedule).await?;
        }
        Commands::History {
            product,
            days,
            rows,
        } => {
            let store = create_store(&cli)?;
            cmd_history(store.as_ref(), &product.to_uppercase(), *days, *rows).await?;
        }
        Commands::Status { product } => {
            if cli.store != StoreKind::Local {
                anyhow::bail!("status only inspects the local store");
            }
            let store = ParquetStore::new(&cli.data_dir);
            cmd_status(&store, product.as_deref())?;
        }
    }

    Ok(())
}
