use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A tradable pair as listed by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub status: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Product {
    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }
}

/// Latest trade snapshot for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub price: Decimal,
    pub volume: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
}

impl Ticker {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// Rolling 24h aggregate for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub last: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub volume_30day: Option<Decimal>,
}

impl Stats {
    /// Percent change from the 24h open to the last trade, or `None` when
    /// the open is zero.
    pub fn change_pct(&self) -> Option<Decimal> {
        if self.open.is_zero() {
            return None;
        }
        Some((self.last - self.open) / self.open * Decimal::ONE_HUNDRED)
    }
}

/// Sorted ids of online products quoted in `quote` whose base currency is
/// listed in at least `min_listings` products overall.
pub fn tradable_pairs(products: &[Product], quote: &str, min_listings: usize) -> Vec<String> {
    let mut listings: HashMap<&str, usize> = HashMap::new();
    for p in products {
        *listings.entry(p.base_currency.as_str()).or_default() += 1;
    }

    let mut pairs: Vec<String> = products
        .iter()
        .filter(|p| p.is_online())
        .filter(|p| p.quote_currency.eq_ignore_ascii_case(quote))
        .filter(|p| listings.get(p.base_currency.as_str()).copied().unwrap_or(0) >= min_listings)
        .map(|p| p.id.clone())
        .collect();
    pairs.sort();
    pairs
}

/// `BTC-USD` if present, else the first pair.
pub fn default_pair(pairs: &[String]) -> Option<&str> {
    pairs
        .iter()
        .find(|p| p.as_str() == "BTC-USD")
        .or_else(|| pairs.first())
        .map(|p| p.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn product(id: &str, status: &str) -> Product {
        let (base, quote) = id.split_once('-').unwrap();
        Product {
            id: id.to_string(),
            base_currency: base.to_string(),
            quote_currency: quote.to_string(),
            status: status.to_string(),
            display_name: None,
        }
    }

    fn listing() -> Vec<Product> {
        let mut products = Vec::new();
        for quote in ["USD", "EUR", "GBP", "USDT", "USDC"] {
            products.push(product(&format!("BTC-{quote}"), "online"));
            products.push(product(&format!("ETH-{quote}"), "online"));
        }
        products.push(product("DOGE-USD", "online"));
        products.push(product("DOGE-EUR", "online"));
        products
    }

    #[test]
    fn tradable_pairs_requires_enough_listings() {
        let pairs = tradable_pairs(&listing(), "USD", 5);
        assert_eq!(pairs, vec!["BTC-USD", "ETH-USD"]);
    }

    #[test]
    fn tradable_pairs_skips_offline() {
        let mut products = listing();
        for p in products.iter_mut().filter(|p| p.id == "ETH-USD") {
            p.status = "delisted".to_string();
        }
        assert_eq!(tradable_pairs(&products, "USD", 5), vec!["BTC-USD"]);
    }

    #[test]
    fn tradable_pairs_with_no_minimum() {
        let pairs = tradable_pairs(&listing(), "usd", 0);
        assert_eq!(pairs, vec!["BTC-USD", "DOGE-USD", "ETH-USD"]);
    }

    #[test]
    fn default_pair_prefers_btc() {
        let pairs = vec!["ADA-USD".to_string(), "BTC-USD".to_string()];
        assert_eq!(default_pair(&pairs), Some("BTC-USD"));

        let pairs = vec!["ADA-USD".to_string(), "ETH-USD".to_string()];
        assert_eq!(default_pair(&pairs), Some("ADA-USD"));

        assert_eq!(default_pair(&[]), None);
    }

    #[test]
    fn parse_product_json() {
        let json = r#"{
            "id": "BTC-USD",
            "base_currency": "BTC",
            "quote_currency": "USD",
            "quote_increment": "0.01",
            "display_name": "BTC/USD",
            "status": "online",
            "trading_disabled": false
        }"#;
        let p: Product = serde_json::from_str(json).unwrap();
        assert_eq!(p.id, "BTC-USD");
        assert!(p.is_online());
        assert_eq!(p.display_name.as_deref(), Some("BTC/USD"));
    }

    #[test]
    fn parse_ticker_json() {
        let json = r#"{
            "ask": "84377.13",
            "bid": "84377.12",
            "volume": "9823.41129318",
            "trade_id": 791823001,
            "price": "84377.12",
            "size": "0.0012",
            "time": "2025-03-01T00:22:57.833897Z"
        }"#;
        let t: Ticker = serde_json::from_str(json).unwrap();
        assert_eq!(t.price, dec!(84377.12));
        assert_eq!(t.spread(), dec!(0.01));
        assert_eq!(t.time.timestamp(), 1740788577);
    }

    #[test]
    fn parse_stats_json() {
        let json = r#"{
            "open": "80000.00",
            "high": "85000.00",
            "low": "79000.00",
            "last": "84000.00",
            "volume": "10000.5",
            "volume_30day": "310000.25"
        }"#;
        let s: Stats = serde_json::from_str(json).unwrap();
        assert_eq!(s.change_pct(), Some(dec!(5)));
        assert_eq!(s.volume_30day, Some(dec!(310000.25)));
    }

    #[test]
    fn change_pct_zero_open() {
        let s = Stats {
            open: Decimal::ZERO,
            high: dec!(1),
            low: Decimal::ZERO,
            last: dec!(1),
            volume: dec!(1),
            volume_30day: None,
        };
        assert_eq!(s.change_pct(), None);
    }
}
