//! Last-price feed
//!
//! Reference prices for pre-lock estimates (market buys, trailing stops).
//! Never authoritative: the engine matches against its own last price.

use parking_lot::RwLock;
use std::collections::HashMap;

pub trait PriceFeed: Send + Sync {
    fn last_price(&self, market_id: &str) -> Option<u64>;
}

/// Last trade price per market, fed by the dispatcher
#[derive(Default)]
pub struct LastPriceCache {
    prices: RwLock<HashMap<String, u64>>,
}

impl LastPriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, market_id: &str, price: u64) {
        if price == 0 {
            return;
        }
        self.prices.write().insert(market_id.to_string(), price);
    }
}

impl PriceFeed for LastPriceCache {
    fn last_price(&self, market_id: &str) -> Option<u64> {
        self.prices.read().get(market_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_price_updates() {
        let feed = LastPriceCache::new();
        assert_eq!(feed.last_price("btcusdt"), None);

        feed.update("btcusdt", 3_000_000);
        feed.update("btcusdt", 0);
        assert_eq!(feed.last_price("btcusdt"), Some(3_000_000));

        feed.update("btcusdt", 2_990_000);
        assert_eq!(feed.last_price("btcusdt"), Some(2_990_000));
        assert_eq!(feed.last_price("ethusdt"), None);
    }
}
