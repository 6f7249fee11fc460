// ===============================
// src/price_hub.rs (latest price per symbol, merged from all feeds)
// ===============================
//
// Setiap feed menulis ke sini secara independen; tick loop hanya membaca
// lewat snapshot(). Update dengan timestamp lama (reconnect, replay) diabaikan
// supaya harga tidak mundur.
//
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;

use crate::domain::{PriceQuote, PriceSnapshot};
use crate::metrics::PRICE_UPDATES;

#[derive(Debug, Default)]
pub struct PriceHub {
    quotes: RwLock<HashMap<String, PriceQuote>>,
}

impl PriceHub {
    pub fn new() -> Self { Self::default() }

    /// Stores `price` for `symbol` if `observed_at_ns` is newer than what we hold.
    /// Returns false for stale or duplicate-time events.
    pub fn update(&self, symbol: &str, price: f64, observed_at_ns: i128) -> bool {
        let mut quotes = self.quotes.write();
        match quotes.get_mut(symbol) {
            Some(q) if q.observed_at_ns >= observed_at_ns => false,
            Some(q) => {
                *q = PriceQuote { price, observed_at_ns };
                PRICE_UPDATES.with_label_values(&[symbol]).inc();
                true
            }
            None => {
                quotes.insert(symbol.to_string(), PriceQuote { price, observed_at_ns });
                PRICE_UPDATES.with_label_values(&[symbol]).inc();
                true
            }
        }
    }

    pub fn snapshot(&self) -> PriceSnapshot {
        let quotes = self.quotes.read();
        PriceSnapshot::from_quotes(quotes.iter().map(|(s, q)| (s.clone(), *q)).collect())
    }

    pub fn len(&self) -> usize { self.quotes.read().len() }
}
