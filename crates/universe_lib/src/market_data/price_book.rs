use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use crate::market_data::base_data::DataBatch;
use crate::securities::symbols::SymbolId;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PricePoint {
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

/// Last known underlying price per root, fed to filter stages as the
/// reference price.
///
/// Only equities/indices (symbols without an underlying) update the book, so
/// option prints never masquerade as the root's price. An older observation
/// never overwrites a newer one.
#[derive(Default)]
pub struct PriceBook {
    prices: RwLock<AHashMap<SymbolId, PricePoint>>,
}

impl PriceBook {
    pub fn new() -> Self { Self::default() }

    /// Explicit caller-supplied price; always wins over older batch data.
    pub fn set(&self, root: &SymbolId, price: Decimal, time: DateTime<Utc>) {
        self.prices.write().insert(root.clone(), PricePoint { price, time });
    }

    /// Record the last trade or bar close of every underlying in `batch`.
    /// Returns how many roots were updated.
    pub fn record_batch(&self, batch: &DataBatch) -> usize {
        let mut w = self.prices.write();
        let mut updated = 0;
        for (symbol, payload) in batch.iter() {
            if symbol.has_underlying() { continue; }
            let Some(price) = payload.last_price() else { continue };
            let newer = w.get(symbol.id()).map_or(true, |p| p.time <= batch.time);
            if newer {
                w.insert(symbol.id().clone(), PricePoint { price, time: batch.time });
                updated += 1;
            }
        }
        updated
    }

    pub fn get(&self, root: &SymbolId) -> Option<Decimal> {
        self.prices.read().get(root).map(|p| p.price)
    }

    pub fn point(&self, root: &SymbolId) -> Option<PricePoint> {
        self.prices.read().get(root).copied()
    }

    /// Sorted copy, for snapshots.
    pub fn entries(&self) -> Vec<(SymbolId, PricePoint)> {
        let mut all: Vec<_> = self.prices.read().iter().map(|(k, v)| (k.clone(), *v)).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
