use std::collections::BTreeSet;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use universe_lib::market_data::base_data::{DataBatch, MarketPayload, Side, Tick};
use universe_lib::securities::symbols::{Symbol, SymbolId};

/// Deterministic replay source for the demo: a saw-tooth price path per root
/// plus one option print per root on every other step.
pub struct SyntheticFeed {
    roots: Vec<(Symbol, Decimal)>,
    step: u32,
}

impl SyntheticFeed {
    pub fn new<I: IntoIterator<Item = (&'static str, Decimal)>>(roots: I) -> Self {
        Self {
            roots: roots.into_iter().map(|(t, px)| (Symbol::equity(t), px)).collect(),
            step: 0,
        }
    }

    /// Price of `root` at the current step.
    pub fn price(&self, root: &SymbolId) -> Option<Decimal> {
        self.roots
            .iter()
            .find(|(s, _)| s.id() == root)
            .map(|(_, base)| *base + Decimal::from((self.step % 12) as i64 - 6) * dec!(0.75))
    }

    /// Build the next batch. `held` are the currently active contracts; the
    /// first of each root gets a print on even steps.
    pub fn next_batch(&mut self, time: DateTime<Utc>, held: &BTreeSet<Symbol>) -> DataBatch {
        self.step += 1;
        let mut batch = DataBatch::new(time);
        for (equity, _) in &self.roots {
            let Some(price) = self.price(equity.id()) else { continue };
            batch.insert(equity.clone(), MarketPayload::Tick(Tick { price, size: dec!(100), time, side: Side::None }));
            if self.step % 2 == 0 {
                if let Some(contract) = held.iter().find(|s| s.is_linked_to(equity.id())) {
                    batch.insert(contract.clone(), MarketPayload::Tick(Tick { price: dec!(1.25), size: dec!(1), time, side: Side::Buy }));
                }
            }
        }
        batch
    }
}
