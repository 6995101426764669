use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use crate::securities::symbols::{third_friday, OptionRight, Symbol, SymbolId};
use crate::universes::models::ContractUniverseProvider;

/// A provider that always lists a fixed set of contracts per root.
///
/// Contracts are delisted once their expiry date is before `asof`.
#[derive(Default)]
pub struct StaticChainProvider {
    chains: RwLock<AHashMap<SymbolId, Vec<Symbol>>>,
}

impl StaticChainProvider {
    pub fn new() -> Self { Self::default() }

    /// Add contracts to `root`'s chain. Symbols not linked to `root` are skipped.
    pub fn with_chain<I: IntoIterator<Item = Symbol>>(self, root: &SymbolId, contracts: I) -> Self {
        self.list(root, contracts);
        self
    }

    pub fn list<I: IntoIterator<Item = Symbol>>(&self, root: &SymbolId, contracts: I) {
        let mut w = self.chains.write();
        let chain = w.entry(root.clone()).or_default();
        for c in contracts {
            if !c.is_linked_to(root) {
                tracing::warn!(%root, symbol=%c, "contract not linked to root, skipped");
                continue;
            }
            if !chain.contains(&c) { chain.push(c); }
        }
    }

    /// Remove a contract from listing (e.g. an early delisting).
    pub fn delist(&self, root: &SymbolId, id: &SymbolId) {
        if let Some(chain) = self.chains.write().get_mut(root) {
            chain.retain(|c| c.id() != id);
        }
    }
}

#[async_trait]
impl ContractUniverseProvider for StaticChainProvider {
    fn name(&self) -> &str { "StaticChain" }

    async fn contracts(&self, root: &SymbolId, asof: DateTime<Utc>) -> anyhow::Result<Vec<Symbol>> {
        let today = asof.date_naive();
        Ok(self.chains
            .read()
            .get(root)
            .map(|chain| {
                chain.iter()
                    .filter(|c| c.expiry().map_or(true, |e| e >= today))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Synthesises standard monthly chains: third-Friday expiries for the
/// current month and the next `months` months (passed ones skipped), calls
/// and puts at `strike_step` intervals within `strikes_each_side` steps of
/// the root's spot.
///
/// Spots are set with [`MonthlyChainProvider::set_spot`]; a root without a
/// spot lists nothing.
pub struct MonthlyChainProvider {
    months: u32,
    strike_step: Decimal,
    strikes_each_side: u32,
    spots: RwLock<AHashMap<SymbolId, Decimal>>,
}

impl MonthlyChainProvider {
    pub fn new(months: u32, strike_step: Decimal, strikes_each_side: u32) -> Self {
        Self { months, strike_step, strikes_each_side, spots: RwLock::new(AHashMap::new()) }
    }

    pub fn set_spot(&self, root: &SymbolId, spot: Decimal) {
        self.spots.write().insert(root.clone(), spot);
    }

    fn expiries(&self, asof: DateTime<Utc>) -> Vec<chrono::NaiveDate> {
        let today = asof.date_naive();
        let Some(first_of_month) = today.with_day(1) else { return Vec::new() };
        (0..=self.months)
            .filter_map(|n| first_of_month.checked_add_months(Months::new(n)))
            .filter_map(|m| third_friday(m.year(), m.month()))
            .filter(|e| *e >= today)
            .collect()
    }
}

#[async_trait]
impl ContractUniverseProvider for MonthlyChainProvider {
    fn name(&self) -> &str { "MonthlyChain" }

    async fn contracts(&self, root: &SymbolId, asof: DateTime<Utc>) -> anyhow::Result<Vec<Symbol>> {
        let Some(spot) = self.spots.read().get(root).copied() else {
            return Ok(Vec::new());
        };
        if self.strike_step <= Decimal::ZERO {
            anyhow::bail!("strike step must be positive, got {}", self.strike_step);
        }
        let atm = (spot / self.strike_step).round() * self.strike_step;

        let mut out = Vec::new();
        for exp in self.expiries(asof) {
            for i in -(self.strikes_each_side as i64)..=(self.strikes_each_side as i64) {
                let strike = atm + self.strike_step * Decimal::from(i);
                if strike <= Decimal::ZERO { continue; }
                for right in [OptionRight::Call, OptionRight::Put] {
                    out.push(Symbol::option(root, right, strike, exp)?);
                }
            }
        }
        Ok(out)
    }
}
