//! Latest-expiry, nearest-strike selector
//!
//! Picks one contract of a given right from the remaining candidates:
//! 1. the **latest** expiration date wins outright;
//! 2. among contracts sharing it, the strike **closest** to the reference
//!    price wins;
//! 3. a remaining tie goes to the lowest symbol id.
//!
//! The reference price is only consulted when step 2 actually has to break a
//! tie, so a chain with a single contract at the latest expiry can be
//! selected before any price has been seen.
//!
//! Strategy wiring:
//!   let pipeline = FilterPipeline::builder()
//!       .expiration_window(Duration::days(0), Duration::days(180))
//!       .select(Arc::new(LatestExpiryNearestStrike::puts()))
//!       .build()?;

use std::collections::BTreeSet;
use crate::engine_core::errors::EngineResult;
use crate::securities::symbols::{OptionRight, Symbol};
use crate::universes::filters::{ContractSelector, FilterContext};

#[derive(Clone, Debug)]
pub struct LatestExpiryNearestStrike {
    right: OptionRight,
    name: &'static str,
}

impl LatestExpiryNearestStrike {
    pub fn puts() -> Self { Self { right: OptionRight::Put, name: "latest_expiry_nearest_put" } }
    pub fn calls() -> Self { Self { right: OptionRight::Call, name: "latest_expiry_nearest_call" } }

    /// Override the catalog name (useful if you register several variants).
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }
}

impl ContractSelector for LatestExpiryNearestStrike {
    fn name(&self) -> &str { self.name }

    fn select(&self, candidates: &BTreeSet<Symbol>, ctx: &FilterContext) -> EngineResult<Vec<Symbol>> {
        let eligible: Vec<&Symbol> = candidates
            .iter()
            .filter(|s| s.right() == self.right && s.expiry().is_some() && s.strike().is_some())
            .collect();

        let Some(latest) = eligible.iter().filter_map(|s| s.expiry()).max() else {
            return Ok(Vec::new());
        };

        // BTreeSet iteration is id-ordered, so `tied` is too
        let tied: Vec<&Symbol> = eligible.into_iter().filter(|s| s.expiry() == Some(latest)).collect();
        if tied.len() == 1 {
            return Ok(vec![tied[0].clone()]);
        }

        let px = ctx.require_price()?;
        let best = tied
            .into_iter()
            .min_by(|a, b| {
                let da = (px - a.strike().unwrap_or_default()).abs();
                let db = (px - b.strike().unwrap_or_default()).abs();
                da.cmp(&db).then_with(|| a.id().cmp(b.id()))
            });
        Ok(best.into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use crate::engine_core::errors::EngineError;
    use crate::securities::symbols::SymbolId;

    fn opt(right: OptionRight, strike: Decimal, m: u32, day: u32) -> Symbol {
        Symbol::option(&SymbolId::from("AAPL"), right, strike, NaiveDate::from_ymd_opt(2014, m, day).unwrap()).unwrap()
    }

    fn ctx(px: Option<Decimal>) -> FilterContext {
        FilterContext::new(SymbolId::from("AAPL"), Utc.with_ymd_and_hms(2014, 6, 5, 14, 0, 0).unwrap(), px)
    }

    #[test]
    fn nearest_strike_breaks_expiry_ties() {
        let set: BTreeSet<Symbol> = [
            opt(OptionRight::Put, dec!(95), 6, 20),
            opt(OptionRight::Put, dec!(100), 6, 20),
            opt(OptionRight::Put, dec!(110), 6, 20),
        ].into_iter().collect();
        let out = LatestExpiryNearestStrike::puts().select(&set, &ctx(Some(dec!(101)))).unwrap();
        assert_eq!(out[0].strike(), Some(dec!(100)));
    }

    #[test]
    fn equal_distance_goes_to_lowest_id() {
        let set: BTreeSet<Symbol> = [
            opt(OptionRight::Put, dec!(100), 6, 20),
            opt(OptionRight::Put, dec!(102), 6, 20),
        ].into_iter().collect();
        let sel = LatestExpiryNearestStrike::puts();
        let first = sel.select(&set, &ctx(Some(dec!(101)))).unwrap();
        let again = sel.select(&set, &ctx(Some(dec!(101)))).unwrap();
        assert_eq!(first, again);
        assert_eq!(first[0].strike(), Some(dec!(100)));
    }

    #[test]
    fn ignores_the_other_right_and_needs_price_only_for_ties() {
        let set: BTreeSet<Symbol> = [
            opt(OptionRight::Call, dec!(100), 9, 19),
            opt(OptionRight::Put, dec!(100), 6, 20),
            opt(OptionRight::Put, dec!(105), 6, 20),
        ].into_iter().collect();
        let sel = LatestExpiryNearestStrike::puts();
        assert!(matches!(sel.select(&set, &ctx(None)), Err(EngineError::MissingReferencePrice { .. })));

        let single: BTreeSet<Symbol> = [opt(OptionRight::Put, dec!(100), 7, 18)].into_iter().collect();
        assert_eq!(sel.select(&single, &ctx(None)).unwrap().len(), 1);

        let calls_only: BTreeSet<Symbol> = [opt(OptionRight::Call, dec!(100), 9, 19)].into_iter().collect();
        assert!(sel.select(&calls_only, &ctx(None)).unwrap().is_empty());
    }
}
