//! Declarative filter pipeline over a contract universe.
//!
//! A pipeline is an ordered list of [`FilterStage`]s. Each stage receives the
//! candidates left by the previous stage and may only narrow them; custom
//! selectors are validated after every call so they cannot introduce symbols
//! they were not given.
//!
//! ```ignore
//! let pipeline = FilterPipeline::builder()
//!     .expiration_window(Duration::days(0), Duration::days(180))
//!     .select(Arc::new(LatestExpiryNearestStrike::puts()))
//!     .build()?;
//! let active = pipeline.apply(&universe, &FilterContext::new(root, now, Some(px)))?;
//! ```
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use crate::engine_core::errors::{EngineError, EngineResult};
use crate::securities::symbols::{OptionRight, Symbol, SymbolId};
use crate::universes::catalog::SelectorCatalog;

/// Per-call evaluation context. Built fresh for every `apply`, so nothing a
/// stage learns in one pass is visible in the next.
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub root: SymbolId,
    pub now: DateTime<Utc>,
    /// Authoritative underlying price supplied by the caller, if known.
    pub reference_price: Option<Decimal>,
}

impl FilterContext {
    pub fn new(root: SymbolId, now: DateTime<Utc>, reference_price: Option<Decimal>) -> Self {
        Self { root, now, reference_price }
    }

    pub fn require_price(&self) -> EngineResult<Decimal> {
        self.reference_price
            .ok_or_else(|| EngineError::MissingReferencePrice { root: self.root.clone() })
    }
}

/// A custom reduction over the current candidates.
///
/// Implementations must be pure: the same candidates and context give the
/// same answer, and no choice is remembered between calls. Returning a symbol
/// that is not among `candidates` is a contract error.
pub trait ContractSelector: Send + Sync {
    fn name(&self) -> &str;
    fn select(&self, candidates: &BTreeSet<Symbol>, ctx: &FilterContext) -> EngineResult<Vec<Symbol>>;
}

/// Adapter so plain closures can be used as selectors.
pub struct FnSelector<F> {
    name: String,
    f: F,
}

impl<F> FnSelector<F>
where
    F: Fn(&BTreeSet<Symbol>, &FilterContext) -> Vec<Symbol> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self { Self { name: name.into(), f } }
}

impl<F> ContractSelector for FnSelector<F>
where
    F: Fn(&BTreeSet<Symbol>, &FilterContext) -> Vec<Symbol> + Send + Sync,
{
    fn name(&self) -> &str { &self.name }
    fn select(&self, candidates: &BTreeSet<Symbol>, ctx: &FilterContext) -> EngineResult<Vec<Symbol>> {
        Ok((self.f)(candidates, ctx))
    }
}

#[derive(Clone)]
pub enum FilterStage {
    /// Keep contracts whose days-to-expiry (expiry date minus the date of
    /// `now`) lies in `[min, max]`. Symbols without an expiry are dropped.
    ExpirationWindow { min: Duration, max: Duration },
    /// Keep one option side.
    Rights(OptionRight),
    /// Keep strikes within `[price - below, price + above]`.
    StrikeBand { below: Decimal, above: Decimal },
    CustomSelect(Arc<dyn ContractSelector>),
}

impl fmt::Debug for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterStage::ExpirationWindow { min, max } => write!(f, "ExpirationWindow({}d..={}d)", min.num_days(), max.num_days()),
            FilterStage::Rights(r) => write!(f, "Rights({r})"),
            FilterStage::StrikeBand { below, above } => write!(f, "StrikeBand(-{below}/+{above})"),
            FilterStage::CustomSelect(s) => write!(f, "CustomSelect({})", s.name()),
        }
    }
}

impl FilterStage {
    /// Narrow `candidates`. Never returns a symbol absent from the input.
    pub fn narrow(&self, candidates: BTreeSet<Symbol>, ctx: &FilterContext) -> EngineResult<BTreeSet<Symbol>> {
        match self {
            FilterStage::ExpirationWindow { min, max } => {
                let today = ctx.now.date_naive();
                Ok(candidates
                    .into_iter()
                    .filter(|s| match s.expiry() {
                        Some(exp) => {
                            let dte = exp.signed_duration_since(today);
                            dte >= *min && dte <= *max
                        }
                        None => false,
                    })
                    .collect())
            }
            FilterStage::Rights(right) => Ok(candidates.into_iter().filter(|s| s.right() == *right).collect()),
            FilterStage::StrikeBand { below, above } => {
                let px = ctx.require_price()?;
                let (lo, hi) = (px - *below, px + *above);
                Ok(candidates
                    .into_iter()
                    .filter(|s| s.strike().is_some_and(|k| k >= lo && k <= hi))
                    .collect())
            }
            FilterStage::CustomSelect(selector) => {
                let picked = selector.select(&candidates, ctx)?;
                let mut out = BTreeSet::new();
                for s in picked {
                    if !candidates.contains(&s) {
                        return Err(EngineError::FabricatedSymbol {
                            root: ctx.root.clone(),
                            selector: selector.name().to_string(),
                            symbol: s.id().clone(),
                        });
                    }
                    out.insert(s);
                }
                Ok(out)
            }
        }
    }

    fn to_spec(&self) -> StageSpec {
        match self {
            FilterStage::ExpirationWindow { min, max } => StageSpec::ExpirationWindow { min_days: min.num_days(), max_days: max.num_days() },
            FilterStage::Rights(right) => StageSpec::Rights { right: *right },
            FilterStage::StrikeBand { below, above } => StageSpec::StrikeBand { below: *below, above: *above },
            FilterStage::CustomSelect(s) => StageSpec::Select { selector: s.name().to_string() },
        }
    }
}

/// Ordered, narrowing-only stages.
#[derive(Clone, Debug, Default)]
pub struct FilterPipeline {
    stages: Vec<FilterStage>,
}

impl FilterPipeline {
    pub fn builder() -> FilterPipelineBuilder { FilterPipelineBuilder::default() }

    /// Pipeline with no stages: the whole universe is active.
    pub fn pass_through() -> Self { Self::default() }

    #[inline]
    pub fn stages(&self) -> &[FilterStage] { &self.stages }

    /// Run every stage in order against a copy of `universe`.
    ///
    /// Idempotent: identical inputs give identical output, because stages are
    /// pure and the context is rebuilt by the caller on each pass.
    pub fn apply(&self, universe: &BTreeSet<Symbol>, ctx: &FilterContext) -> EngineResult<BTreeSet<Symbol>> {
        let mut current = universe.clone();
        for stage in &self.stages {
            if current.is_empty() { break; }
            let before = current.len();
            current = stage.narrow(current, ctx)?;
            debug_assert!(current.len() <= before, "stage {stage:?} widened the candidate set");
            tracing::trace!(root=%ctx.root, ?stage, before, after=current.len(), "filter stage");
        }
        Ok(current)
    }

    /// Declarative form, used by config files and snapshots.
    pub fn to_spec(&self) -> FilterSpec {
        FilterSpec { stages: self.stages.iter().map(FilterStage::to_spec).collect() }
    }
}

#[derive(Default)]
pub struct FilterPipelineBuilder {
    stages: Vec<FilterStage>,
}

impl FilterPipelineBuilder {
    pub fn expiration_window(mut self, min: Duration, max: Duration) -> Self {
        self.stages.push(FilterStage::ExpirationWindow { min, max });
        self
    }

    pub fn rights(mut self, right: OptionRight) -> Self {
        self.stages.push(FilterStage::Rights(right));
        self
    }

    pub fn puts_only(self) -> Self { self.rights(OptionRight::Put) }
    pub fn calls_only(self) -> Self { self.rights(OptionRight::Call) }

    pub fn strike_band(mut self, below: Decimal, above: Decimal) -> Self {
        self.stages.push(FilterStage::StrikeBand { below, above });
        self
    }

    pub fn select(mut self, selector: Arc<dyn ContractSelector>) -> Self {
        self.stages.push(FilterStage::CustomSelect(selector));
        self
    }

    pub fn select_fn<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&BTreeSet<Symbol>, &FilterContext) -> Vec<Symbol> + Send + Sync + 'static,
    {
        self.select(Arc::new(FnSelector::new(name, f)))
    }

    pub fn build(self) -> EngineResult<FilterPipeline> {
        for stage in &self.stages {
            match stage {
                FilterStage::ExpirationWindow { min, max } if min > max => {
                    return Err(EngineError::Config(format!(
                        "expiration window min {}d exceeds max {}d", min.num_days(), max.num_days()
                    )));
                }
                FilterStage::StrikeBand { below, above } if below.is_sign_negative() || above.is_sign_negative() => {
                    return Err(EngineError::Config(format!("strike band -{below}/+{above} must be non-negative")));
                }
                FilterStage::Rights(OptionRight::None) => {
                    return Err(EngineError::Config("rights stage needs Call or Put".into()));
                }
                _ => {}
            }
        }
        Ok(FilterPipeline { stages: self.stages })
    }
}

/// Serializable stage description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageSpec {
    ExpirationWindow { min_days: i64, max_days: i64 },
    Rights { right: OptionRight },
    StrikeBand { below: Decimal, above: Decimal },
    Select { selector: String },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

impl FilterSpec {
    /// Build a pipeline, resolving named selectors through `catalog`.
    pub fn build(&self, catalog: &SelectorCatalog) -> EngineResult<FilterPipeline> {
        let mut b = FilterPipeline::builder();
        for stage in &self.stages {
            b = match stage {
                StageSpec::ExpirationWindow { min_days, max_days } => b.expiration_window(window_days(*min_days)?, window_days(*max_days)?),
                StageSpec::Rights { right } => b.rights(*right),
                StageSpec::StrikeBand { below, above } => b.strike_band(*below, *above),
                StageSpec::Select { selector } => b.select(catalog.get(selector)?),
            };
        }
        b.build()
    }
}

fn window_days(days: i64) -> EngineResult<Duration> {
    Duration::try_days(days)
        .ok_or_else(|| EngineError::Config(format!("expiration window of {days} days is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;
    use crate::universes::inbuilt::latest_expiry::LatestExpiryNearestStrike;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, day).unwrap() }

    fn put(root: &str, strike: Decimal, exp: NaiveDate) -> Symbol {
        Symbol::option(&SymbolId::from(root), OptionRight::Put, strike, exp).unwrap()
    }

    fn call(root: &str, strike: Decimal, exp: NaiveDate) -> Symbol {
        Symbol::option(&SymbolId::from(root), OptionRight::Call, strike, exp).unwrap()
    }

    fn ctx(px: Option<Decimal>) -> FilterContext {
        FilterContext::new(SymbolId::from("AAPL"), Utc.with_ymd_and_hms(2014, 6, 5, 14, 0, 0).unwrap(), px)
    }

    #[test]
    fn expiration_window_is_inclusive_and_drops_undated() {
        let universe: BTreeSet<Symbol> = [
            put("AAPL", dec!(100), d(2014, 6, 5)),   // 0 days
            put("AAPL", dec!(100), d(2014, 6, 15)),  // 10 days
            put("AAPL", dec!(100), d(2014, 6, 16)),  // 11 days
            Symbol::equity("AAPL"),
        ].into_iter().collect();
        let p = FilterPipeline::builder()
            .expiration_window(Duration::days(0), Duration::days(10))
            .build()
            .unwrap();
        let out = p.apply(&universe, &ctx(None)).unwrap();
        let exps: Vec<_> = out.iter().filter_map(|s| s.expiry()).collect();
        assert_eq!(exps, vec![d(2014, 6, 5), d(2014, 6, 15)]);
    }

    #[test]
    fn later_expiration_wins_outright() {
        let universe: BTreeSet<Symbol> = [
            put("AAPL", dec!(100), d(2014, 6, 20)),
            put("AAPL", dec!(105), d(2014, 6, 20)),
            put("AAPL", dec!(100), d(2014, 7, 18)),
        ].into_iter().collect();
        let p = FilterPipeline::builder()
            .select(Arc::new(LatestExpiryNearestStrike::puts()))
            .build()
            .unwrap();
        let out = p.apply(&universe, &ctx(Some(dec!(101)))).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.iter().next().unwrap().expiry(), Some(d(2014, 7, 18)));
    }

    #[test]
    fn stages_run_in_order() {
        // Window first removes the July put, so the selector never sees it.
        let universe: BTreeSet<Symbol> = [
            put("AAPL", dec!(100), d(2014, 6, 20)),
            put("AAPL", dec!(105), d(2014, 6, 20)),
            put("AAPL", dec!(100), d(2014, 7, 18)),
        ].into_iter().collect();
        let p = FilterPipeline::builder()
            .expiration_window(Duration::days(0), Duration::days(20))
            .select(Arc::new(LatestExpiryNearestStrike::puts()))
            .build()
            .unwrap();
        let out = p.apply(&universe, &ctx(Some(dec!(104)))).unwrap();
        let only = out.iter().next().unwrap();
        assert_eq!(only.strike(), Some(dec!(105)));
        assert_eq!(only.expiry(), Some(d(2014, 6, 20)));
    }

    #[test]
    fn fabricated_symbols_are_rejected() {
        let universe: BTreeSet<Symbol> = [put("AAPL", dec!(100), d(2014, 6, 20))].into_iter().collect();
        let p = FilterPipeline::builder()
            .select_fn("inventor", |_, _| vec![call("AAPL", dec!(1), d(2015, 1, 17))])
            .build()
            .unwrap();
        let err = p.apply(&universe, &ctx(None)).unwrap_err();
        assert!(matches!(err, EngineError::FabricatedSymbol { ref selector, .. } if selector == "inventor"));
        assert!(err.is_contract_error());
    }

    #[test]
    fn strike_band_needs_a_price() {
        let universe: BTreeSet<Symbol> = [
            put("AAPL", dec!(90), d(2014, 6, 20)),
            put("AAPL", dec!(100), d(2014, 6, 20)),
            put("AAPL", dec!(120), d(2014, 6, 20)),
        ].into_iter().collect();
        let p = FilterPipeline::builder().strike_band(dec!(5), dec!(10)).build().unwrap();
        assert!(matches!(p.apply(&universe, &ctx(None)), Err(EngineError::MissingReferencePrice { .. })));
        let out = p.apply(&universe, &ctx(Some(dec!(95)))).unwrap();
        let strikes: Vec<_> = out.iter().filter_map(|s| s.strike()).collect();
        assert_eq!(strikes, vec![dec!(90), dec!(100)]);
    }

    #[test]
    fn builder_rejects_inverted_window() {
        let err = FilterPipeline::builder()
            .expiration_window(Duration::days(30), Duration::days(10))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn spec_with_unrepresentable_window_fails_to_build() {
        let catalog = SelectorCatalog::with_defaults();
        for (min_days, max_days) in [(0, i64::MAX), (i64::MIN, 0)] {
            let spec = FilterSpec { stages: vec![StageSpec::ExpirationWindow { min_days, max_days }] };
            assert!(matches!(spec.build(&catalog), Err(EngineError::Config(_))));
        }
    }

    #[test]
    fn spec_round_trips_through_catalog() {
        let catalog = SelectorCatalog::with_defaults();
        let p = FilterPipeline::builder()
            .expiration_window(Duration::days(0), Duration::days(180))
            .puts_only()
            .select(catalog.get("latest_expiry_nearest_put").unwrap())
            .build()
            .unwrap();
        let spec = p.to_spec();
        let json = serde_json::to_string(&spec).unwrap();
        let back: FilterSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert_eq!(back.build(&catalog).unwrap().to_spec(), spec);
    }
}
