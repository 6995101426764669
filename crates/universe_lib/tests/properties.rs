//! Property-based tests for the filter pipeline, change sets and scheduler,
//! using `proptest` for input generation.

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use universe_lib::engine_core::scheduler::{ScheduleKey, Scheduler, UniverseAction};
use universe_lib::securities::market_hours::MarketHours;
use universe_lib::securities::symbols::{OptionRight, Symbol, SymbolId};
use universe_lib::universes::filters::{FilterContext, FilterPipeline};
use universe_lib::universes::inbuilt::latest_expiry::LatestExpiryNearestStrike;
use universe_lib::universes::models::SecurityChangeSet;

// =============================================================================
// Generators
// =============================================================================

fn base_date() -> NaiveDate { NaiveDate::from_ymd_opt(2014, 6, 5).unwrap() }

fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2014, 6, 5, 14, 0, 0).unwrap() }

/// A contract on AAPL expiring 0..400 days out, strikes 50..150 in 2.5 steps.
fn arb_contract() -> impl Strategy<Value = Symbol> {
    (prop_oneof![Just(OptionRight::Call), Just(OptionRight::Put)], 20u32..60, 0i64..400).prop_map(|(right, k, days)| {
        let strike = Decimal::new(k as i64 * 25, 1);
        Symbol::option(&SymbolId::from("AAPL"), right, strike, base_date() + Duration::days(days)).unwrap()
    })
}

fn arb_universe() -> impl Strategy<Value = BTreeSet<Symbol>> {
    proptest::collection::btree_set(arb_contract(), 0..40)
}

/// A pipeline built from a random subset of the stage kinds, in random order.
fn arb_pipeline() -> impl Strategy<Value = FilterPipeline> {
    (
        proptest::option::of((0i64..200, 0i64..200)),
        proptest::option::of(prop_oneof![Just(OptionRight::Call), Just(OptionRight::Put)]),
        proptest::option::of((0u32..50, 0u32..50)),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(window, right, band, select, window_last)| {
            let mut b = FilterPipeline::builder();
            let add_window = |b: universe_lib::universes::filters::FilterPipelineBuilder| match window {
                Some((a, z)) => b.expiration_window(Duration::days(a.min(z)), Duration::days(a.max(z))),
                None => b,
            };
            if !window_last { b = add_window(b); }
            if let Some(r) = right { b = b.rights(r); }
            if let Some((below, above)) = band { b = b.strike_band(Decimal::from(below), Decimal::from(above)); }
            if window_last { b = add_window(b); }
            if select { b = b.select(Arc::new(LatestExpiryNearestStrike::puts())); }
            b.build().unwrap()
        })
}

fn arb_price() -> impl Strategy<Value = Decimal> {
    (4000i64..16000).prop_map(|c| Decimal::new(c, 2))
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every stage only narrows: the output is a subset of the universe.
    #[test]
    fn prop_pipeline_output_is_subset(universe in arb_universe(), pipeline in arb_pipeline(), px in arb_price()) {
        let ctx = FilterContext::new(SymbolId::from("AAPL"), t0(), Some(px));
        let out = pipeline.apply(&universe, &ctx).unwrap();
        prop_assert!(out.is_subset(&universe));
    }

    /// Same universe, time and price give the same result.
    #[test]
    fn prop_pipeline_is_idempotent(universe in arb_universe(), pipeline in arb_pipeline(), px in arb_price()) {
        let ctx = FilterContext::new(SymbolId::from("AAPL"), t0(), Some(px));
        let first = pipeline.apply(&universe, &ctx).unwrap();
        let second = pipeline.apply(&universe, &FilterContext::new(SymbolId::from("AAPL"), t0(), Some(px))).unwrap();
        prop_assert_eq!(first, second);
    }

    /// The canonical selector yields at most one put, at the latest put expiry.
    #[test]
    fn prop_selector_picks_latest_put(universe in arb_universe(), px in arb_price()) {
        let pipeline = FilterPipeline::builder()
            .select(Arc::new(LatestExpiryNearestStrike::puts()))
            .build()
            .unwrap();
        let out = pipeline.apply(&universe, &FilterContext::new(SymbolId::from("AAPL"), t0(), Some(px))).unwrap();
        let latest_put = universe.iter().filter(|s| s.right() == OptionRight::Put).filter_map(|s| s.expiry()).max();
        prop_assert!(out.len() <= 1);
        prop_assert_eq!(out.iter().next().and_then(|s| s.expiry()), latest_put);
    }

    /// Diffs never list a symbol on both sides, and applying them reproduces the next set.
    #[test]
    fn prop_change_set_is_disjoint_and_exact(last in arb_universe(), next in arb_universe()) {
        let diff = SecurityChangeSet::between(&last, &next);
        prop_assert!(diff.added.is_disjoint(&diff.removed));
        let mut rebuilt: BTreeSet<Symbol> = last.difference(&diff.removed).cloned().collect();
        rebuilt.extend(diff.added.iter().cloned());
        prop_assert_eq!(rebuilt, next);
    }

    /// Each registered action fires exactly once, in instant order, however
    /// the ticks are spaced or repeated.
    #[test]
    fn prop_scheduler_fires_exactly_once(
        offsets in proptest::collection::vec(0i64..10_000, 1..30),
        mut ticks in proptest::collection::vec(0i64..12_000, 1..40),
    ) {
        let mut scheduler = Scheduler::new(MarketHours::always_open(chrono_tz::UTC));
        let mut registered: Vec<(DateTime<Utc>, ScheduleKey)> = Vec::new();
        for (i, off) in offsets.iter().enumerate() {
            let at = t0() + Duration::seconds(*off);
            let root = SymbolId::new(format!("R{i}"));
            let key = scheduler.schedule_at(at, UniverseAction::RemoveUniverse { root }).unwrap();
            registered.push((at, key));
        }

        ticks.sort();
        ticks.push(12_000); // final sweep past every instant
        let mut fired: Vec<(DateTime<Utc>, ScheduleKey)> = Vec::new();
        for t in ticks {
            let now = t0() + Duration::seconds(t);
            for a in scheduler.tick(now) {
                prop_assert!(a.at <= now);
                fired.push((a.at, a.key));
            }
            // repeating the same instant never replays anything
            prop_assert!(scheduler.tick(now).is_empty());
        }

        prop_assert!(fired.windows(2).all(|w| w[0].0 <= w[1].0));
        let fired_keys: BTreeSet<_> = fired.iter().map(|(_, k)| *k).collect();
        prop_assert_eq!(fired_keys.len(), fired.len());
        let expected: BTreeSet<_> = registered.iter().map(|(_, k)| *k).collect();
        prop_assert_eq!(fired_keys, expected);
        prop_assert!(scheduler.is_empty());
    }
}
