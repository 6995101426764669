use std::collections::BTreeSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::securities::symbols::{Symbol, SymbolId};

/// Source of candidate derivative contracts for a root.
///
/// Implementations may query a vendor chain endpoint, a local catalog or a
/// synthetic generator. Callers bound every query with a timeout, so an
/// implementation is free to block on I/O.
///
/// ### Contract
/// - Return every contract listed for `root` as of `asof`.
/// - Each returned symbol must be linked to `root` (`underlying == root`);
///   anything else is dropped by the caller with a warning.
/// - `Err(_)` for hard failures; the caller keeps the previous active set.
#[async_trait]
pub trait ContractUniverseProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn contracts(&self, root: &SymbolId, asof: DateTime<Utc>) -> anyhow::Result<Vec<Symbol>>;
}

/// Added/removed diff produced once per lifecycle pass.
///
/// Both sides are id-ordered sets: unique, deterministic iteration, and a
/// symbol never sits on both sides (see [`SecurityChangeSet::merge`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityChangeSet {
    pub added: BTreeSet<Symbol>,
    pub removed: BTreeSet<Symbol>,
}

impl SecurityChangeSet {
    /// Diff between consecutive active sets.
    pub fn between(last: &BTreeSet<Symbol>, next: &BTreeSet<Symbol>) -> Self {
        Self {
            added: next.difference(last).cloned().collect(),
            removed: last.difference(next).cloned().collect(),
        }
    }

    pub fn removed_all(last: &BTreeSet<Symbol>) -> Self {
        Self { added: BTreeSet::new(), removed: last.clone() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Fold `other` (a later change in the same pass) into `self`.
    ///
    /// A symbol removed and re-added within one pass (remove then re-add of
    /// the same root) nets out to no change; likewise added then removed.
    pub fn merge(&mut self, other: SecurityChangeSet) {
        for s in other.removed {
            if !self.added.remove(&s) {
                self.removed.insert(s);
            }
        }
        for s in other.added {
            if !self.removed.remove(&s) {
                self.added.insert(s);
            }
        }
    }

    pub fn added_ids(&self) -> Vec<&SymbolId> { self.added.iter().map(Symbol::id).collect() }
    pub fn removed_ids(&self) -> Vec<&SymbolId> { self.removed.iter().map(Symbol::id).collect() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use crate::securities::symbols::OptionRight;

    fn put(strike: u32) -> Symbol {
        Symbol::option(
            &SymbolId::from("TWX"),
            OptionRight::Put,
            rust_decimal::Decimal::from(strike),
            NaiveDate::from_ymd_opt(2014, 7, 19).unwrap(),
        ).unwrap()
    }

    #[test]
    fn between_reports_both_sides() {
        let last: BTreeSet<Symbol> = [put(60), put(65)].into_iter().collect();
        let next: BTreeSet<Symbol> = [put(65), put(70)].into_iter().collect();
        let diff = SecurityChangeSet::between(&last, &next);
        assert_eq!(diff.added.iter().next().unwrap().strike(), Some(dec!(70)));
        assert_eq!(diff.removed.iter().next().unwrap().strike(), Some(dec!(60)));
    }

    #[test]
    fn merge_nets_out_remove_then_readd() {
        let mut acc = SecurityChangeSet::removed_all(&[put(60)].into_iter().collect());
        acc.merge(SecurityChangeSet { added: [put(60), put(65)].into_iter().collect(), removed: BTreeSet::new() });
        assert!(acc.removed.is_empty());
        assert_eq!(acc.added.len(), 1);
        assert!(acc.added.iter().all(|s| !acc.removed.contains(s)));
    }
}
