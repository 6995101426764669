use std::collections::BTreeSet;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use crate::engine_core::errors::{EngineError, EngineResult};
use crate::engine_core::scheduler::{ActionIntent, ActionKind, ScheduleKey, ScheduledAction, UniverseAction};
use crate::securities::registry::RootSubscription;
use crate::securities::symbols::{Symbol, SymbolId};
use crate::universes::catalog::SelectorCatalog;
use crate::universes::filters::FilterSpec;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Persistent image of an engine: enough to resume and produce the same
/// subsequent change sets.
///
/// Pipelines are stored as [`FilterSpec`]s, so every custom selector in use
/// must be registered in the [`SelectorCatalog`] handed to restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub clock: DateTime<Utc>,
    pub universes: Vec<UniverseSnapshot>,
    /// Unfired actions, in firing order.
    pub pending: Vec<PendingAction>,
    #[serde(default)]
    pub fired: Vec<FiredAction>,
    #[serde(default)]
    pub prices: Vec<PriceSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniverseSnapshot {
    pub root: SymbolId,
    pub spec: FilterSpec,
    pub active: BTreeSet<Symbol>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub fault: Option<String>,
}

impl UniverseSnapshot {
    pub fn capture(sub: &RootSubscription) -> Self {
        Self {
            root: sub.root().clone(),
            spec: sub.pipeline().to_spec(),
            active: sub.active().clone(),
            created_at: sub.created_at(),
            fault: sub.fault().map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub key: ScheduleKey,
    pub at: DateTime<Utc>,
    pub root: SymbolId,
    pub kind: ActionKind,
    /// Pipeline of an add; absent for removals.
    #[serde(default)]
    pub spec: Option<FilterSpec>,
    /// Requested through the engine's immediate path rather than the scheduler.
    #[serde(default)]
    pub immediate: bool,
}

impl PendingAction {
    pub fn capture(a: &ScheduledAction, immediate: bool) -> Self {
        let spec = match &a.action {
            UniverseAction::AddUniverse { pipeline, .. } => Some(pipeline.to_spec()),
            UniverseAction::RemoveUniverse { .. } => None,
        };
        Self { key: a.key, at: a.at, root: a.action.root().clone(), kind: a.action.kind(), spec, immediate }
    }

    /// Rebuild the action, resolving selectors through `catalog`.
    pub fn to_scheduled(&self, catalog: &SelectorCatalog) -> EngineResult<ScheduledAction> {
        let action = match self.kind {
            ActionKind::Add => {
                let spec = self.spec.as_ref().ok_or_else(|| {
                    EngineError::Snapshot(format!("pending add of {} has no filter spec", self.root))
                })?;
                let pipeline = spec
                    .build(catalog)
                    .map_err(|e| EngineError::Snapshot(format!("pending add of {}: {e}", self.root)))?;
                UniverseAction::AddUniverse { root: self.root.clone(), pipeline }
            }
            ActionKind::Remove => UniverseAction::RemoveUniverse { root: self.root.clone() },
        };
        Ok(ScheduledAction { key: self.key, at: self.at, action })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FiredAction {
    pub intent: ActionIntent,
    pub key: ScheduleKey,
    /// Pipeline of a fired add, compared on re-registration.
    #[serde(default)]
    pub spec: Option<FilterSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub root: SymbolId,
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

impl EngineSnapshot {
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::Snapshot(e.to_string()))
    }

    pub fn from_json(s: &str) -> EngineResult<Self> {
        let snap: Self = serde_json::from_str(s).map_err(|e| EngineError::Snapshot(e.to_string()))?;
        if snap.version != SNAPSHOT_VERSION {
            return Err(EngineError::Snapshot(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})", snap.version
            )));
        }
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;
    use crate::securities::symbols::OptionRight;
    use crate::universes::filters::StageSpec;

    fn sample() -> EngineSnapshot {
        let t = Utc.with_ymd_and_hms(2014, 6, 5, 0, 0, 0).unwrap();
        let root = SymbolId::from("TWX");
        let put = Symbol::option(&root, OptionRight::Put, dec!(70), NaiveDate::from_ymd_opt(2014, 7, 19).unwrap()).unwrap();
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            clock: t,
            universes: vec![UniverseSnapshot {
                root: root.clone(),
                spec: FilterSpec { stages: vec![StageSpec::ExpirationWindow { min_days: 0, max_days: 180 }] },
                active: [put].into_iter().collect(),
                created_at: t,
                fault: None,
            }],
            pending: vec![PendingAction {
                key: ScheduleKey::new(),
                at: t + chrono::Duration::days(1),
                root,
                kind: ActionKind::Remove,
                spec: None,
                immediate: false,
            }],
            fired: vec![],
            prices: vec![],
        }
    }

    #[test]
    fn json_round_trip_keeps_everything() {
        let snap = sample();
        let back = EngineSnapshot::from_json(&snap.to_json().unwrap()).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn rejects_other_versions_and_broken_symbols() {
        let mut snap = sample();
        snap.version = 99;
        let err = EngineSnapshot::from_json(&snap.to_json().unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::Snapshot(_)));

        // an option without underlying never deserializes
        let json = sample().to_json().unwrap().replace("\"underlying\": \"TWX\"", "\"underlying\": null");
        assert!(EngineSnapshot::from_json(&json).is_err());
    }

    #[test]
    fn pending_add_without_spec_is_rejected() {
        let p = PendingAction {
            key: ScheduleKey::new(),
            at: Utc::now(),
            root: SymbolId::from("TWX"),
            kind: ActionKind::Add,
            spec: None,
            immediate: false,
        };
        assert!(p.to_scheduled(&SelectorCatalog::with_defaults()).is_err());
    }
}
