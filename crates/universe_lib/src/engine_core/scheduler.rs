use std::collections::BTreeMap;
use std::fmt;
use ahash::AHashMap;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::engine_core::errors::{EngineError, EngineResult};
use crate::securities::market_hours::MarketHours;
use crate::securities::symbols::SymbolId;
use crate::universes::filters::{FilterPipeline, FilterSpec};

/// Which local dates an action is scheduled on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRule {
    On(NaiveDate),
    /// One action per listed date; duplicates collapse.
    Dates(Vec<NaiveDate>),
}

impl DateRule {
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut out = match self {
            DateRule::On(d) => vec![*d],
            DateRule::Dates(ds) => ds.clone(),
        };
        out.sort();
        out.dedup();
        out
    }
}

/// Time of day on a scheduled date, in the venue's local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRule {
    At { hour: u32, minute: u32, second: u32 },
    Midnight,
    Noon,
    /// Minutes after the regular session opens.
    AfterMarketOpen(u32),
    /// Minutes before the regular session closes.
    BeforeMarketClose(u32),
}

impl TimeRule {
    pub fn at(hour: u32, minute: u32, second: u32) -> Self { TimeRule::At { hour, minute, second } }

    /// Resolve to an absolute instant on local date `d`.
    ///
    /// Wall times inside a DST gap and session-relative rules on a closed
    /// date are [`EngineError::InvalidRule`].
    pub fn resolve(&self, d: NaiveDate, hours: &MarketHours) -> EngineResult<DateTime<Utc>> {
        let wall = |h: u32, m: u32, s: u32| {
            NaiveTime::from_hms_opt(h, m, s)
                .ok_or_else(|| EngineError::InvalidRule(format!("{h:02}:{m:02}:{s:02} is not a time of day")))
        };
        match *self {
            TimeRule::At { hour, minute, second } => hours.local_to_utc(d, wall(hour, minute, second)?),
            TimeRule::Midnight => hours.local_to_utc(d, NaiveTime::MIN),
            TimeRule::Noon => hours.local_to_utc(d, wall(12, 0, 0)?),
            TimeRule::AfterMarketOpen(min) => {
                let (open, close) = Self::session(d, hours, self)?;
                let at = open + Duration::minutes(min as i64);
                if at > close {
                    return Err(EngineError::InvalidRule(format!("{min} minutes after open falls after the {d} close")));
                }
                Ok(at)
            }
            TimeRule::BeforeMarketClose(min) => {
                let (open, close) = Self::session(d, hours, self)?;
                let at = close - Duration::minutes(min as i64);
                if at < open {
                    return Err(EngineError::InvalidRule(format!("{min} minutes before close falls before the {d} open")));
                }
                Ok(at)
            }
        }
    }

    fn session(d: NaiveDate, hours: &MarketHours, rule: &TimeRule) -> EngineResult<(DateTime<Utc>, DateTime<Utc>)> {
        hours.session_bounds(d)?.ok_or_else(|| {
            EngineError::InvalidRule(format!("{rule:?} on {d}: {} is closed", hours.venue))
        })
    }
}

/// Opaque handle returned by [`Scheduler::schedule`].
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleKey(Uuid);

impl ScheduleKey {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for ScheduleKey {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

#[derive(Clone, Debug)]
pub enum UniverseAction {
    AddUniverse { root: SymbolId, pipeline: FilterPipeline },
    RemoveUniverse { root: SymbolId },
}

impl UniverseAction {
    pub fn root(&self) -> &SymbolId {
        match self {
            UniverseAction::AddUniverse { root, .. } | UniverseAction::RemoveUniverse { root } => root,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            UniverseAction::AddUniverse { .. } => ActionKind::Add,
            UniverseAction::RemoveUniverse { .. } => ActionKind::Remove,
        }
    }

    /// Declarative form of an add's pipeline; two adds with equal specs are
    /// the same configuration.
    pub fn spec(&self) -> Option<FilterSpec> {
        match self {
            UniverseAction::AddUniverse { pipeline, .. } => Some(pipeline.to_spec()),
            UniverseAction::RemoveUniverse { .. } => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind { Add, Remove }

/// Idempotency identity of a scheduled action: the same root, intent and
/// instant is the same action.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionIntent {
    pub at: DateTime<Utc>,
    pub root: SymbolId,
    pub kind: ActionKind,
}

#[derive(Clone, Debug)]
pub struct ScheduledAction {
    pub key: ScheduleKey,
    pub at: DateTime<Utc>,
    pub action: UniverseAction,
}

impl ScheduledAction {
    pub fn intent(&self) -> ActionIntent {
        ActionIntent { at: self.at, root: self.action.root().clone(), kind: self.action.kind() }
    }
}

/// A registered intent and the pipeline it was registered with.
#[derive(Clone, Debug)]
struct Registration {
    key: ScheduleKey,
    spec: Option<FilterSpec>,
}

/// Time-ordered queue of one-shot universe actions.
///
/// Each action fires on the first [`tick`](Scheduler::tick) whose `now` is at
/// or past its instant and is then gone, so repeated or overlapping ticks can
/// never replay it. Actions registered for an instant already in the past
/// fire on the next tick. Ties on the same instant fire in registration order.
///
/// Fired intents are remembered so re-registration stays a no-op; that record
/// grows with every fired action until [`prune_fired`](Scheduler::prune_fired)
/// drops the old part.
pub struct Scheduler {
    hours: MarketHours,
    queue: BTreeMap<(DateTime<Utc>, u64), ScheduledAction>,
    pending: AHashMap<ActionIntent, Registration>,
    fired: AHashMap<ActionIntent, Registration>,
    seq: u64,
}

impl Scheduler {
    pub fn new(hours: MarketHours) -> Self {
        Self { hours, queue: BTreeMap::new(), pending: AHashMap::new(), fired: AHashMap::new(), seq: 0 }
    }

    #[inline]
    pub fn market_hours(&self) -> &MarketHours { &self.hours }

    /// Register `action` on every date of `date_rule` at `time_rule`.
    ///
    /// All instants are resolved and checked before anything is queued, so a
    /// rejected registration leaves the scheduler untouched. Re-registering an
    /// identical action (same instant, root, intent and pipeline) returns the
    /// original key and queues nothing, whether or not it already fired. An
    /// add with a different pipeline at the same instant is a
    /// `DuplicateSchedule` error.
    pub fn schedule(&mut self, date_rule: &DateRule, time_rule: TimeRule, action: UniverseAction) -> EngineResult<Vec<ScheduleKey>> {
        let dates = date_rule.dates();
        if dates.is_empty() {
            return Err(EngineError::InvalidRule("date rule lists no dates".into()));
        }
        let instants = dates
            .into_iter()
            .map(|d| time_rule.resolve(d, &self.hours))
            .collect::<EngineResult<Vec<_>>>()?;

        let spec = action.spec();
        for at in &instants {
            self.check(*at, &action, spec.as_ref())?;
        }
        Ok(instants.into_iter().map(|at| self.enqueue(at, action.clone(), spec.clone(), None)).collect())
    }

    /// Register `action` at an absolute instant.
    pub fn schedule_at(&mut self, at: DateTime<Utc>, action: UniverseAction) -> EngineResult<ScheduleKey> {
        let spec = action.spec();
        self.check(at, &action, spec.as_ref())?;
        Ok(self.enqueue(at, action, spec, None))
    }

    /// Re-queue an unfired action under its original key (snapshot restore).
    pub fn restore_pending(&mut self, key: ScheduleKey, at: DateTime<Utc>, action: UniverseAction) -> EngineResult<()> {
        let spec = action.spec();
        self.check(at, &action, spec.as_ref())?;
        self.enqueue(at, action, spec, Some(key));
        Ok(())
    }

    /// Remember an already-fired action so it is not registered again.
    pub fn restore_fired(&mut self, intent: ActionIntent, key: ScheduleKey, spec: Option<FilterSpec>) {
        self.fired.insert(intent, Registration { key, spec });
    }

    fn check(&self, at: DateTime<Utc>, action: &UniverseAction, spec: Option<&FilterSpec>) -> EngineResult<()> {
        self.check_conflict(at, action)?;
        let intent = ActionIntent { at, root: action.root().clone(), kind: action.kind() };
        match self.pending.get(&intent).or_else(|| self.fired.get(&intent)) {
            Some(existing) if existing.spec.as_ref() != spec => {
                Err(EngineError::DuplicateSchedule { root: intent.root, at, existing: existing.key })
            }
            _ => Ok(()),
        }
    }

    fn check_conflict(&self, at: DateTime<Utc>, action: &UniverseAction) -> EngineResult<()> {
        let opposite = ActionIntent {
            at,
            root: action.root().clone(),
            kind: match action.kind() {
                ActionKind::Add => ActionKind::Remove,
                ActionKind::Remove => ActionKind::Add,
            },
        };
        if self.pending.contains_key(&opposite) || self.fired.contains_key(&opposite) {
            return Err(EngineError::SchedulingConflict { root: action.root().clone(), at });
        }
        Ok(())
    }

    fn enqueue(&mut self, at: DateTime<Utc>, action: UniverseAction, spec: Option<FilterSpec>, key: Option<ScheduleKey>) -> ScheduleKey {
        let intent = ActionIntent { at, root: action.root().clone(), kind: action.kind() };
        if let Some(existing) = self.pending.get(&intent).or_else(|| self.fired.get(&intent)) {
            tracing::debug!(root=%intent.root, %at, kind=?intent.kind, key=%existing.key, "identical schedule ignored");
            return existing.key;
        }
        let key = key.unwrap_or_default();
        self.seq += 1;
        self.pending.insert(intent, Registration { key, spec });
        self.queue.insert((at, self.seq), ScheduledAction { key, at, action });
        tracing::debug!(%key, %at, "scheduled universe action");
        key
    }

    /// Remove and return every action due at or before `now`, ascending by
    /// instant.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<ScheduledAction> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now { break; }
            let action = entry.remove();
            let intent = action.intent();
            let reg = self.pending
                .remove(&intent)
                .unwrap_or_else(|| Registration { key: action.key, spec: action.action.spec() });
            self.fired.insert(intent, reg);
            due.push(action);
        }
        due
    }

    /// Unfired actions in firing order.
    pub fn pending(&self) -> impl Iterator<Item = &ScheduledAction> {
        self.queue.values()
    }

    /// Intents that already fired with their keys and add pipelines, ordered
    /// by instant.
    pub fn fired(&self) -> Vec<(ActionIntent, ScheduleKey, Option<FilterSpec>)> {
        let mut all: Vec<_> = self.fired.iter().map(|(i, r)| (i.clone(), r.key, r.spec.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Forget fired intents scheduled before `cutoff`. Returns how many were
    /// dropped. A forgotten intent registered again is queued afresh and, its
    /// instant being past, fires on the next tick.
    pub fn prune_fired(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.fired.len();
        self.fired.retain(|intent, _| intent.at >= cutoff);
        before - self.fired.len()
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize { self.queue.len() }
    pub fn is_empty(&self) -> bool { self.queue.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, day).unwrap() }
    fn utc(y: i32, m: u32, day: u32, h: u32, mi: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(y, m, day, h, mi, 0).unwrap() }

    fn add(root: &str) -> UniverseAction {
        UniverseAction::AddUniverse { root: SymbolId::from(root), pipeline: FilterPipeline::pass_through() }
    }
    fn remove(root: &str) -> UniverseAction {
        UniverseAction::RemoveUniverse { root: SymbolId::from(root) }
    }

    #[test]
    fn time_rules_resolve_in_exchange_time() {
        let hours = MarketHours::us_equity();
        let day = d(2014, 6, 5);
        assert_eq!(TimeRule::Midnight.resolve(day, &hours).unwrap(), utc(2014, 6, 5, 4, 0));
        assert_eq!(TimeRule::Noon.resolve(day, &hours).unwrap(), utc(2014, 6, 5, 16, 0));
        assert_eq!(TimeRule::AfterMarketOpen(10).resolve(day, &hours).unwrap(), utc(2014, 6, 5, 13, 40));
        assert_eq!(TimeRule::BeforeMarketClose(15).resolve(day, &hours).unwrap(), utc(2014, 6, 5, 19, 45));
        // winter: EST
        assert_eq!(TimeRule::at(10, 0, 0).resolve(d(2014, 1, 6), &hours).unwrap(), utc(2014, 1, 6, 15, 0));
    }

    #[test]
    fn invalid_times_are_rejected() {
        let hours = MarketHours::us_equity();
        // 2014-03-09 02:30 does not exist in New York
        assert!(matches!(TimeRule::at(2, 30, 0).resolve(d(2014, 3, 9), &hours), Err(EngineError::InvalidRule(_))));
        // Saturday has no session
        assert!(matches!(TimeRule::AfterMarketOpen(5).resolve(d(2014, 6, 7), &hours), Err(EngineError::InvalidRule(_))));
        assert!(matches!(TimeRule::at(25, 0, 0).resolve(d(2014, 6, 5), &hours), Err(EngineError::InvalidRule(_))));
        // fall-back: 01:30 happens twice, the earlier (EDT) instant wins
        assert_eq!(TimeRule::at(1, 30, 0).resolve(d(2014, 11, 2), &hours).unwrap(), utc(2014, 11, 2, 5, 30));
    }

    #[test]
    fn fires_exactly_once_in_instant_order() {
        let mut s = Scheduler::new(MarketHours::always_open(chrono_tz::UTC));
        let late = s.schedule_at(utc(2014, 6, 6, 0, 0), remove("TWX")).unwrap();
        let early = s.schedule_at(utc(2014, 6, 5, 0, 0), add("TWX")).unwrap();

        assert!(s.tick(utc(2014, 6, 4, 23, 59)).is_empty());
        let fired = s.tick(utc(2014, 6, 7, 0, 0));
        assert_eq!(fired.iter().map(|a| a.key).collect::<Vec<_>>(), vec![early, late]);
        assert!(s.tick(utc(2014, 6, 7, 0, 0)).is_empty());
        assert!(s.tick(utc(2014, 6, 8, 0, 0)).is_empty());
        assert!(s.is_empty());
    }

    #[test]
    fn past_registration_fires_on_next_tick() {
        let mut s = Scheduler::new(MarketHours::always_open(chrono_tz::UTC));
        assert_eq!(s.tick(utc(2014, 6, 10, 0, 0)).len(), 0);
        s.schedule_at(utc(2014, 6, 1, 0, 0), add("TWX")).unwrap();
        assert_eq!(s.tick(utc(2014, 6, 10, 0, 0)).len(), 1);
    }

    #[test]
    fn add_and_remove_at_same_instant_conflict() {
        let mut s = Scheduler::new(MarketHours::us_equity());
        let on = DateRule::On(d(2014, 6, 5));
        s.schedule(&on, TimeRule::at(10, 0, 0), add("AAPL")).unwrap();
        let err = s.schedule(&on, TimeRule::at(10, 0, 0), remove("AAPL")).unwrap_err();
        assert!(matches!(err, EngineError::SchedulingConflict { ref root, .. } if root.as_str() == "AAPL"));
        assert_eq!(s.len(), 1);
        // other roots and other instants are fine
        s.schedule(&on, TimeRule::at(10, 0, 0), remove("TWX")).unwrap();
        s.schedule(&on, TimeRule::at(10, 0, 1), remove("AAPL")).unwrap();
    }

    #[test]
    fn identical_registration_is_idempotent() {
        let mut s = Scheduler::new(MarketHours::us_equity());
        let on = DateRule::On(d(2014, 6, 5));
        let k1 = s.schedule(&on, TimeRule::Noon, add("TWX")).unwrap();
        let k2 = s.schedule(&on, TimeRule::Noon, add("TWX")).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(s.len(), 1);

        assert_eq!(s.tick(utc(2014, 6, 5, 16, 0)).len(), 1);
        let k3 = s.schedule(&on, TimeRule::Noon, add("TWX")).unwrap();
        assert_eq!(k1, k3);
        assert!(s.tick(utc(2014, 6, 6, 0, 0)).is_empty());
    }

    #[test]
    fn second_add_with_another_pipeline_is_rejected() {
        let mut s = Scheduler::new(MarketHours::always_open(chrono_tz::UTC));
        let t0 = utc(2014, 6, 5, 0, 0);
        let banded = || UniverseAction::AddUniverse {
            root: SymbolId::from("TWX"),
            pipeline: FilterPipeline::builder()
                .strike_band(rust_decimal::Decimal::ZERO, rust_decimal::Decimal::ZERO)
                .build()
                .unwrap(),
        };

        let k1 = s.schedule_at(t0, add("TWX")).unwrap();
        let err = s.schedule_at(t0, banded()).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSchedule { ref root, existing, .. } if root.as_str() == "TWX" && existing == k1));
        assert_eq!(s.len(), 1);
        // an equal pipeline built separately is still the same action
        assert_eq!(s.schedule_at(t0, add("TWX")).unwrap(), k1);

        // a multi-date rule hitting the taken instant queues nothing
        let rule = DateRule::Dates(vec![d(2014, 6, 5), d(2014, 6, 6)]);
        assert!(s.schedule(&rule, TimeRule::Midnight, banded()).is_err());
        assert_eq!(s.len(), 1);

        // still rejected once the first add has fired
        assert_eq!(s.tick(t0).len(), 1);
        assert!(matches!(s.schedule_at(t0, banded()), Err(EngineError::DuplicateSchedule { .. })));
        assert!(s.is_empty());
    }

    #[test]
    fn pruned_fired_intents_are_forgotten() {
        let mut s = Scheduler::new(MarketHours::always_open(chrono_tz::UTC));
        let old = s.schedule_at(utc(2014, 6, 1, 0, 0), remove("TWX")).unwrap();
        let recent = s.schedule_at(utc(2014, 6, 9, 0, 0), remove("TWX")).unwrap();
        assert_eq!(s.tick(utc(2014, 6, 10, 0, 0)).len(), 2);
        assert_eq!(s.fired().len(), 2);

        assert_eq!(s.prune_fired(utc(2014, 6, 5, 0, 0)), 1);
        let kept: Vec<_> = s.fired().into_iter().map(|(_, k, _)| k).collect();
        assert_eq!(kept, vec![recent]);

        // the recent one is still idempotent, the forgotten one queues afresh
        assert_eq!(s.schedule_at(utc(2014, 6, 9, 0, 0), remove("TWX")).unwrap(), recent);
        let again = s.schedule_at(utc(2014, 6, 1, 0, 0), remove("TWX")).unwrap();
        assert_ne!(again, old);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn date_list_schedules_one_action_per_date() {
        let mut s = Scheduler::new(MarketHours::us_equity());
        let rule = DateRule::Dates(vec![d(2014, 6, 6), d(2014, 6, 5), d(2014, 6, 5)]);
        let keys = s.schedule(&rule, TimeRule::AfterMarketOpen(0), add("TWX")).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(s.next_due(), Some(utc(2014, 6, 5, 13, 30)));

        // one closed date rejects the whole rule
        let bad = DateRule::Dates(vec![d(2014, 6, 9), d(2014, 6, 8)]);
        assert!(s.schedule(&bad, TimeRule::AfterMarketOpen(0), add("IBM")).is_err());
        assert_eq!(s.len(), 2);
    }
}
