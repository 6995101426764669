use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use crate::engine_core::clock::EngineClock;
use crate::engine_core::config::EngineConfig;
use crate::engine_core::correlator::{CorrelationReport, DataCorrelator};
use crate::engine_core::errors::{EngineError, EngineResult};
use crate::engine_core::event_hub::EventHub;
use crate::engine_core::lifecycle::{LifecycleCoordinator, TickReport};
use crate::engine_core::scheduler::{DateRule, ScheduleKey, ScheduledAction, Scheduler, TimeRule, UniverseAction};
use crate::engine_core::snapshot::{
    EngineSnapshot, FiredAction, PendingAction, PriceSnapshot, UniverseSnapshot, SNAPSHOT_VERSION,
};
use crate::market_data::base_data::DataBatch;
use crate::market_data::price_book::PriceBook;
use crate::securities::market_hours::MarketHours;
use crate::securities::registry::{RegistryEvent, SubscriptionRegistry};
use crate::securities::symbols::{Symbol, SymbolId};
use crate::universes::catalog::SelectorCatalog;
use crate::universes::filters::FilterPipeline;
use crate::universes::models::ContractUniverseProvider;

/// The **universe engine** is the root container for the lifecycle services.
/// It owns:
///
/// - [`EngineClock`]: the single logical timeline; `on_tick` moves it.
/// - [`Scheduler`]: one-shot add/remove actions keyed to instants.
/// - [`SubscriptionRegistry`]: one subscription per root with its active set.
/// - [`LifecycleCoordinator`]: applies due actions and refreshes every root.
/// - [`DataCorrelator`] and [`PriceBook`]: fed by `on_data_batch`.
/// - [`EventHub`]: outbound "securities changed" and correlation topics.
///
/// ### Driving it
/// ```ignore
/// let mut engine = UniverseEngine::new(t0, MarketHours::us_equity(), provider, catalog, timeout);
/// engine.schedule(&DateRule::On(day), TimeRule::Midnight, UniverseAction::AddUniverse { root, pipeline })?;
/// let report = engine.on_tick(t0 + Duration::days(1)).await?;
/// engine.on_data_batch(&batch);
/// ```
///
/// ### Immediate actions
/// [`add_universe_now`](Self::add_universe_now) and
/// [`remove_universe_now`](Self::remove_universe_now) bypass the scheduler's
/// idempotency and conflict rules. They are queued at the current instant and
/// applied on the next `on_tick`, after any scheduled action due at or before
/// that instant, so their changes reach consumers through the normal
/// per-tick notification.
pub struct UniverseEngine {
    clock: EngineClock,
    scheduler: Scheduler,
    immediate: Vec<ScheduledAction>,
    registry: Arc<SubscriptionRegistry>,
    coordinator: LifecycleCoordinator,
    correlator: DataCorrelator,
    prices: PriceBook,
    hub: EventHub,
    catalog: Arc<SelectorCatalog>,
}

impl UniverseEngine {
    pub fn new(
        start: DateTime<Utc>,
        hours: MarketHours,
        provider: Arc<dyn ContractUniverseProvider>,
        catalog: Arc<SelectorCatalog>,
        provider_timeout: Duration,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let hub = EventHub::new();
        let coordinator = LifecycleCoordinator::new(registry.clone(), provider, hub.clone(), provider_timeout);
        Self {
            clock: EngineClock::new(start),
            scheduler: Scheduler::new(hours),
            immediate: Vec::new(),
            registry,
            coordinator,
            correlator: DataCorrelator,
            prices: PriceBook::new(),
            hub,
            catalog,
        }
    }

    /// Build an engine from configuration and install its schedule.
    pub fn from_config(
        cfg: &EngineConfig,
        start: DateTime<Utc>,
        provider: Arc<dyn ContractUniverseProvider>,
        catalog: Arc<SelectorCatalog>,
    ) -> EngineResult<Self> {
        let mut engine = Self::new(start, cfg.market_hours()?, provider, catalog, cfg.provider_timeout());
        let keys = cfg.install_schedule(&mut engine.scheduler, &engine.catalog)?;
        tracing::info!(actions=keys.len(), universes=cfg.universes.len(), tz=%cfg.time_zone, "engine configured");
        Ok(engine)
    }

    // ---- time ----

    /// Advance to `now`, fire due actions and refresh every live root.
    ///
    /// `now` before the current instant is rejected with
    /// [`EngineError::ClockRegression`] and nothing runs. Repeating the
    /// current instant is allowed and fires nothing twice.
    pub async fn on_tick(&mut self, now: DateTime<Utc>) -> EngineResult<TickReport> {
        self.clock.advance_to(now)?;
        let mut due = self.scheduler.tick(now);
        due.append(&mut self.immediate);
        due.sort_by_key(|a| a.at);
        Ok(self.coordinator.on_tick(now, due, &self.prices).await)
    }

    #[inline]
    pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

    // ---- data ----

    /// Record root prices from `batch` and report which roots it covered.
    pub fn on_data_batch(&self, batch: &DataBatch) -> CorrelationReport {
        let updated = self.prices.record_batch(batch);
        let report = self.correlator.correlate(batch, &self.registry.active_roots());
        tracing::debug!(time=%batch.time, symbols=batch.len(), prices=updated, missing=report.missing().len(), "data batch");
        self.hub.publish_correlation(report.clone());
        report
    }

    /// Supply the authoritative reference price of `root`.
    pub fn set_reference_price(&self, root: &SymbolId, price: Decimal) {
        self.prices.set(root, price, self.clock.now());
    }

    pub fn reference_price(&self, root: &SymbolId) -> Option<Decimal> { self.prices.get(root) }

    // ---- scheduling ----

    pub fn schedule(&mut self, date_rule: &DateRule, time_rule: TimeRule, action: UniverseAction) -> EngineResult<Vec<ScheduleKey>> {
        self.scheduler.schedule(date_rule, time_rule, action)
    }

    pub fn schedule_at(&mut self, at: DateTime<Utc>, action: UniverseAction) -> EngineResult<ScheduleKey> {
        self.scheduler.schedule_at(at, action)
    }

    pub fn add_universe_now(&mut self, root: &SymbolId, pipeline: FilterPipeline) -> ScheduleKey {
        self.queue_now(UniverseAction::AddUniverse { root: root.clone(), pipeline })
    }

    pub fn remove_universe_now(&mut self, root: &SymbolId) -> ScheduleKey {
        self.queue_now(UniverseAction::RemoveUniverse { root: root.clone() })
    }

    fn queue_now(&mut self, action: UniverseAction) -> ScheduleKey {
        let key = ScheduleKey::new();
        self.immediate.push(ScheduledAction { key, at: self.clock.now(), action });
        key
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler { &self.scheduler }

    /// Drop the record of actions that fired more than `older_than` before
    /// the current clock. Long-running engines call this periodically.
    pub fn prune_fired(&mut self, older_than: chrono::Duration) -> usize {
        match self.now().checked_sub_signed(older_than) {
            Some(cutoff) => self.scheduler.prune_fired(cutoff),
            None => 0,
        }
    }

    // ---- views ----

    #[inline]
    pub fn hub(&self) -> &EventHub { &self.hub }

    #[inline]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> { &self.registry }

    #[inline]
    pub fn catalog(&self) -> &Arc<SelectorCatalog> { &self.catalog }

    pub fn active_set(&self, root: &SymbolId) -> BTreeSet<Symbol> { self.registry.active_set(root) }

    pub fn active_roots(&self) -> BTreeSet<SymbolId> { self.registry.active_roots() }

    pub fn registry_events(&self) -> broadcast::Receiver<RegistryEvent> { self.registry.subscribe() }

    // ---- persistence ----

    pub fn snapshot(&self) -> EngineSnapshot {
        let mut pending: Vec<PendingAction> = self.scheduler
            .pending()
            .map(|a| PendingAction::capture(a, false))
            .collect();
        pending.extend(self.immediate.iter().map(|a| PendingAction::capture(a, true)));

        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            clock: self.clock.now(),
            universes: self.registry.snapshot().iter().map(UniverseSnapshot::capture).collect(),
            pending,
            fired: self.scheduler
                .fired()
                .into_iter()
                .map(|(intent, key, spec)| FiredAction { intent, key, spec })
                .collect(),
            prices: self.prices
                .entries()
                .into_iter()
                .map(|(root, p)| PriceSnapshot { root, price: p.price, time: p.time })
                .collect(),
        }
    }

    /// Rebuild an engine from `snap`. Fails if a stored pipeline names a
    /// selector missing from `catalog`.
    pub fn restore(
        snap: &EngineSnapshot,
        hours: MarketHours,
        provider: Arc<dyn ContractUniverseProvider>,
        catalog: Arc<SelectorCatalog>,
        provider_timeout: Duration,
    ) -> EngineResult<Self> {
        if snap.version != SNAPSHOT_VERSION {
            return Err(EngineError::Snapshot(format!("unsupported snapshot version {}", snap.version)));
        }
        let mut engine = Self::new(snap.clock, hours, provider, catalog, provider_timeout);

        for u in &snap.universes {
            let pipeline = u.spec
                .build(&engine.catalog)
                .map_err(|e| EngineError::Snapshot(format!("universe {}: {e}", u.root)))?;
            engine.registry.restore(&u.root, pipeline, u.active.clone(), u.created_at, u.fault.clone())?;
        }
        for f in &snap.fired {
            engine.scheduler.restore_fired(f.intent.clone(), f.key, f.spec.clone());
        }
        for p in &snap.pending {
            let action = p.to_scheduled(&engine.catalog)?;
            if p.immediate {
                engine.immediate.push(action);
            } else {
                engine.scheduler.restore_pending(action.key, action.at, action.action)?;
            }
        }
        for p in &snap.prices {
            engine.prices.set(&p.root, p.price, p.time);
        }
        tracing::info!(
            clock=%snap.clock,
            universes=snap.universes.len(),
            pending=snap.pending.len(),
            "engine restored"
        );
        Ok(engine)
    }
}
