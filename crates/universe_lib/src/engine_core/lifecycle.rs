//! Per-tick lifecycle of root universes.
//!
//! One call to [`LifecycleCoordinator::on_tick`]:
//! 1. applies the due scheduled actions in trigger order (add → register,
//!    remove → unregister, the removed root's active set joining `removed`);
//! 2. refreshes every live, non-faulted root: provider queries and pipeline
//!    evaluations run concurrently, commits happen one by one in root order;
//! 3. merges everything into one [`SecurityChangeSet`] and publishes it on the
//!    hub, also when it is empty.
//!
//! A failing action or root refresh is logged and collected into the
//! [`TickReport`]; the rest of the tick carries on.
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use crate::engine_core::errors::EngineError;
use crate::engine_core::event_hub::{EventHub, SecuritiesChanged};
use crate::engine_core::scheduler::{ScheduleKey, ScheduledAction, UniverseAction};
use crate::market_data::price_book::PriceBook;
use crate::securities::registry::{RefreshTicket, SubscriptionRegistry};
use crate::universes::models::{ContractUniverseProvider, SecurityChangeSet};

/// Outcome of one lifecycle tick.
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    pub time: DateTime<Utc>,
    /// Keys of the scheduled actions that fired this tick, in firing order.
    pub fired: Vec<ScheduleKey>,
    pub changes: SecurityChangeSet,
    /// Per-action and per-root failures, in the order they happened.
    pub errors: Vec<EngineError>,
}

impl TickReport {
    pub fn is_clean(&self) -> bool { self.errors.is_empty() }
}

pub struct LifecycleCoordinator {
    registry: Arc<SubscriptionRegistry>,
    provider: Arc<dyn ContractUniverseProvider>,
    hub: EventHub,
    provider_timeout: Duration,
}

impl LifecycleCoordinator {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        provider: Arc<dyn ContractUniverseProvider>,
        hub: EventHub,
        provider_timeout: Duration,
    ) -> Self {
        Self { registry, provider, hub, provider_timeout }
    }

    #[inline]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> { &self.registry }

    #[inline]
    pub fn provider_timeout(&self) -> Duration { self.provider_timeout }

    pub async fn on_tick(&self, now: DateTime<Utc>, due: Vec<ScheduledAction>, prices: &PriceBook) -> TickReport {
        let mut report = TickReport { time: now, ..Default::default() };

        for scheduled in due {
            report.fired.push(scheduled.key);
            match self.apply_action(scheduled.action, now) {
                Ok(removed) => report.changes.merge(removed),
                Err(e) => {
                    tracing::warn!(key=%scheduled.key, at=%scheduled.at, error=%e, "universe action failed");
                    report.errors.push(e);
                }
            }
        }

        let (changes, errors) = self.refresh_all(now, prices).await;
        report.changes.merge(changes);
        report.errors.extend(errors);

        tracing::debug!(
            %now,
            added=report.changes.added.len(),
            removed=report.changes.removed.len(),
            errors=report.errors.len(),
            "lifecycle tick"
        );
        self.hub.publish_changes(SecuritiesChanged { time: now, changes: report.changes.clone() });
        report
    }

    /// Apply one add/remove. A removal yields the root's final active set as
    /// `removed`; an add yields nothing until its first refresh.
    fn apply_action(&self, action: UniverseAction, now: DateTime<Utc>) -> Result<SecurityChangeSet, EngineError> {
        match action {
            UniverseAction::AddUniverse { root, pipeline } => {
                self.registry.register(&root, pipeline, now)?;
                tracing::info!(%root, %now, "universe added");
                Ok(SecurityChangeSet::default())
            }
            UniverseAction::RemoveUniverse { root } => {
                let sub = self.registry.unregister(&root)?;
                tracing::info!(%root, %now, removed=sub.active().len(), "universe removed");
                Ok(SecurityChangeSet::removed_all(sub.active()))
            }
        }
    }

    async fn refresh_all(&self, now: DateTime<Utc>, prices: &PriceBook) -> (SecurityChangeSet, Vec<EngineError>) {
        let mut tickets: Vec<RefreshTicket> = Vec::new();
        for root in self.registry.active_roots() {
            match self.registry.begin_refresh(&root) {
                Ok(t) => tickets.push(t),
                Err(EngineError::FaultedPipeline { .. }) => {
                    tracing::debug!(%root, "faulted universe skipped");
                }
                Err(e) => tracing::debug!(%root, error=%e, "refresh not started"),
            }
        }

        let provider = self.provider.as_ref();
        let outcomes = join_all(tickets.iter().map(|t| {
            t.evaluate(provider, now, prices.get(t.root()), self.provider_timeout)
        }))
        .await;

        let mut changes = SecurityChangeSet::default();
        let mut errors = Vec::new();
        for (ticket, outcome) in tickets.into_iter().zip(outcomes) {
            let root = ticket.root().clone();
            match self.registry.complete_refresh(ticket, outcome, now) {
                Ok(diff) => {
                    if !diff.is_empty() {
                        tracing::info!(%root, added=diff.added.len(), removed=diff.removed.len(), "universe refreshed");
                    }
                    changes.merge(diff);
                }
                Err(EngineError::StaleRefresh { .. }) => {
                    tracing::debug!(%root, "stale refresh discarded");
                }
                Err(e) if e.is_contract_error() => {
                    tracing::error!(%root, error=%e, "universe pipeline faulted, remove and re-add to recover");
                    errors.push(e);
                }
                Err(e) => {
                    tracing::warn!(%root, error=%e, "refresh failed, keeping previous active set");
                    errors.push(e);
                }
            }
        }
        (changes, errors)
    }
}
