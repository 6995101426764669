use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use crate::engine_core::errors::{EngineError, EngineResult};
use crate::securities::symbols::{Symbol, SymbolId};
use crate::universes::filters::{FilterContext, FilterPipeline};
use crate::universes::models::{ContractUniverseProvider, SecurityChangeSet};

/// The **subscription registry** tracks, per root symbol, which derived
/// contracts are currently subscribed.
///
/// ### Responsibilities
/// - Holds at most one [`RootSubscription`] per root.
/// - Re-runs a root's [`FilterPipeline`] on refresh and returns the
///   [`SecurityChangeSet`] against the previous active set.
/// - Emits [`RegistryEvent`]s on register/unregister/refresh/fault so GUIs or
///   loggers can follow the lifecycle.
///
/// ### Concurrency
/// - Backed by a [`DashMap`] keyed by root, so mutations of one root are
///   serialised by its shard lock while other roots proceed.
/// - A refresh is split in three: [`begin_refresh`](Self::begin_refresh)
///   takes a [`RefreshTicket`] under the lock, [`RefreshTicket::evaluate`]
///   queries the provider and runs the pipeline with no lock held, and
///   [`complete_refresh`](Self::complete_refresh) commits under the lock only
///   if the ticket's generation and version still match. A root removed (or
///   re-added, or refreshed by someone else) in between gets
///   [`EngineError::StaleRefresh`] and its result is dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A root universe was added.
    Registered(SymbolId),
    /// A root universe was removed.
    Unregistered(SymbolId),
    /// A refresh committed; counts of added/removed contracts.
    Refreshed { root: SymbolId, added: usize, removed: usize },
    /// The root's pipeline hit a contract error and will not run again.
    Faulted(SymbolId),
}

/// A standing subscription to the derivative universe of one root.
#[derive(Clone, Debug)]
pub struct RootSubscription {
    root: SymbolId,
    pipeline: FilterPipeline,
    active: BTreeSet<Symbol>,
    created_at: DateTime<Utc>,
    generation: u64,
    version: u64,
    last_refreshed: Option<DateTime<Utc>>,
    fault: Option<String>,
}

impl RootSubscription {
    #[inline] pub fn root(&self) -> &SymbolId { &self.root }
    #[inline] pub fn pipeline(&self) -> &FilterPipeline { &self.pipeline }
    #[inline] pub fn active(&self) -> &BTreeSet<Symbol> { &self.active }
    #[inline] pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    #[inline] pub fn generation(&self) -> u64 { self.generation }
    #[inline] pub fn last_refreshed(&self) -> Option<DateTime<Utc>> { self.last_refreshed }
    #[inline] pub fn fault(&self) -> Option<&str> { self.fault.as_deref() }
}

/// Permission to commit one refresh of one subscription instance.
#[derive(Clone, Debug)]
pub struct RefreshTicket {
    root: SymbolId,
    generation: u64,
    version: u64,
    pipeline: FilterPipeline,
}

impl RefreshTicket {
    #[inline] pub fn root(&self) -> &SymbolId { &self.root }

    /// Query the provider (bounded by `timeout`) and run the pipeline.
    ///
    /// Symbols the provider returns that are not linked to the root are
    /// dropped before filtering.
    pub async fn evaluate(
        &self,
        provider: &dyn ContractUniverseProvider,
        now: DateTime<Utc>,
        reference_price: Option<Decimal>,
        timeout: Duration,
    ) -> EngineResult<BTreeSet<Symbol>> {
        let listed = match tokio::time::timeout(timeout, provider.contracts(&self.root, now)).await {
            Ok(Ok(listed)) => listed,
            Ok(Err(e)) => {
                return Err(EngineError::Provider { root: self.root.clone(), message: format!("{e:#}") });
            }
            Err(_elapsed) => {
                return Err(EngineError::Timeout { root: self.root.clone(), after: timeout });
            }
        };

        let mut universe = BTreeSet::new();
        for s in listed {
            if s.is_linked_to(&self.root) {
                universe.insert(s);
            } else {
                tracing::warn!(root=%self.root, symbol=%s, provider=provider.name(), "provider returned unlinked symbol, dropped");
            }
        }

        let ctx = FilterContext::new(self.root.clone(), now, reference_price);
        self.pipeline.apply(&universe, &ctx)
    }
}

/// Registry of all active root subscriptions.
pub struct SubscriptionRegistry {
    inner: DashMap<SymbolId, RootSubscription>,
    next_generation: AtomicU64,
    tx: broadcast::Sender<RegistryEvent>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self { Self::new() }
}

impl SubscriptionRegistry {
    /// Create a new, empty [`SubscriptionRegistry`].
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { inner: DashMap::new(), next_generation: AtomicU64::new(1), tx }
    }

    /// Start a fresh subscription for `root` with an empty active set.
    ///
    /// Fails with [`EngineError::DuplicateSubscription`] if `root` is active.
    pub fn register(&self, root: &SymbolId, pipeline: FilterPipeline, now: DateTime<Utc>) -> EngineResult<RootSubscription> {
        self.insert(root, pipeline, BTreeSet::new(), now, None)
    }

    /// Re-create a subscription with a known active set and fault state
    /// (snapshot restore).
    pub fn restore(
        &self,
        root: &SymbolId,
        pipeline: FilterPipeline,
        active: BTreeSet<Symbol>,
        created_at: DateTime<Utc>,
        fault: Option<String>,
    ) -> EngineResult<RootSubscription> {
        if let Some(stray) = active.iter().find(|s| !s.is_linked_to(root)) {
            return Err(EngineError::Snapshot(format!("{stray} in active set of {root} is not linked to it")));
        }
        self.insert(root, pipeline, active, created_at, fault)
    }

    fn insert(
        &self,
        root: &SymbolId,
        pipeline: FilterPipeline,
        active: BTreeSet<Symbol>,
        created_at: DateTime<Utc>,
        fault: Option<String>,
    ) -> EngineResult<RootSubscription> {
        match self.inner.entry(root.clone()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateSubscription { root: root.clone() }),
            Entry::Vacant(v) => {
                let sub = RootSubscription {
                    root: root.clone(),
                    pipeline,
                    active,
                    created_at,
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                    version: 0,
                    last_refreshed: None,
                    fault,
                };
                v.insert(sub.clone());
                let _ = self.tx.send(RegistryEvent::Registered(root.clone()));
                Ok(sub)
            }
        }
    }

    /// Remove `root`'s subscription, returning it (with its last active set).
    ///
    /// Not idempotent: a second call fails with [`EngineError::NotFound`].
    pub fn unregister(&self, root: &SymbolId) -> EngineResult<RootSubscription> {
        let (_, sub) = self.inner
            .remove(root)
            .ok_or_else(|| EngineError::NotFound { root: root.clone() })?;
        let _ = self.tx.send(RegistryEvent::Unregistered(root.clone()));
        Ok(sub)
    }

    /// Take a ticket for refreshing `root`.
    pub fn begin_refresh(&self, root: &SymbolId) -> EngineResult<RefreshTicket> {
        let sub = self.inner
            .get(root)
            .ok_or_else(|| EngineError::NotFound { root: root.clone() })?;
        if let Some(reason) = &sub.fault {
            return Err(EngineError::FaultedPipeline { root: root.clone(), reason: reason.clone() });
        }
        Ok(RefreshTicket {
            root: root.clone(),
            generation: sub.generation,
            version: sub.version,
            pipeline: sub.pipeline.clone(),
        })
    }

    /// Commit the outcome of [`RefreshTicket::evaluate`].
    ///
    /// - Stale ticket → [`EngineError::StaleRefresh`], nothing changes.
    /// - Evaluation error → returned as is; the active set is left untouched.
    ///   Contract errors additionally fault the subscription.
    /// - Success → active set replaced, diff returned.
    pub fn complete_refresh(
        &self,
        ticket: RefreshTicket,
        outcome: EngineResult<BTreeSet<Symbol>>,
        now: DateTime<Utc>,
    ) -> EngineResult<SecurityChangeSet> {
        let Some(mut sub) = self.inner.get_mut(&ticket.root) else {
            return Err(EngineError::StaleRefresh { root: ticket.root });
        };
        if sub.generation != ticket.generation || sub.version != ticket.version {
            return Err(EngineError::StaleRefresh { root: ticket.root });
        }

        let next = match outcome {
            Ok(next) => next,
            Err(e) => {
                if e.is_contract_error() {
                    sub.fault = Some(e.to_string());
                    sub.version += 1;
                    let _ = self.tx.send(RegistryEvent::Faulted(ticket.root.clone()));
                }
                return Err(e);
            }
        };

        let diff = SecurityChangeSet::between(&sub.active, &next);
        sub.active = next;
        sub.version += 1;
        sub.last_refreshed = Some(now);
        let _ = self.tx.send(RegistryEvent::Refreshed {
            root: ticket.root,
            added: diff.added.len(),
            removed: diff.removed.len(),
        });
        Ok(diff)
    }

    /// Recompute `root`'s active set and return the diff.
    pub async fn refresh(
        &self,
        root: &SymbolId,
        now: DateTime<Utc>,
        reference_price: Option<Decimal>,
        provider: &dyn ContractUniverseProvider,
        timeout: Duration,
    ) -> EngineResult<SecurityChangeSet> {
        let ticket = self.begin_refresh(root)?;
        let outcome = ticket.evaluate(provider, now, reference_price, timeout).await;
        self.complete_refresh(ticket, outcome, now)
    }

    pub fn get(&self, root: &SymbolId) -> Option<RootSubscription> {
        self.inner.get(root).map(|s| s.value().clone())
    }

    #[inline]
    pub fn contains(&self, root: &SymbolId) -> bool { self.inner.contains_key(root) }

    /// Current active set of `root`; empty if not registered.
    pub fn active_set(&self, root: &SymbolId) -> BTreeSet<Symbol> {
        self.inner.get(root).map(|s| s.active.clone()).unwrap_or_default()
    }

    /// Roots with a live subscription, in id order.
    pub fn active_roots(&self) -> BTreeSet<SymbolId> {
        self.inner.iter().map(|kv| kv.key().clone()).collect()
    }

    /// Point-in-time copy of every subscription, ordered by root.
    pub fn snapshot(&self) -> Vec<RootSubscription> {
        let mut all: Vec<RootSubscription> = self.inner.iter().map(|kv| kv.value().clone()).collect();
        all.sort_by(|a, b| a.root.cmp(&b.root));
        all
    }

    pub fn len(&self) -> usize { self.inner.len() }
    pub fn is_empty(&self) -> bool { self.inner.is_empty() }

    /// Subscribe to a broadcast stream of [`RegistryEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }
}
