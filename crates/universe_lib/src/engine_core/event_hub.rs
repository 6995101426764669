use std::sync::Arc;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use crate::engine_core::correlator::CorrelationReport;
use crate::securities::symbols::SymbolId;
use crate::universes::models::SecurityChangeSet;

/// The "securities changed" notification: one per lifecycle tick, empty or not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritiesChanged {
    pub time: DateTime<Utc>,
    pub changes: SecurityChangeSet,
}

#[derive(Clone)]
struct Topic<T: Clone + Send + 'static> {
    tx: broadcast::Sender<T>,
    snap: watch::Sender<Option<T>>, // last value (snapshot), optional
}

impl<T: Clone + Send + 'static> Topic<T> {
    fn new(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        let (snap, _) = watch::channel(None);
        Self { tx, snap }
    }

    fn publish(&self, v: T) {
        let _ = self.tx.send(v.clone());
        // send_replace stores the value even while nobody is watching
        self.snap.send_replace(Some(v));
    }
}

/// EventHub: in-process pub/sub for lifecycle output.
///
/// Topics:
/// - **changes**: every [`SecuritiesChanged`], one per tick.
/// - **per-root changes**: the slice of a tick's change set belonging to one
///   root, only published when that slice is non-empty. Created lazily.
/// - **correlation**: every [`CorrelationReport`] from a data batch.
///
/// Each topic has a lossy **broadcast** stream and a `watch` **snapshot**
/// holding the latest value (`None` until the first publish). Publishing
/// never blocks and ignores the absence of receivers.
#[derive(Clone)]
pub struct EventHub {
    changes: Topic<SecuritiesChanged>,
    correlation: Topic<CorrelationReport>,
    per_root_changes: Arc<DashMap<SymbolId, Topic<SecuritiesChanged>>>,
}

impl Default for EventHub {
    fn default() -> Self { Self::new() }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            changes: Topic::new(1024),
            correlation: Topic::new(1024),
            per_root_changes: Arc::new(DashMap::new()),
        }
    }

    /// Publish a tick's consolidated change set to the global topic and the
    /// per-root topics it touches.
    pub fn publish_changes(&self, v: SecuritiesChanged) {
        let mut by_root: std::collections::BTreeMap<SymbolId, SecurityChangeSet> = Default::default();
        for s in &v.changes.added {
            if let Some(root) = s.underlying() {
                by_root.entry(root.clone()).or_default().added.insert(s.clone());
            }
        }
        for s in &v.changes.removed {
            if let Some(root) = s.underlying() {
                by_root.entry(root.clone()).or_default().removed.insert(s.clone());
            }
        }
        for (root, changes) in by_root {
            let topic = self.per_root_changes
                .entry(root)
                .or_insert_with(|| Topic::new(256))
                .clone();
            topic.publish(SecuritiesChanged { time: v.time, changes });
        }
        self.changes.publish(v);
    }

    pub fn publish_correlation(&self, v: CorrelationReport) {
        self.correlation.publish(v);
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<SecuritiesChanged> {
        self.changes.tx.subscribe()
    }

    /// Changes for one root only. The topic is created if it does not exist yet.
    pub fn subscribe_root_changes(&self, root: &SymbolId) -> broadcast::Receiver<SecuritiesChanged> {
        self.per_root_changes
            .entry(root.clone())
            .or_insert_with(|| Topic::new(256))
            .tx
            .subscribe()
    }

    pub fn subscribe_correlation(&self) -> broadcast::Receiver<CorrelationReport> {
        self.correlation.tx.subscribe()
    }

    /// Latest change notification, then updates.
    pub fn snapshot_changes(&self) -> watch::Receiver<Option<SecuritiesChanged>> {
        self.changes.snap.subscribe()
    }

    pub fn snapshot_correlation(&self) -> watch::Receiver<Option<CorrelationReport>> {
        self.correlation.snap.subscribe()
    }
}
