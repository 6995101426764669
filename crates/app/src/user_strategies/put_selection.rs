use std::collections::BTreeSet;
use std::sync::Arc;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use universe_lib::engine_core::config::{EngineConfig, ScheduleRuleConfig, UniverseConfig, WindowConfig};
use universe_lib::engine_core::event_hub::EventHub;
use universe_lib::engine_core::scheduler::{ActionKind, DateRule, TimeRule};
use universe_lib::securities::symbols::SymbolId;

/// Rolling protective-put book: hold the latest-expiry put nearest the money
/// on TWX from the 5th to the 6th of June 2014, and on AAPL from half an hour
/// after the open on the 5th until the open on the 9th.
pub fn demo_config() -> EngineConfig {
    let day = |d: u32| NaiveDate::from_ymd_opt(2014, 6, d);
    let universe = |root: &str| UniverseConfig {
        root: SymbolId::from(root),
        expiration_window: Some(WindowConfig { min_days: 0, max_days: 180 }),
        stages: Vec::new(),
        selector: Some("latest_expiry_nearest_put".to_string()),
    };
    let rule = |root: &str, action, date: Option<NaiveDate>, time| {
        date.map(|d| ScheduleRuleConfig { root: SymbolId::from(root), action, date: DateRule::On(d), time })
    };

    EngineConfig {
        universes: vec![universe("TWX"), universe("AAPL")],
        schedule: [
            rule("TWX", ActionKind::Add, day(5), TimeRule::Midnight),
            rule("TWX", ActionKind::Remove, day(6), TimeRule::Midnight),
            rule("AAPL", ActionKind::Add, day(5), TimeRule::AfterMarketOpen(30)),
            rule("AAPL", ActionKind::Remove, day(9), TimeRule::AfterMarketOpen(0)),
        ]
        .into_iter()
        .flatten()
        .collect(),
        ..EngineConfig::default()
    }
}

/// Follows the engine's change notifications and keeps the contracts held
/// per root.
///
/// One listener task per watched root, like one worker per subscribed symbol.
pub struct PutSelectionMonitor {
    tasks: DashMap<SymbolId, tokio::task::JoinHandle<()>>,
    held: Arc<DashMap<SymbolId, BTreeSet<SymbolId>>>,
}

impl PutSelectionMonitor {
    pub fn new() -> Self {
        Self { tasks: DashMap::new(), held: Arc::new(DashMap::new()) }
    }

    pub fn watch(&self, hub: &EventHub, root: &SymbolId) {
        let mut rx = hub.subscribe_root_changes(root);
        let held = self.held.clone();
        let root_key = root.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(evt) => {
                        let mut book = held.entry(root_key.clone()).or_default();
                        for s in &evt.changes.removed {
                            book.remove(s.id());
                            tracing::info!(root=%root_key, contract=%s, time=%evt.time, "closed protective put");
                        }
                        for s in &evt.changes.added {
                            book.insert(s.id().clone());
                            tracing::info!(
                                root=%root_key,
                                contract=%s,
                                expiry=?s.expiry(),
                                strike=?s.strike(),
                                time=%evt.time,
                                "opened protective put"
                            );
                        }
                    }
                    Err(RecvError::Lagged(n)) => tracing::warn!(root=%root_key, skipped=n, "monitor lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.tasks.insert(root.clone(), handle) {
            old.abort();
        }
    }

    /// Log roots whose option group went missing from a data batch.
    pub fn watch_correlation(&self, hub: &EventHub) {
        let mut rx = hub.subscribe_correlation();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(report) => {
                        for root in report.missing() {
                            tracing::debug!(%root, time=%report.time, "no option data for root in batch");
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.tasks.insert(SymbolId::from("*correlation*"), handle) {
            old.abort();
        }
    }

    pub fn held(&self, root: &SymbolId) -> Vec<SymbolId> {
        self.held.get(root).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn stop(&self) {
        for kv in self.tasks.iter() {
            kv.value().abort();
        }
        self.tasks.clear();
    }
}

impl Default for PutSelectionMonitor {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use universe_lib::universes::catalog::SelectorCatalog;

    #[test]
    fn demo_config_is_valid() {
        let cfg = demo_config();
        cfg.validate(&SelectorCatalog::with_defaults()).unwrap();
        assert_eq!(cfg.schedule.len(), 4);
    }
}
