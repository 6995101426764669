use std::sync::Arc;
use dashmap::DashMap;
use crate::engine_core::errors::{EngineError, EngineResult};
use crate::universes::filters::ContractSelector;
use crate::universes::inbuilt::latest_expiry::LatestExpiryNearestStrike;

/// Named selectors available to declarative filter specs.
///
/// Config files and snapshots refer to custom selectors by name; the catalog
/// turns that name back into the selector. Seeded with the inbuilt
/// selectors by [`SelectorCatalog::with_defaults`].
#[derive(Default)]
pub struct SelectorCatalog {
    selectors: DashMap<String, Arc<dyn ContractSelector>>,
}

impl SelectorCatalog {
    pub fn new() -> Self { Self::default() }

    pub fn with_defaults() -> Self {
        let catalog = Self::new();
        catalog.register(Arc::new(LatestExpiryNearestStrike::puts()));
        catalog.register(Arc::new(LatestExpiryNearestStrike::calls()));
        catalog
    }

    /// Register under the selector's own name, replacing any previous entry.
    pub fn register(&self, selector: Arc<dyn ContractSelector>) {
        let name = selector.name().to_string();
        if self.selectors.insert(name.clone(), selector).is_some() {
            tracing::warn!(selector=%name, "replaced selector in catalog");
        }
    }

    pub fn get(&self, name: &str) -> EngineResult<Arc<dyn ContractSelector>> {
        self.selectors
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| EngineError::Config(format!("unknown selector {name:?}")))
    }

    pub fn contains(&self, name: &str) -> bool { self.selectors.contains_key(name) }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.selectors.iter().map(|kv| kv.key().clone()).collect();
        names.sort();
        names
    }
}
