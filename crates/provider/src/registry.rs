//! Startup-time adapter registry.

use std::collections::HashMap;
use std::sync::Arc;

use genqueue_core::ProviderId;

use crate::adapter::ProviderAdapter;

/// Process-wide mapping from provider id to adapter implementation.
///
/// Populated once at startup from configuration and read-only afterwards
/// (share it behind an `Arc`). Dispatch is a plain map lookup; there is no
/// runtime fallback chain.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under a provider id. Last registration wins.
    pub fn register(
        &mut self,
        provider_id: impl Into<ProviderId>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> &mut Self {
        self.adapters.insert(provider_id.into(), adapter);
        self
    }

    pub fn get(&self, provider_id: &ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    pub fn contains(&self, provider_id: &ProviderId) -> bool {
        self.adapters.contains_key(provider_id)
    }

    /// Provider ids with a registered adapter.
    pub fn providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.adapters.keys()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
