//! Resolves which consumers of a provider may see its instances.

use std::collections::HashSet;
use std::sync::Arc;

use lodestone_core::{RegistryStore, Result, Rule};
use tracing::debug;

use crate::index_cache::IndexCache;
use crate::rules::RuleEngine;

pub struct ConsumerResolver {
    store: Arc<dyn RegistryStore>,
    index: Arc<IndexCache>,
    engine: RuleEngine,
}

impl ConsumerResolver {
    pub fn new(store: Arc<dyn RegistryStore>, index: Arc<IndexCache>) -> Self {
        Self {
            store,
            index,
            engine: RuleEngine::new(),
        }
    }

    /// Consumer ids that declared a dependency on `provider_id`, first-seen order.
    pub fn consumer_ids(&self, provider_id: &str) -> Vec<String> {
        let members = self.index.get(provider_id).unwrap_or_default();
        let mut seen = HashSet::with_capacity(members.len());
        members
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    /// Splits the provider's consumers into (allowed, denied) under `rules`.
    pub fn partition(&self, provider_id: &str, rules: &[Rule]) -> Result<(Vec<String>, Vec<String>)> {
        let ids = self.consumer_ids(provider_id);
        if ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        self.engine
            .filter_all(&ids, rules, |consumer_id| self.store.get_service(consumer_id))
    }

    /// Consumers currently allowed to see `provider_id`.
    pub fn allowed_consumers(&self, provider_id: &str) -> Result<Vec<String>> {
        let rules = self.store.get_rules(provider_id)?;
        let (allow, deny) = self.partition(provider_id, &rules)?;
        if !deny.is_empty() {
            debug!(
                "{} consumers of provider {} are denied by rules",
                deny.len(),
                provider_id
            );
        }
        Ok(allow)
    }
}
