//! Ordered provider registry. Iteration order is priority descending,
//! ties broken by insertion order — this is the order the gateway tries
//! providers in for a given product type.

use std::collections::BTreeMap;

use crate::config::{ConfigMap, ProviderConfig};
use crate::error::{EodagError, Result};

pub struct ProviderRegistry {
    providers: ConfigMap,
    /// Insertion sequence numbers, used only to break priority ties
    /// deterministically (first-registered wins).
    insertion_order: BTreeMap<String, usize>,
    next_sequence: usize,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry { providers: ConfigMap::new(), insertion_order: BTreeMap::new(), next_sequence: 0 }
    }

    pub fn from_config_map(config: ConfigMap) -> Self {
        let mut registry = ProviderRegistry::new();
        for (_, provider) in config {
            registry.add(provider);
        }
        registry
    }

    pub fn add(&mut self, provider: ProviderConfig) {
        if !self.insertion_order.contains_key(&provider.name) {
            self.insertion_order.insert(provider.name.clone(), self.next_sequence);
            self.next_sequence += 1;
        }
        self.providers.insert(provider.name.clone(), provider);
    }

    pub fn remove(&mut self, name: &str) -> Option<ProviderConfig> {
        self.insertion_order.remove(name);
        self.providers.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Restricts the registry in place to `names`, erroring if any named
    /// provider is unknown (fail loud rather than silently ignore a
    /// typo'd whitelist entry).
    pub fn whitelist(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            if !self.providers.contains_key(name) {
                return Err(EodagError::UnsupportedProvider { provider: name.clone() });
            }
        }
        let allowed: std::collections::HashSet<&str> = names.iter().map(String::as_str).collect();
        self.providers.retain(|name, _| allowed.contains(name.as_str()));
        self.insertion_order.retain(|name, _| allowed.contains(name.as_str()));
        Ok(())
    }

    /// Providers declaring a plugin under the given topic, ordered by
    /// priority descending with insertion-order tie-breaking.
    pub fn filter_by_topic(&self, topic: crate::config::Topic) -> Vec<&ProviderConfig> {
        self.ordered().into_iter().filter(|p| p.plugin_config(topic).is_some()).collect()
    }

    /// Providers supporting `product_type`, in priority order.
    pub fn filter_by_product_type(&self, product_type: &str) -> Vec<&ProviderConfig> {
        self.ordered().into_iter().filter(|p| p.supports_product_type(product_type)).collect()
    }

    /// Resolves a user-facing alias to the collection id that declares
    /// it; returns `query` unchanged when no provider's `products` entry
    /// claims it as an alias (it's already a canonical id, or unknown).
    pub fn resolve_product_type_alias(&self, query: &str) -> String {
        for provider in self.providers.values() {
            for (id, product_type_config) in &provider.products {
                if product_type_config.alias.as_deref() == Some(query) {
                    return id.clone();
                }
            }
        }
        query.to_string()
    }

    pub fn ordered(&self) -> Vec<&ProviderConfig> {
        let mut providers: Vec<&ProviderConfig> = self.providers.values().collect();
        providers.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| self.insertion_order[&a.name].cmp(&self.insertion_order[&b.name]))
        });
        providers
    }

    /// Copies the `auth`/`search_auth`/`download_auth` credentials of
    /// `source` onto `target`, e.g. two providers backed by the same
    /// Copernicus Dataspace account. Errs if either provider is unknown,
    /// rather than silently doing nothing (spec §9 open question:
    /// `share_credentials` ambiguity is rejected, not guessed).
    pub fn share_credentials(&mut self, source: &str, target: &str) -> Result<()> {
        let source_provider = self
            .providers
            .get(source)
            .ok_or_else(|| EodagError::UnsupportedProvider { provider: source.to_string() })?
            .clone();
        let target_provider = self
            .providers
            .get_mut(target)
            .ok_or_else(|| EodagError::UnsupportedProvider { provider: target.to_string() })?;

        for (source_slot, target_slot) in [
            (&source_provider.auth, &mut target_provider.auth),
            (&source_provider.search_auth, &mut target_provider.search_auth),
            (&source_provider.download_auth, &mut target_provider.download_auth),
        ] {
            if let (Some(source_plugin), Some(target_plugin)) = (source_slot, target_slot) {
                target_plugin.credentials = source_plugin.credentials.clone();
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        ProviderRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topic;

    fn provider(name: &str, priority: i32) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            priority,
            description: None,
            url: None,
            roles: vec![],
            group: None,
            products: BTreeMap::new(),
            api: None,
            search: Some(crate::config::PluginConfig {
                plugin_type: "QueryStringSearch".to_string(),
                credentials: BTreeMap::new(),
                metadata_mapping: BTreeMap::new(),
                pagination: None,
                literal_search_params: BTreeMap::new(),
                free_text_search_operations: None,
                extra: BTreeMap::new(),
            }),
            download: None,
            auth: None,
            search_auth: None,
            download_auth: None,
        }
    }

    #[test]
    fn ordered_sorts_by_priority_descending_with_insertion_tiebreak() {
        let mut registry = ProviderRegistry::new();
        registry.add(provider("low", 1));
        registry.add(provider("first-mid", 5));
        registry.add(provider("second-mid", 5));
        registry.add(provider("high", 10));
        let names: Vec<&str> = registry.ordered().into_iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["high", "first-mid", "second-mid", "low"]);
    }

    #[test]
    fn whitelist_rejects_unknown_provider() {
        let mut registry = ProviderRegistry::new();
        registry.add(provider("A", 0));
        assert!(registry.whitelist(&["A".to_string(), "ghost".to_string()]).is_err());
    }

    #[test]
    fn whitelist_restricts_to_named_providers() {
        let mut registry = ProviderRegistry::new();
        registry.add(provider("A", 0));
        registry.add(provider("B", 0));
        registry.whitelist(&["A".to_string()]).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("A").is_some());
    }

    #[test]
    fn resolve_product_type_alias_finds_declaring_collection() {
        let mut registry = ProviderRegistry::new();
        let mut a = provider("A", 0);
        a.products.insert(
            "SENTINEL2_L1C".to_string(),
            crate::config::ProductTypeConfig { alias: Some("s2".to_string()), ..Default::default() },
        );
        registry.add(a);
        assert_eq!(registry.resolve_product_type_alias("s2"), "SENTINEL2_L1C");
        assert_eq!(registry.resolve_product_type_alias("unknown"), "unknown");
    }

    #[test]
    fn filter_by_topic_only_returns_declaring_providers() {
        let mut registry = ProviderRegistry::new();
        registry.add(provider("A", 0));
        let mut no_search = provider("B", 0);
        no_search.search = None;
        no_search.download = Some(crate::config::PluginConfig {
            plugin_type: "HTTPDownload".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra: BTreeMap::new(),
        });
        registry.add(no_search);
        let searchers = registry.filter_by_topic(Topic::Search);
        assert_eq!(searchers.len(), 1);
        assert_eq!(searchers[0].name, "A");
    }
}
