//! Plugin registry: given a provider's configuration, instantiates and
//! caches `AuthPlugin`/`SearchPlugin`/`DownloadPlugin` trait objects
//! keyed by `(provider, topic)`. Re-reading a provider's config after a
//! priority change drops the stale cache entry so the next lookup
//! rebuilds from the fresh config (see spec §4.2).

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::api::{self, SharedApiPlugin};
use crate::auth::{self, SharedAuthPlugin};
use crate::config::{ConfigMap, PluginConfig, Topic};
use crate::download::{self, SharedDownloadPlugin};
use crate::error::{EodagError, Result};
use crate::search::{self, SharedSearchPlugin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CacheKey {
    Auth,
    Search,
    Download,
}

/// Guarded by `std::sync::RwLock` rather than an async lock: plugin
/// construction itself does no I/O, only the plugins' own calls do.
pub struct PluginRegistry {
    http_client: reqwest::Client,
    auth_cache: RwLock<BTreeMap<(String, Topic), SharedAuthPlugin>>,
    search_cache: RwLock<BTreeMap<String, SharedSearchPlugin>>,
    download_cache: RwLock<BTreeMap<String, SharedDownloadPlugin>>,
    api_cache: RwLock<BTreeMap<String, SharedApiPlugin>>,
}

impl PluginRegistry {
    pub fn new(http_client: reqwest::Client) -> Self {
        PluginRegistry {
            http_client,
            auth_cache: RwLock::new(BTreeMap::new()),
            search_cache: RwLock::new(BTreeMap::new()),
            download_cache: RwLock::new(BTreeMap::new()),
            api_cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Drops every cached instance for `provider`, forcing rebuilds from
    /// the now-current config on next lookup (priority/credentials
    /// updates call this).
    pub fn invalidate_provider(&self, provider: &str) {
        self.auth_cache.write().unwrap().retain(|(p, _), _| p != provider);
        self.search_cache.write().unwrap().remove(provider);
        self.download_cache.write().unwrap().remove(provider);
        self.api_cache.write().unwrap().remove(provider);
    }

    /// `None` when the provider declares no `api` plugin (the common
    /// case of separate search/download/auth topics).
    pub fn api_plugin_for(&self, config: &ConfigMap, provider: &str) -> Result<Option<SharedApiPlugin>> {
        let provider_config = config
            .get(provider)
            .ok_or_else(|| EodagError::UnsupportedProvider { provider: provider.to_string() })?;
        let Some(plugin_config) = provider_config.api.as_ref() else { return Ok(None) };

        if let Some(cached) = self.api_cache.read().unwrap().get(provider) {
            return Ok(Some(cached.clone()));
        }
        let plugin = api::build(provider, plugin_config)?;
        self.api_cache.write().unwrap().insert(provider.to_string(), plugin.clone());
        Ok(Some(plugin))
    }

    pub fn auth_plugin_for(&self, config: &ConfigMap, provider: &str, topic: Topic) -> Result<Option<SharedAuthPlugin>> {
        let provider_config = config
            .get(provider)
            .ok_or_else(|| EodagError::UnsupportedProvider { provider: provider.to_string() })?;
        let Some(plugin_config) = provider_config.plugin_config(topic) else { return Ok(None) };

        if let Some(cached) = self.auth_cache.read().unwrap().get(&(provider.to_string(), topic)) {
            return Ok(Some(cached.clone()));
        }
        let plugin = self.build_auth(plugin_config)?;
        self.auth_cache.write().unwrap().insert((provider.to_string(), topic), plugin.clone());
        Ok(Some(plugin))
    }

    fn build_auth(&self, plugin_config: &PluginConfig) -> Result<SharedAuthPlugin> {
        auth::build(plugin_config, self.http_client.clone())
    }

    pub fn search_plugin_for(&self, config: &ConfigMap, provider: &str) -> Result<SharedSearchPlugin> {
        if let Some(cached) = self.search_cache.read().unwrap().get(provider) {
            return Ok(cached.clone());
        }
        let provider_config = config
            .get(provider)
            .ok_or_else(|| EodagError::UnsupportedProvider { provider: provider.to_string() })?;
        let plugin_config = provider_config
            .search
            .as_ref()
            .ok_or_else(|| EodagError::misconfigured(provider, "provider declares no search plugin"))?;
        let plugin = search::build(provider, plugin_config, self.http_client.clone())?;
        self.search_cache.write().unwrap().insert(provider.to_string(), plugin.clone());
        Ok(plugin)
    }

    pub fn download_plugin_for(&self, config: &ConfigMap, provider: &str) -> Result<SharedDownloadPlugin> {
        if let Some(cached) = self.download_cache.read().unwrap().get(provider) {
            return Ok(cached.clone());
        }
        let provider_config = config
            .get(provider)
            .ok_or_else(|| EodagError::UnsupportedProvider { provider: provider.to_string() })?;
        let plugin_config = provider_config
            .download
            .as_ref()
            .ok_or_else(|| EodagError::misconfigured(provider, "provider declares no download plugin"))?;
        let plugin = download::build(provider, plugin_config, self.http_client.clone())?;
        self.download_cache.write().unwrap().insert(provider.to_string(), plugin.clone());
        Ok(plugin)
    }
}
