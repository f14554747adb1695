//! The federation engine: the public entry points (`Search`,
//! `SearchAll`, `Download`, `DownloadAll`, `ListProductTypes`,
//! `Queryables`). Owns provider ordering, fan-out/fallback, pagination,
//! and the download retry scheduler.

pub mod constraints;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, SessionCache};
use crate::config::{ConfigMap, Topic};
use crate::download::DownloadOptions;
use crate::error::{EodagError, Result};
use crate::model::{Product, Queryables, SearchResult};
use crate::plugin::PluginRegistry;
use crate::provider::ProviderRegistry;
use crate::search::PreparedSearch;

pub use constraints::resolve_constraints;

/// Upper bound on pages `SearchAll` will walk for a single provider,
/// guarding against a misbehaving backend that never reports
/// exhaustion.
const SEARCH_ALL_HARD_CAP: u32 = 10_000;

pub struct Gateway {
    providers: ProviderRegistry,
    plugins: PluginRegistry,
    sessions: SessionCache,
    config: ConfigMap,
}

impl Gateway {
    pub fn new(config: ConfigMap, http_client: reqwest::Client) -> Self {
        Gateway {
            providers: ProviderRegistry::from_config_map(config.clone()),
            plugins: PluginRegistry::new(http_client),
            sessions: SessionCache::default(),
            config,
        }
    }

    /// Takes the registry lock implicitly (the `ProviderRegistry` is not
    /// shared across threads behind `&mut self` here): reconfiguration
    /// always goes through an explicit call, never silent mutation.
    pub fn set_priority(&mut self, provider: &str, priority: i32) -> Result<()> {
        let entry = self
            .config
            .get_mut(provider)
            .ok_or_else(|| EodagError::UnsupportedProvider { provider: provider.to_string() })?;
        entry.update(Some(priority), None);
        self.providers = ProviderRegistry::from_config_map(self.config.clone());
        self.plugins.invalidate_provider(provider);
        Ok(())
    }

    /// Deep-merges `overlay` onto the live provider configuration:
    /// plugin sub-configs are merged field-by-field, non-plugin scalar
    /// fields are overwritten when the incoming side is non-nil, unknown
    /// providers are added outright. Rebuilds the ordered registry from
    /// the merged config and drops any cached plugin instance for a
    /// touched provider, so the next lookup picks up the new settings.
    pub fn update_providers_config(&mut self, overlay: ConfigMap) {
        let touched: Vec<String> = overlay.keys().cloned().collect();
        crate::config::merge_config_maps(&mut self.config, overlay);
        self.providers = ProviderRegistry::from_config_map(self.config.clone());
        for provider in &touched {
            self.plugins.invalidate_provider(provider);
        }
    }

    async fn authenticator_for(&self, provider: &str, topic: Topic) -> Result<Option<Authenticator>> {
        let Some(auth_plugin) = self.plugins.auth_plugin_for(&self.config, provider, topic)? else {
            return Ok(None);
        };
        // Single-flight per (provider, topic): concurrent callers share
        // the same session lock, so only one physical renewal happens.
        let session_key = format!("{provider}:{}", topic.as_str());
        let session = self.sessions.session_for(&session_key).await;
        let _guard = session.lock().await;
        Ok(Some(auth_plugin.authenticate().await?))
    }

    /// `Search`: if `provider` is given, try only that provider; else
    /// iterate candidates in priority order, falling back past
    /// authentication/request/timeout failures. `Misconfigured`,
    /// `Validation`, `PluginImplementation`, and the lookup-miss
    /// `Unsupported*` errors are structural, not per-provider flukes, so
    /// they return immediately instead of trying the next candidate.
    pub async fn search(
        &self,
        product_type: &str,
        page: u32,
        items_per_page: u32,
        count: bool,
        kwargs: BTreeMap<String, Value>,
        provider: Option<&str>,
    ) -> Result<SearchResult> {
        let product_type = self.providers.resolve_product_type_alias(product_type);
        let product_type = product_type.as_str();
        let candidates: Vec<String> = match provider {
            Some(name) => vec![name.to_string()],
            None => self
                .providers
                .filter_by_product_type(product_type)
                .into_iter()
                .map(|p| p.name.clone())
                .collect(),
        };
        if candidates.is_empty() {
            return Err(EodagError::UnsupportedProductType { product_type: product_type.to_string() });
        }

        let mut first_error = None;
        for provider_name in &candidates {
            let provider_config = self
                .providers
                .get(provider_name)
                .ok_or_else(|| EodagError::UnsupportedProvider { provider: provider_name.clone() })?;
            let provider_product_type = provider_config
                .products
                .get(product_type)
                .and_then(|p| p.product_type.clone())
                .unwrap_or_else(|| product_type.to_string());

            let mut prep = PreparedSearch::new(product_type, provider_product_type);
            prep.page = page;
            prep.items_per_page = items_per_page;
            prep.count = count;
            prep.kwargs = kwargs.clone();

            match self.search_one(provider_name, &prep).await {
                Ok(mut result) => {
                    for product in &mut result.products {
                        product.downloader = Some(crate::model::PluginRef { provider: provider_name.clone(), plugin_type: "download".to_string() });
                        product.downloader_auth =
                            Some(crate::model::PluginRef { provider: provider_name.clone(), plugin_type: "download_auth".to_string() });
                    }
                    return Ok(result);
                }
                Err(
                    err @ (EodagError::Misconfigured { .. }
                    | EodagError::Validation { .. }
                    | EodagError::PluginImplementation { .. }
                    | EodagError::UnsupportedProvider { .. }
                    | EodagError::UnsupportedProductType { .. }
                    | EodagError::UnsupportedDatasetAddressScheme { .. }),
                ) => {
                    return Err(err);
                }
                Err(err @ EodagError::Authentication { .. }) if candidates.len() > 1 => {
                    tracing::warn!(provider = %provider_name, "authentication failed, trying next provider");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    if candidates.len() == 1 {
                        break;
                    }
                }
            }
        }
        Err(first_error.unwrap_or_else(|| EodagError::UnsupportedProductType { product_type: product_type.to_string() }))
    }

    async fn search_one(&self, provider: &str, prep: &PreparedSearch) -> Result<SearchResult> {
        if let Some(api_plugin) = self.plugins.api_plugin_for(&self.config, provider)? {
            let (products, total) = api_plugin.query(prep).await?;
            return Ok(SearchResult::new(products, total));
        }
        let search_plugin = self.plugins.search_plugin_for(&self.config, provider)?;
        let authenticator = self.authenticator_for(provider, Topic::SearchAuth).await?;
        let (products, total) = search_plugin.query(prep, authenticator.as_ref()).await?;
        Ok(SearchResult::new(products, total))
    }

    /// `SearchAll`: walks pages transparently until the provider reports
    /// exhaustion (fewer than a full page returned) or the hard cap.
    pub async fn search_all(
        &self,
        product_type: &str,
        items_per_page: u32,
        kwargs: BTreeMap<String, Value>,
        provider: Option<&str>,
    ) -> Result<SearchResult> {
        self.search_all_cancellable(product_type, items_per_page, kwargs, provider, None).await
    }

    /// `SearchAll` with an explicit cancellation handle, checked between
    /// page fetches so a caller can stop an unbounded walk early.
    pub async fn search_all_cancellable(
        &self,
        product_type: &str,
        items_per_page: u32,
        kwargs: BTreeMap<String, Value>,
        provider: Option<&str>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<SearchResult> {
        let mut aggregate = SearchResult::default();
        let mut page = 1;
        loop {
            if cancellation.is_some_and(|t| t.is_cancelled()) {
                tracing::warn!(%product_type, page, "search_all cancelled");
                break;
            }
            let page_result = self.search(product_type, page, items_per_page, false, kwargs.clone(), provider).await?;
            let page_len = page_result.len();
            aggregate = aggregate.merge(page_result);
            if page_len < items_per_page as usize || page >= SEARCH_ALL_HARD_CAP {
                break;
            }
            page += 1;
        }
        Ok(aggregate)
    }

    /// `Download`: simple delegation to the product's assigned
    /// downloader.
    pub async fn download(&self, product: &mut Product, options: &DownloadOptions) -> Result<std::path::PathBuf> {
        let provider = product
            .downloader
            .as_ref()
            .map(|r| r.provider.clone())
            .ok_or_else(|| EodagError::misconfigured(&product.provider, "product has no assigned downloader"))?;
        if let Some(api_plugin) = self.plugins.api_plugin_for(&self.config, &provider)? {
            return api_plugin.download(product, options).await;
        }
        let download_plugin = self.plugins.download_plugin_for(&self.config, &provider)?;
        let authenticator = self.authenticator_for(&provider, Topic::DownloadAuth).await?;
        download_plugin.download(product, authenticator.as_ref(), options).await
    }

    /// `DownloadAll`: a retry scheduler with a per-product `next_try`
    /// timestamp. On `NotAvailableError` the product is requeued with a
    /// bumped `next_try`; on `AuthenticationError`/`MisconfiguredError`
    /// the whole batch aborts; any other error is logged and that
    /// product is dropped. Returns paths in completion order, not input
    /// order.
    pub async fn download_all(&self, products: Vec<Product>, wait: Duration, timeout: Duration, options: &DownloadOptions) -> Result<Vec<std::path::PathBuf>> {
        let deadline = Instant::now() + timeout;
        let mut queue: VecDeque<(Product, Instant)> = products.into_iter().map(|p| (p, Instant::now())).collect();
        let mut completed = Vec::new();

        while let Some((mut product, next_try)) = queue.pop_front() {
            if Instant::now() >= deadline {
                tracing::warn!("DownloadAll deadline reached with {} products still pending", queue.len() + 1);
                break;
            }
            if options.cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
                tracing::warn!("DownloadAll cancelled with {} products still pending", queue.len() + 1);
                break;
            }
            if Instant::now() < next_try {
                queue.push_back((product, next_try));
                if queue.iter().all(|(_, t)| *t > Instant::now()) {
                    let shortest_wait = queue.iter().map(|(_, t)| *t).min().unwrap_or(Instant::now());
                    tokio::time::sleep_until(tokio::time::Instant::from_std(shortest_wait.min(deadline))).await;
                }
                continue;
            }

            match self.download(&mut product, options).await {
                Ok(path) => completed.push(path),
                Err(EodagError::NotAvailable { .. }) => {
                    queue.push_back((product, Instant::now() + wait));
                }
                Err(err @ (EodagError::Authentication { .. } | EodagError::Misconfigured { .. })) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(title = %product.title, error = %err, "download failed, continuing with remaining products");
                }
            }
        }
        Ok(completed)
    }

    pub fn list_product_types(&self, provider: Option<&str>) -> Vec<String> {
        let mut types: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        let providers = match provider {
            Some(name) => self.providers.get(name).into_iter().collect(),
            None => self.providers.ordered(),
        };
        for provider_config in providers {
            types.extend(provider_config.products.keys().cloned());
        }
        types.into_iter().collect()
    }

    /// `Queryables`: union of common queryables and provider-declared
    /// queryables, layering provider-specific defaults on top.
    pub fn queryables(&self, product_type: &str, provider: Option<&str>) -> Queryables {
        let mut queryables = Queryables::with_defaults();
        let providers = match provider {
            Some(name) => self.providers.get(name).into_iter().collect(),
            None => self.providers.filter_by_product_type(product_type),
        };
        for provider_config in providers {
            let Some(search_config) = &provider_config.search else { continue };
            for key in search_config.metadata_mapping.iter().filter(|(_, m)| m.is_queryable()).map(|(k, _)| k) {
                queryables.properties.entry(key.clone()).or_insert_with(|| crate::model::QueryableAnnotation {
                    base_type: "string".to_string(),
                    alias: None,
                    default: None,
                    required: false,
                    description: None,
                });
            }
        }
        queryables
    }

    /// Fans out `Download` across an already-built set of products with
    /// a bound on concurrent in-flight transfers, matching the teacher's
    /// `buffer_unordered` parallel-download pattern.
    pub async fn download_many_bounded(&self, mut products: Vec<Product>, options: DownloadOptions, max_parallel: usize) -> Vec<Result<std::path::PathBuf>> {
        let gateway = self;
        let options = Arc::new(options);
        stream::iter(products.drain(..))
            .map(|mut product| {
                let options = options.clone();
                async move { gateway.download(&mut product, &options).await }
            })
            .buffer_unordered(max_parallel)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginConfig, ProviderConfig};

    fn provider(name: &str, priority: i32, endpoint: &str) -> ProviderConfig {
        let mut extra = BTreeMap::new();
        extra.insert("endpoint".to_string(), Value::String(endpoint.to_string()));
        ProviderConfig {
            name: name.to_string(),
            priority,
            description: None,
            url: None,
            roles: vec![],
            group: None,
            products: BTreeMap::new(),
            api: None,
            search: Some(PluginConfig {
                plugin_type: "QueryStringSearch".to_string(),
                credentials: BTreeMap::new(),
                metadata_mapping: BTreeMap::new(),
                pagination: None,
                literal_search_params: BTreeMap::new(),
                free_text_search_operations: None,
                extra,
            }),
            download: None,
            auth: None,
            search_auth: None,
            download_auth: None,
        }
    }

    #[test]
    fn update_providers_config_merges_field_by_field_and_preserves_unmentioned_fields() {
        let config = BTreeMap::from([("A".to_string(), provider("A", 1, "https://a/search"))]);
        let mut gateway = Gateway::new(config, reqwest::Client::new());

        let mut overlay_provider = provider("A", 5, "https://a/search");
        overlay_provider.search.as_mut().unwrap().extra.remove("endpoint");
        overlay_provider.search.as_mut().unwrap().extra.insert("timeout".to_string(), Value::from(30));
        let overlay = BTreeMap::from([("A".to_string(), overlay_provider)]);

        gateway.update_providers_config(overlay);

        let merged = gateway.providers.get("A").unwrap();
        assert_eq!(merged.priority, 5);
        let search = merged.search.as_ref().unwrap();
        assert_eq!(search.extra.get("endpoint").unwrap(), "https://a/search");
        assert_eq!(search.extra.get("timeout").unwrap(), &Value::from(30));
    }

    #[test]
    fn update_providers_config_adds_unknown_providers() {
        let config = BTreeMap::from([("A".to_string(), provider("A", 1, "https://a/search"))]);
        let mut gateway = Gateway::new(config, reqwest::Client::new());

        let overlay = BTreeMap::from([("B".to_string(), provider("B", 1, "https://b/search"))]);
        gateway.update_providers_config(overlay);

        assert!(gateway.providers.get("B").is_some());
    }
}
