//! Api plugins: a provider may declare a single `api` plugin instead of
//! separate `search`/`download`/`auth` plugins when its wire protocol
//! doesn't decompose that way (a vendor SDK that owns both query and
//! fetch behind one client). `config::ProviderConfig::validate` already
//! rejects a provider that mixes `api` with any other topic.
//!
//! This crate carries the seam, not any vendor SDK: `GenericApiPlugin`
//! is a no-network stub a concrete deployment fills in with fetch/query
//! hooks, the same shape as `download::library::LibraryBackedDownloadPlugin`
//! (see spec §1 Non-goals: "does not re-implement provider-side business
//! logic").

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PluginConfig;
use crate::download::DownloadOptions;
use crate::error::{EodagError, Result};
use crate::model::Product;
use crate::search::PreparedSearch;

/// Common interface for providers whose plugin handles both querying
/// and fetching behind one opaque client.
#[async_trait]
pub trait ApiPlugin: Send + Sync {
    fn plugin_type(&self) -> &'static str;

    async fn query(&self, prep: &PreparedSearch) -> Result<(Vec<Product>, Option<u64>)>;

    async fn download(&self, product: &mut Product, options: &DownloadOptions) -> Result<PathBuf>;
}

pub type SharedApiPlugin = Arc<dyn ApiPlugin>;

pub fn build(provider: &str, config: &PluginConfig) -> Result<SharedApiPlugin> {
    match config.plugin_type.as_str() {
        "GenericApiPlugin" => Ok(Arc::new(GenericApiPlugin::from_config(provider, config)?)),
        other => Err(EodagError::misconfigured(provider, format!("unknown api plugin type {other:?}"))),
    }
}

pub type ApiQueryFetch = Arc<dyn Fn(&PreparedSearch) -> Result<(Vec<Product>, Option<u64>)> + Send + Sync>;
pub type ApiDownloadFetch = Arc<dyn Fn(&Product) -> Result<PathBuf> + Send + Sync>;

/// No-network stub: `query`/`download` fail with `Unsupported` until a
/// concrete deployment supplies both hooks via `with_hooks`.
pub struct GenericApiPlugin {
    provider: String,
    query_hook: Option<ApiQueryFetch>,
    download_hook: Option<ApiDownloadFetch>,
}

impl GenericApiPlugin {
    pub fn from_config(provider: &str, _config: &PluginConfig) -> Result<Self> {
        Ok(GenericApiPlugin { provider: provider.to_string(), query_hook: None, download_hook: None })
    }

    pub fn with_hooks(provider: &str, query_hook: ApiQueryFetch, download_hook: ApiDownloadFetch) -> Self {
        GenericApiPlugin { provider: provider.to_string(), query_hook: Some(query_hook), download_hook: Some(download_hook) }
    }
}

#[async_trait]
impl ApiPlugin for GenericApiPlugin {
    fn plugin_type(&self) -> &'static str {
        "GenericApiPlugin"
    }

    async fn query(&self, prep: &PreparedSearch) -> Result<(Vec<Product>, Option<u64>)> {
        let hook = self
            .query_hook
            .as_ref()
            .ok_or_else(|| EodagError::misconfigured(&self.provider, "GenericApiPlugin has no query adapter configured"))?;
        hook(prep)
    }

    async fn download(&self, product: &mut Product, options: &DownloadOptions) -> Result<PathBuf> {
        use crate::download::base::{self, PrepareOutcome};

        if let PrepareOutcome::AlreadyDownloaded(path) = base::prepare(product, options, "")? {
            product.mark_downloaded(&path.display().to_string());
            return Ok(path);
        }

        let hook = self
            .download_hook
            .as_ref()
            .ok_or_else(|| EodagError::misconfigured(&self.provider, "GenericApiPlugin has no download adapter configured"))?;
        let fetched_path = hook(product)?;

        let final_path = base::finalize(&fetched_path, options)?;
        product.mark_downloaded(&final_path.display().to_string());
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generic_api_plugin_without_hooks_is_unsupported() {
        let plugin = GenericApiPlugin::from_config("A", &PluginConfig {
            plugin_type: "GenericApiPlugin".to_string(),
            credentials: std::collections::BTreeMap::new(),
            metadata_mapping: std::collections::BTreeMap::new(),
            pagination: None,
            literal_search_params: std::collections::BTreeMap::new(),
            free_text_search_operations: None,
            extra: std::collections::BTreeMap::new(),
        })
        .unwrap();

        let prep = PreparedSearch::new("SAT1", "SAT1");
        let err = plugin.query(&prep).await.unwrap_err();
        assert!(matches!(err, EodagError::Misconfigured { .. }));
    }

    #[tokio::test]
    async fn generic_api_plugin_with_hooks_queries_and_downloads() {
        let query_hook: ApiQueryFetch = Arc::new(|_prep| {
            let mut product = Product::new("A", "SAT1", "1", "https://a/1");
            product.title = "P1".to_string();
            Ok((vec![product], Some(1)))
        });
        let download_hook: ApiDownloadFetch = Arc::new(|product| {
            let dir = std::env::temp_dir();
            let path = dir.join(format!("{}-fetched", product.id));
            std::fs::write(&path, b"data").unwrap();
            Ok(path)
        });
        let plugin = GenericApiPlugin::with_hooks("A", query_hook, download_hook);

        let prep = PreparedSearch::new("SAT1", "SAT1");
        let (products, total) = plugin.query(&prep).await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(total, Some(1));

        let dir = tempfile::tempdir().unwrap();
        let options = DownloadOptions { outputs_prefix: dir.path().to_path_buf(), extract: false, ..DownloadOptions::default() };
        let mut product = products.into_iter().next().unwrap();
        let path = plugin.download(&mut product, &options).await.unwrap();
        assert!(path.exists());
        assert!(product.is_downloaded());
    }
}
