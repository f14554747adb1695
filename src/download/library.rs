//! Library-backed download: a seam for providers with no portable wire
//! protocol, where fetching is delegated to an external, vendor-specific
//! SDK. Prepare/finalize still apply around whatever the adapter
//! produces; this crate carries the seam, not any particular vendor SDK
//! (see spec.md §1 Non-goals: "does not re-implement provider-side
//! business logic").

use std::path::PathBuf;

use async_trait::async_trait;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::model::Product;

use super::base::{self, DownloadOptions, PrepareOutcome};
use super::DownloadPlugin;

/// An external fetch hook a concrete deployment plugs in; `None`
/// surfaces as a misconfiguration rather than silently no-op'ing.
pub type LibraryFetch = std::sync::Arc<dyn Fn(&Product) -> Result<PathBuf> + Send + Sync>;

pub struct LibraryBackedDownloadPlugin {
    provider: String,
    outputs_extension: String,
    fetch: Option<LibraryFetch>,
}

impl LibraryBackedDownloadPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig) -> Result<Self> {
        Ok(LibraryBackedDownloadPlugin {
            provider: provider.to_string(),
            outputs_extension: config.extra_str("outputs_extension").unwrap_or("").to_string(),
            fetch: None,
        })
    }

    pub fn with_fetch(provider: &str, outputs_extension: &str, fetch: LibraryFetch) -> Self {
        LibraryBackedDownloadPlugin { provider: provider.to_string(), outputs_extension: outputs_extension.to_string(), fetch: Some(fetch) }
    }
}

#[async_trait]
impl DownloadPlugin for LibraryBackedDownloadPlugin {
    fn plugin_type(&self) -> &'static str {
        "LibraryBackedDownload"
    }

    async fn download(&self, product: &mut Product, _authenticator: Option<&Authenticator>, options: &DownloadOptions) -> Result<PathBuf> {
        if let PrepareOutcome::AlreadyDownloaded(path) = base::prepare(product, options, &self.outputs_extension)? {
            product.mark_downloaded(&path.display().to_string());
            return Ok(path);
        }

        let fetch = self
            .fetch
            .as_ref()
            .ok_or_else(|| EodagError::misconfigured(&self.provider, "LibraryBackedDownload has no fetch adapter configured"))?;
        let fetched_path = fetch(product)?;

        let final_path = base::finalize(&fetched_path, options)?;
        product.mark_downloaded(&final_path.display().to_string());
        Ok(final_path)
    }
}
