//! Download plugins: shared prepare/stream/record/finalize scaffolding
//! plus the HTTP, S3-REST, S3-native, and library-backed strategy
//! variants (spec §4.6).

pub mod base;
pub mod http;
pub mod library;
pub mod s3_native;
pub mod s3_rest;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::Result;
use crate::model::Product;

pub use base::{DownloadOptions, ProgressFn};

/// Common interface every download strategy implements. `base::prepare`/
/// `base::finalize` are free functions the variants call into rather
/// than trait default-methods, so a `LibraryBackedDownload` that never
/// streams bytes through us can skip the parts that don't apply.
#[async_trait]
pub trait DownloadPlugin: Send + Sync {
    fn plugin_type(&self) -> &'static str;

    async fn download(&self, product: &mut Product, authenticator: Option<&Authenticator>, options: &DownloadOptions) -> Result<PathBuf>;
}

pub type SharedDownloadPlugin = Arc<dyn DownloadPlugin>;

pub fn build(provider: &str, config: &PluginConfig, http_client: reqwest::Client) -> Result<SharedDownloadPlugin> {
    match config.plugin_type.as_str() {
        "HTTPDownload" => Ok(Arc::new(http::HttpDownloadPlugin::from_config(provider, config, http_client)?)),
        "S3RestDownload" => Ok(Arc::new(s3_rest::S3RestDownloadPlugin::from_config(provider, config, http_client)?)),
        "S3NativeDownload" => Ok(Arc::new(s3_native::S3NativeDownloadPlugin::from_config(provider, config)?)),
        "LibraryBackedDownload" => Ok(Arc::new(library::LibraryBackedDownloadPlugin::from_config(provider, config)?)),
        other => Err(crate::error::EodagError::misconfigured(provider, format!("unknown download plugin type {other:?}"))),
    }
}
