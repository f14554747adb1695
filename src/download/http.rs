//! HTTP streaming download with record/resume: the default variant.
//! Supports an optional order/poll pre-step for providers that report
//! products `OFFLINE` until ordered.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::model::Product;

use super::base::{self, DownloadOptions, PrepareOutcome};
use super::DownloadPlugin;

pub struct HttpDownloadPlugin {
    provider: String,
    outputs_extension: String,
    order_link: Option<String>,
    order_method: String,
    auth_error_codes: Vec<u16>,
    offline_status_code: u16,
    http_client: reqwest::Client,
}

impl HttpDownloadPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let auth_error_codes = config
            .extra
            .get("auth_error_code")
            .and_then(serde_json::Value::as_array)
            .map(|a| a.iter().filter_map(serde_json::Value::as_u64).map(|v| v as u16).collect())
            .unwrap_or_default();
        Ok(HttpDownloadPlugin {
            provider: provider.to_string(),
            outputs_extension: config.extra_str("outputs_extension").unwrap_or(".zip").to_string(),
            order_link: config.extra_str("order_link").map(str::to_string),
            order_method: config.extra_str("order_method").unwrap_or("POST").to_string(),
            auth_error_codes,
            offline_status_code: config.extra_u64("offline_status_code").unwrap_or(202) as u16,
            http_client,
        })
    }

    async fn place_order(&self, product: &Product, authenticator: Option<&Authenticator>) -> Result<()> {
        let Some(order_link) = &self.order_link else { return Ok(()) };
        let url = order_link.replace("{id}", &product.id);
        let mut request = match self.order_method.as_str() {
            "GET" => self.http_client.get(&url),
            _ => self.http_client.post(&url),
        };
        if let Some(auth) = authenticator {
            for (key, value) in &auth.headers {
                request = request.header(key, value);
            }
        }
        request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DownloadPlugin for HttpDownloadPlugin {
    fn plugin_type(&self) -> &'static str {
        "HTTPDownload"
    }

    async fn download(&self, product: &mut Product, authenticator: Option<&Authenticator>, options: &DownloadOptions) -> Result<PathBuf> {
        let (destination, record_file) = match base::prepare(product, options, &self.outputs_extension)? {
            PrepareOutcome::AlreadyDownloaded(path) => {
                product.mark_downloaded(&path.display().to_string());
                return Ok(path);
            }
            PrepareOutcome::NeedsDownload { destination, record_file } => (destination, record_file),
        };

        let url = authenticator.map(|a| a.apply_to_url(&product.remote_location)).unwrap_or_else(|| product.remote_location.clone());
        let mut request = self.http_client.get(&url);
        if let Some(auth) = authenticator {
            for (key, value) in &auth.headers {
                request = request.header(key, value);
            }
        }
        let response = request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
        let status = response.status();

        if status.as_u16() == self.offline_status_code {
            self.place_order(product, authenticator).await?;
            return Err(EodagError::not_available(&product.id, "product reported offline; order placed, retry later"));
        }
        if self.auth_error_codes.contains(&status.as_u16()) {
            return Err(EodagError::authentication(&self.provider, format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(EodagError::download(&product.id, format!("HTTP {status}")));
        }

        let total = response.content_length();
        let body = response.bytes_stream();
        base::stream_body_to_file(body, &destination, total, options.progress.as_ref(), options.cancellation.as_ref()).await?;
        base::write_record(&record_file, &product.remote_location)?;

        let final_path = base::finalize(&destination, options)?;
        product.mark_downloaded(&final_path.display().to_string());
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config() -> PluginConfig {
        PluginConfig {
            plugin_type: "HTTPDownload".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn defaults_to_zip_extension_and_202_offline_code() {
        let plugin = HttpDownloadPlugin::from_config("A", &config(), reqwest::Client::new()).unwrap();
        assert_eq!(plugin.outputs_extension, ".zip");
        assert_eq!(plugin.offline_status_code, 202);
    }
}
