//! SAS (time-limited signed URL) auth: GETs a configured signed-URL
//! endpoint, caches `{signed_url, expiry}` keyed by the original URL,
//! and transparently substitutes the signed URL while `now < expiry`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::PluginConfig;
use crate::error::{EodagError, Result};

use super::{AuthPlugin, Authenticator};

#[derive(Debug, Deserialize)]
struct SasResponse {
    signed_url: String,
    expires_at: String,
}

pub struct SasAuth {
    sas_endpoint: String,
    http_client: reqwest::Client,
    cache: Arc<Mutex<std::collections::BTreeMap<String, (String, DateTime<Utc>)>>>,
}

impl SasAuth {
    pub fn from_config(config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let sas_endpoint = config
            .extra_str("sas_endpoint")
            .ok_or_else(|| EodagError::misconfigured("auth", "SASAuth requires sas_endpoint"))?
            .to_string();
        Ok(SasAuth { sas_endpoint, http_client, cache: Arc::new(Mutex::new(Default::default())) })
    }

    /// Returns a signed URL for `original_url`, refreshing it if absent
    /// or expired.
    pub async fn signed_url_for(&self, original_url: &str) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some((signed, expiry)) = cache.get(original_url) {
            if Utc::now() < *expiry {
                return Ok(signed.clone());
            }
        }
        let response: SasResponse = self
            .http_client
            .get(&self.sas_endpoint)
            .query(&[("url", original_url)])
            .send()
            .await
            .map_err(|e| EodagError::request("sas", e.to_string()))?
            .json()
            .await
            .map_err(|e| EodagError::request("sas", format!("malformed SAS response: {e}")))?;
        let expiry = DateTime::parse_from_rfc3339(&response.expires_at)
            .map_err(|e| EodagError::validation(format!("invalid SAS expiry: {e}")))?
            .with_timezone(&Utc);
        cache.insert(original_url.to_string(), (response.signed_url.clone(), expiry));
        Ok(response.signed_url)
    }
}

#[async_trait]
impl AuthPlugin for SasAuth {
    fn plugin_type(&self) -> &'static str {
        "SASAuth"
    }

    async fn authenticate(&self) -> Result<Authenticator> {
        // SAS substitutes the whole URL per-request (see
        // `signed_url_for`), so `authenticate()` itself has nothing to
        // inject ahead of time.
        Ok(Authenticator::default())
    }
}
