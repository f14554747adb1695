//! Data-request search (order-then-poll catalogues): POSTs a job
//! description, polls a status endpoint until the job reports
//! `completed`, then GETs the result listing. Polling is bounded by a
//! configured attempt count and interval so a stuck backend fails
//! rather than hangs the caller forever.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::mapping::{eval_jsonpath, Extracted, MappingEngine};
use crate::model::Product;

use super::{products_from_entries, PreparedSearch, SearchPlugin};

#[derive(Debug, Deserialize)]
struct JobCreated {
    #[serde(alias = "job_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    status: String,
}

pub struct DataRequestSearchPlugin {
    provider: String,
    request_endpoint: String,
    status_url_tpl: String,
    result_url_tpl: String,
    results_entry: String,
    poll_interval: Duration,
    max_polls: u32,
    mapping: MappingEngine,
    http_client: reqwest::Client,
}

impl DataRequestSearchPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let request_endpoint = config
            .extra_str("request_endpoint")
            .ok_or_else(|| EodagError::misconfigured(provider, "DataRequestSearch requires request_endpoint"))?
            .to_string();
        let status_url_tpl = config
            .extra_str("status_url_tpl")
            .ok_or_else(|| EodagError::misconfigured(provider, "DataRequestSearch requires status_url_tpl"))?
            .to_string();
        let result_url_tpl = config
            .extra_str("result_url_tpl")
            .ok_or_else(|| EodagError::misconfigured(provider, "DataRequestSearch requires result_url_tpl"))?
            .to_string();
        Ok(DataRequestSearchPlugin {
            provider: provider.to_string(),
            request_endpoint,
            status_url_tpl,
            result_url_tpl,
            results_entry: config.extra_str("results_entry").unwrap_or("$.content[*]").to_string(),
            poll_interval: Duration::from_secs(config.extra_u64("poll_interval_seconds").unwrap_or(3)),
            max_polls: config.extra_u64("max_polls").unwrap_or(40) as u32,
            mapping: MappingEngine::new(config.metadata_mapping.clone()),
            http_client,
        })
    }

    async fn submit_job(&self, prep: &PreparedSearch, authenticator: Option<&Authenticator>) -> Result<String> {
        let rendered = self.mapping.format_query(&prep.kwargs)?;
        let mut request = self.http_client.post(&self.request_endpoint).json(&rendered);
        if let Some(auth) = authenticator {
            for (key, value) in &auth.headers {
                request = request.header(key, value);
            }
        }
        let response = request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
        if !response.status().is_success() {
            return Err(EodagError::request(&self.provider, format!("job submission failed with HTTP {}", response.status())));
        }
        let created: JobCreated = response.json().await.map_err(|e| EodagError::request(&self.provider, format!("malformed job response: {e}")))?;
        Ok(created.id)
    }

    async fn wait_for_completion(&self, job_id: &str, authenticator: Option<&Authenticator>) -> Result<()> {
        let status_url = self.status_url_tpl.replace("{job_id}", job_id);
        for _ in 0..self.max_polls {
            let mut request = self.http_client.get(&status_url);
            if let Some(auth) = authenticator {
                for (key, value) in &auth.headers {
                    request = request.header(key, value);
                }
            }
            let response = request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
            let status: JobStatus = response.json().await.map_err(|e| EodagError::request(&self.provider, format!("malformed status response: {e}")))?;
            match status.status.as_str() {
                "completed" | "finished" | "done" => return Ok(()),
                "failed" | "error" => return Err(EodagError::request(&self.provider, format!("job {job_id} failed"))),
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
        Err(EodagError::request(&self.provider, format!("job {job_id} did not complete within the polling budget")))
    }

    async fn fetch_result(&self, job_id: &str, authenticator: Option<&Authenticator>) -> Result<Value> {
        let result_url = self.result_url_tpl.replace("{job_id}", job_id);
        let mut request = self.http_client.get(&result_url);
        if let Some(auth) = authenticator {
            for (key, value) in &auth.headers {
                request = request.header(key, value);
            }
        }
        request
            .send()
            .await
            .map_err(|e| EodagError::request(&self.provider, e.to_string()))?
            .json()
            .await
            .map_err(|e| EodagError::request(&self.provider, format!("malformed result response: {e}")))
    }
}

#[async_trait]
impl SearchPlugin for DataRequestSearchPlugin {
    fn plugin_type(&self) -> &'static str {
        "DataRequestSearch"
    }

    fn mapping_engine(&self) -> &MappingEngine {
        &self.mapping
    }

    async fn query(&self, prep: &PreparedSearch, authenticator: Option<&Authenticator>) -> Result<(Vec<Product>, Option<u64>)> {
        let job_id = self.submit_job(prep, authenticator).await?;
        self.wait_for_completion(&job_id, authenticator).await?;
        let doc = self.fetch_result(&job_id, authenticator).await?;

        let entries = match eval_jsonpath(&self.results_entry, &doc) {
            Extracted::NotAvailable => vec![],
            Extracted::One(v) => vec![v],
            Extracted::Many(vs) => vs,
        };
        let products = products_from_entries(&self.provider, &prep.product_type, &self.mapping, &entries, &BTreeMap::new())?;
        let total = products.len() as u64;
        Ok((products, Some(total)))
    }
}
