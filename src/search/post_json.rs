//! POST-JSON body search (STAC-API style `/search` endpoints): the
//! request body is built from literal params plus queryable fragments,
//! pagination advances by deep-updating the body rather than rewriting
//! the URL.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::mapping::{deep_update, eval_jsonpath, Extracted, MappingEngine};
use crate::model::Product;

use super::{products_from_entries, PreparedSearch, SearchPlugin};

pub struct PostJsonSearchPlugin {
    provider: String,
    endpoint: String,
    mapping: MappingEngine,
    literal_search_params: BTreeMap<String, Value>,
    results_entry: String,
    total_items_nb_key_path: Option<String>,
    http_client: reqwest::Client,
}

impl PostJsonSearchPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let endpoint = config
            .extra_str("endpoint")
            .ok_or_else(|| EodagError::misconfigured(provider, "PostJsonSearch requires an endpoint"))?
            .to_string();
        let results_entry = config.extra_str("results_entry").unwrap_or("$.features[*]").to_string();
        Ok(PostJsonSearchPlugin {
            provider: provider.to_string(),
            endpoint,
            mapping: MappingEngine::new(config.metadata_mapping.clone()),
            literal_search_params: config.literal_search_params.clone(),
            results_entry,
            total_items_nb_key_path: config.pagination.as_ref().and_then(|p| p.total_items_nb_key_path.clone()),
            http_client,
        })
    }

    fn build_body(&self, prep: &PreparedSearch) -> Result<Value> {
        let mut body = serde_json::json!({});
        for (key, value) in &self.literal_search_params {
            deep_update(&mut body, &serde_json::json!({ key: value }));
        }
        let rendered = self.mapping.format_query(&prep.kwargs)?;
        for (key, value) in rendered {
            deep_update(&mut body, &serde_json::json!({ key: value }));
        }
        deep_update(
            &mut body,
            &serde_json::json!({
                "page": prep.page,
                "limit": prep.items_per_page,
            }),
        );
        Ok(body)
    }
}

#[async_trait]
impl SearchPlugin for PostJsonSearchPlugin {
    fn plugin_type(&self) -> &'static str {
        "PostJsonSearch"
    }

    fn mapping_engine(&self) -> &MappingEngine {
        &self.mapping
    }

    async fn query(&self, prep: &PreparedSearch, authenticator: Option<&Authenticator>) -> Result<(Vec<Product>, Option<u64>)> {
        let body = self.build_body(prep)?;
        let mut request = self.http_client.post(&self.endpoint).json(&body);
        if let Some(auth) = authenticator {
            for (key, value) in &auth.headers {
                request = request.header(key, value);
            }
        }
        let response = request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(EodagError::authentication(&self.provider, format!("HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EodagError::request(&self.provider, format!("HTTP {status}: {body}")));
        }
        let doc: Value = response.json().await.map_err(|e| EodagError::request(&self.provider, format!("malformed response: {e}")))?;

        let entries = match eval_jsonpath(&self.results_entry, &doc) {
            Extracted::NotAvailable => vec![],
            Extracted::One(v) => vec![v],
            Extracted::Many(vs) => vs,
        };
        let products = products_from_entries(&self.provider, &prep.product_type, &self.mapping, &entries, &BTreeMap::new())?;
        let total = self.total_items_nb_key_path.as_ref().and_then(|path| match eval_jsonpath(path, &doc) {
            Extracted::One(v) => v.as_u64(),
            _ => None,
        });
        Ok((products, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PluginConfig {
        let mut extra = BTreeMap::new();
        extra.insert("endpoint".to_string(), Value::String("https://catalog/search".to_string()));
        PluginConfig {
            plugin_type: "PostJsonSearch".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra,
        }
    }

    #[test]
    fn build_body_includes_pagination_fields() {
        let plugin = PostJsonSearchPlugin::from_config("A", &config(), reqwest::Client::new()).unwrap();
        let mut prep = PreparedSearch::new("S2_MSI_L1C", "SENTINEL-2");
        prep.page = 2;
        let body = plugin.build_body(&prep).unwrap();
        assert_eq!(body["page"], 2);
    }
}
