//! Query-string GET search (OpenSearch/STAC style): a single URL with a
//! query string; page navigation via a URL template.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::mapping::{eval_jsonpath, Extracted, MappingEngine};
use crate::model::Product;

use super::{products_from_entries, PreparedSearch, SearchPlugin};

pub struct QueryStringSearchPlugin {
    provider: String,
    endpoint: String,
    mapping: MappingEngine,
    literal_search_params: BTreeMap<String, Value>,
    results_entry: String,
    auth_error_codes: Vec<u16>,
    next_page_url_tpl: Option<String>,
    total_items_nb_key_path: Option<String>,
    http_client: reqwest::Client,
}

impl QueryStringSearchPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let endpoint = config
            .extra_str("endpoint")
            .ok_or_else(|| EodagError::misconfigured(provider, "QueryStringSearch requires an endpoint"))?
            .to_string();
        let results_entry = config.extra_str("results_entry").unwrap_or("$.features[*]").to_string();
        let auth_error_codes = config
            .extra
            .get("auth_error_code")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_u64).map(|v| v as u16).collect())
            .unwrap_or_default();
        Ok(QueryStringSearchPlugin {
            provider: provider.to_string(),
            endpoint,
            mapping: MappingEngine::new(config.metadata_mapping.clone()),
            literal_search_params: config.literal_search_params.clone(),
            results_entry,
            auth_error_codes,
            next_page_url_tpl: config.pagination.as_ref().and_then(|p| p.next_page_url_tpl.clone()),
            total_items_nb_key_path: config.pagination.as_ref().and_then(|p| p.total_items_nb_key_path.clone()),
            http_client,
        })
    }

    fn build_url(&self, prep: &PreparedSearch) -> Result<String> {
        let mut params = self.mapping.format_query(&prep.kwargs)?;
        for (key, value) in &self.literal_search_params {
            params.insert(key.clone(), value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()));
        }
        let base = match &self.next_page_url_tpl {
            Some(tpl) if prep.page > 1 => tpl
                .replace("{url}", &self.endpoint)
                .replace("{page}", &prep.page.to_string())
                .replace("{items_per_page}", &prep.items_per_page.to_string())
                .replace("{skip}", &((prep.page - 1) * prep.items_per_page).to_string()),
            _ => self.endpoint.clone(),
        };
        if params.is_empty() {
            return Ok(base);
        }
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| EodagError::misconfigured(&self.provider, format!("invalid endpoint URL {base:?}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }
}

#[async_trait]
impl SearchPlugin for QueryStringSearchPlugin {
    fn plugin_type(&self) -> &'static str {
        "QueryStringSearch"
    }

    fn mapping_engine(&self) -> &MappingEngine {
        &self.mapping
    }

    async fn query(&self, prep: &PreparedSearch, authenticator: Option<&Authenticator>) -> Result<(Vec<Product>, Option<u64>)> {
        let url = self.build_url(prep)?;
        let url = authenticator.map(|a| a.apply_to_url(&url)).unwrap_or(url);
        let mut request = self.http_client.get(&url);
        if let Some(auth) = authenticator {
            for (key, value) in &auth.headers {
                request = request.header(key, value);
            }
        }
        let response = request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
        let status = response.status();
        if self.auth_error_codes.contains(&status.as_u16()) {
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
        extra.insert("results_entry".to_string(), Value::String("$.features[*]".to_string()));
        PluginConfig {
            plugin_type: "QueryStringSearch".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra,
        }
    }

    #[test]
    fn build_url_applies_literal_params() {
        let mut config = config();
        config.literal_search_params.insert("format".to_string(), Value::String("json".to_string()));
        let plugin = QueryStringSearchPlugin::from_config("A", &config, reqwest::Client::new()).unwrap();
        let prep = PreparedSearch::new("S2_MSI_L1C", "SENTINEL-2");
        let url = plugin.build_url(&prep).unwrap();
        assert!(url.contains("format=json"));
    }

    #[test]
    fn build_url_percent_encodes_values_with_reserved_characters() {
        let mut config = config();
        config.literal_search_params.insert("geometry".to_string(), Value::String("POLYGON((0 0, 1 1))".to_string()));
        let plugin = QueryStringSearchPlugin::from_config("A", &config, reqwest::Client::new()).unwrap();
        let prep = PreparedSearch::new("S2_MSI_L1C", "SENTINEL-2");
        let url = plugin.build_url(&prep).unwrap();
        let parsed = reqwest::Url::parse(&url).unwrap();
        let geometry = parsed.query_pairs().find(|(k, _)| k == "geometry").map(|(_, v)| v.into_owned());
        assert_eq!(geometry, Some("POLYGON((0 0, 1 1))".to_string()));
    }
}
