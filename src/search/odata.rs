//! OData v4 search (Copernicus Dataspace style): GET an entity set with
//! a `$filter` query option, then optionally GET each entry's
//! `/Attributes` navigation property to merge in per-product metadata.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::mapping::{eval_jsonpath, Extracted, MappingEngine};
use crate::model::Product;

use super::{products_from_entries, PreparedSearch, SearchPlugin};

pub struct ODataSearchPlugin {
    provider: String,
    endpoint: String,
    mapping: MappingEngine,
    literal_search_params: BTreeMap<String, Value>,
    metadata_url_tpl: Option<String>,
    http_client: reqwest::Client,
}

impl ODataSearchPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let endpoint = config
            .extra_str("endpoint")
            .ok_or_else(|| EodagError::misconfigured(provider, "ODataV4Search requires an endpoint"))?
            .to_string();
        Ok(ODataSearchPlugin {
            provider: provider.to_string(),
            endpoint,
            mapping: MappingEngine::new(config.metadata_mapping.clone()),
            literal_search_params: config.literal_search_params.clone(),
            metadata_url_tpl: config.extra_str("metadata_url_tpl").map(str::to_string),
            http_client,
        })
    }

    fn build_filter(&self, prep: &PreparedSearch) -> Result<String> {
        let rendered = self.mapping.format_query(&prep.kwargs)?;
        let mut clauses: Vec<String> = rendered.values().cloned().collect();
        for (key, value) in &self.literal_search_params {
            clauses.push(format!("{key} eq {value}"));
        }
        Ok(clauses.join(" and "))
    }

    async fn fetch_attributes(&self, product_id: &str, authenticator: Option<&Authenticator>) -> Result<Value> {
        let Some(tpl) = &self.metadata_url_tpl else { return Ok(Value::Null) };
        let url = tpl.replace("{id}", product_id);
        let mut request = self.http_client.get(&url);
        if let Some(auth) = authenticator {
            for (key, value) in &auth.headers {
                request = request.header(key, value);
            }
        }
        let response = request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
        if !response.status().is_success() {
            return Ok(Value::Null);
        }
        response.json().await.map_err(|e| EodagError::request(&self.provider, format!("malformed attributes response: {e}")))
    }
}

#[async_trait]
impl SearchPlugin for ODataSearchPlugin {
    fn plugin_type(&self) -> &'static str {
        "ODataV4Search"
    }

    fn mapping_engine(&self) -> &MappingEngine {
        &self.mapping
    }

    async fn query(&self, prep: &PreparedSearch, authenticator: Option<&Authenticator>) -> Result<(Vec<Product>, Option<u64>)> {
        let filter = self.build_filter(prep)?;
        let mut request = self.http_client.get(&self.endpoint).query(&[
            ("$filter", filter.as_str()),
            ("$top", &prep.items_per_page.to_string()),
            ("$skip", &((prep.page - 1) * prep.items_per_page).to_string()),
        ]);
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

        let entries = match eval_jsonpath("$.value[*]", &doc) {
            Extracted::NotAvailable => vec![],
            Extracted::One(v) => vec![v],
            Extracted::Many(vs) => vs,
        };
        let mut products = products_from_entries(&self.provider, &prep.product_type, &self.mapping, &entries, &BTreeMap::new())?;

        if self.metadata_url_tpl.is_some() {
            for product in &mut products {
                let attributes = self.fetch_attributes(&product.id, authenticator).await?;
                if !attributes.is_null() {
                    let extracted = self.mapping.extract_all_json(&attributes)?;
                    for (key, value) in extracted {
                        if !value.is_null() {
                            product.properties.insert(key, value);
                        }
                    }
                }
            }
        }

        let total = eval_jsonpath("$['@odata.count']", &doc).into_value().as_u64();
        Ok((products, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PluginConfig {
        let mut extra = BTreeMap::new();
        extra.insert("endpoint".to_string(), Value::String("https://catalog/odata/Products".to_string()));
        PluginConfig {
            plugin_type: "ODataV4Search".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra,
        }
    }

    #[test]
    fn build_filter_combines_literal_params_with_and() {
        let mut config = config();
        config.literal_search_params.insert("Collection/Name".to_string(), Value::String("'SENTINEL-2'".to_string()));
        let plugin = ODataSearchPlugin::from_config("A", &config, reqwest::Client::new()).unwrap();
        let prep = PreparedSearch::new("S2_MSI_L1C", "SENTINEL-2");
        let filter = plugin.build_filter(&prep).unwrap();
        assert!(filter.contains("Collection/Name eq 'SENTINEL-2'"));
    }
}
