//! Search plugins: strategy variants over the common search interface.
//! Each consumes the metadata mapping to format queries and parse
//! responses.

pub mod build_search_result;
pub mod csw;
pub mod data_request;
pub mod odata;
pub mod post_json;
pub mod query_string;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::Result;
use crate::mapping::MappingEngine;
use crate::model::Product;

/// Carries product type, page, items-per-page, count flag, auth handle,
/// and raw user kwargs for one search call.
#[derive(Debug, Clone)]
pub struct PreparedSearch {
    pub product_type: String,
    pub provider_product_type: String,
    pub page: u32,
    pub items_per_page: u32,
    pub count: bool,
    pub kwargs: BTreeMap<String, Value>,
    /// Checked by `Gateway::search_all` between pages; a single `query`
    /// call always runs to completion once issued.
    pub cancellation: Option<CancellationToken>,
}

impl PreparedSearch {
    pub fn new(product_type: impl Into<String>, provider_product_type: impl Into<String>) -> Self {
        PreparedSearch {
            product_type: product_type.into(),
            provider_product_type: provider_product_type.into(),
            page: 1,
            items_per_page: 20,
            count: true,
            kwargs: BTreeMap::new(),
            cancellation: None,
        }
    }
}

/// Common interface: `Query(prep) -> (products, total)`.
#[async_trait]
pub trait SearchPlugin: Send + Sync {
    fn plugin_type(&self) -> &'static str;

    async fn query(&self, prep: &PreparedSearch, authenticator: Option<&Authenticator>) -> Result<(Vec<Product>, Option<u64>)>;

    fn mapping_engine(&self) -> &MappingEngine;
}

pub type SharedSearchPlugin = Arc<dyn SearchPlugin>;

pub fn build(
    provider: &str,
    config: &PluginConfig,
    http_client: reqwest::Client,
) -> Result<SharedSearchPlugin> {
    match config.plugin_type.as_str() {
        "QueryStringSearch" => Ok(Arc::new(query_string::QueryStringSearchPlugin::from_config(provider, config, http_client)?)),
        "PostJsonSearch" => Ok(Arc::new(post_json::PostJsonSearchPlugin::from_config(provider, config, http_client)?)),
        "ODataV4Search" => Ok(Arc::new(odata::ODataSearchPlugin::from_config(provider, config, http_client)?)),
        "CSWSearch" => Ok(Arc::new(csw::CswSearchPlugin::from_config(provider, config, http_client)?)),
        "StaticStacSearch" | "BuildPostSearchResult" => {
            Ok(Arc::new(build_search_result::BuildSearchResultPlugin::from_config(provider, config)?))
        }
        "DataRequestSearch" => Ok(Arc::new(data_request::DataRequestSearchPlugin::from_config(provider, config, http_client)?)),
        other => Err(crate::error::EodagError::misconfigured(provider, format!("unknown search plugin type {other:?}"))),
    }
}

/// Shared response-parsing helper used by the GET/JSON-bodied
/// strategies: navigates to `results_entry`, applies the mapping engine
/// to each entry, and overlays product-type defaults so extracted
/// fields take precedence.
pub fn products_from_entries(
    provider: &str,
    product_type: &str,
    mapping: &MappingEngine,
    entries: &[Value],
    defaults: &BTreeMap<String, Value>,
) -> Result<Vec<Product>> {
    let mut products = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut properties = defaults.clone();
        let extracted = mapping.extract_all_json(entry)?;
        for (key, value) in extracted {
            if !value.is_null() {
                properties.insert(key, value);
            }
        }
        let id = properties
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let remote_location = properties
            .get("downloadLink")
            .or_else(|| properties.get("href"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let title = properties.get("title").and_then(Value::as_str).unwrap_or(&id).to_string();
        let mut product = Product::new(provider, product_type, id, remote_location);
        product.title = title;
        product.properties = properties;
        products.push(product);
    }
    Ok(products)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn products_from_entries_overlays_extracted_over_defaults() {
        let mut mapping = BTreeMap::new();
        mapping.insert("id".to_string(), crate::mapping::Mapping::parse_single("$.id").unwrap());
        let engine = MappingEngine::new(mapping);
        let mut defaults = BTreeMap::new();
        defaults.insert("id".to_string(), Value::String("default-id".to_string()));
        defaults.insert("processingLevel".to_string(), Value::String("L1C".to_string()));
        let entries = vec![serde_json::json!({"id": "real-id"})];
        let products = products_from_entries("A", "S2_MSI_L1C", &engine, &entries, &defaults).unwrap();
        assert_eq!(products[0].id, "real-id");
        assert_eq!(products[0].properties.get("processingLevel").unwrap(), "L1C");
    }
}
