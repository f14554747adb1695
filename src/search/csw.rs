//! OGC Catalogue Service for the Web (CSW) search: POSTs a
//! `GetRecords` request built from an OGC Filter Encoding template tied
//! to the product type, parses the XML `csw:SearchResults` response.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::mapping::MappingEngine;
use crate::model::Product;

use super::{PreparedSearch, SearchPlugin};

pub struct CswSearchPlugin {
    provider: String,
    endpoint: String,
    mapping: MappingEngine,
    get_records_tpl: String,
    record_tag: String,
    http_client: reqwest::Client,
}

impl CswSearchPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let endpoint = config
            .extra_str("endpoint")
            .ok_or_else(|| EodagError::misconfigured(provider, "CSWSearch requires an endpoint"))?
            .to_string();
        let get_records_tpl = config
            .extra_str("getrecords_request_tpl")
            .ok_or_else(|| EodagError::misconfigured(provider, "CSWSearch requires getrecords_request_tpl"))?
            .to_string();
        let record_tag = config.extra_str("record_tag").unwrap_or("csw:Record").to_string();
        Ok(CswSearchPlugin {
            provider: provider.to_string(),
            endpoint,
            mapping: MappingEngine::new(config.metadata_mapping.clone()),
            get_records_tpl,
            record_tag,
            http_client,
        })
    }

    fn build_request(&self, prep: &PreparedSearch) -> String {
        self.get_records_tpl
            .replace("{productType}", &prep.provider_product_type)
            .replace("{startPosition}", &((prep.page - 1) * prep.items_per_page + 1).to_string())
            .replace("{maxRecords}", &prep.items_per_page.to_string())
    }

    /// Splits the `csw:SearchResults` body into per-record fragments by
    /// naive open/close tag matching; good enough for the flat record
    /// shapes CSW catalogues return here.
    fn split_records(&self, xml: &str) -> Vec<String> {
        let open = format!("<{}", self.record_tag);
        let close = format!("</{}>", self.record_tag);
        let mut records = Vec::new();
        let mut rest = xml;
        while let Some(start) = rest.find(&open) {
            let Some(end_rel) = rest[start..].find(&close) else { break };
            let end = start + end_rel + close.len();
            records.push(rest[start..end].to_string());
            rest = &rest[end..];
        }
        records
    }
}

#[async_trait]
impl SearchPlugin for CswSearchPlugin {
    fn plugin_type(&self) -> &'static str {
        "CSWSearch"
    }

    fn mapping_engine(&self) -> &MappingEngine {
        &self.mapping
    }

    async fn query(&self, prep: &PreparedSearch, authenticator: Option<&Authenticator>) -> Result<(Vec<Product>, Option<u64>)> {
        let body = self.build_request(prep);
        let mut request = self.http_client.post(&self.endpoint).header("Content-Type", "application/xml").body(body);
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
        let xml = response.text().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;

        let mut products = Vec::new();
        for record_xml in self.split_records(&xml) {
            let extracted = self.mapping.extract_all_xml(&record_xml)?;
            let id = extracted.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let remote_location = extracted.get("downloadLink").and_then(Value::as_str).unwrap_or_default().to_string();
            let title = extracted.get("title").and_then(Value::as_str).unwrap_or(&id).to_string();
            let mut product = Product::new(&self.provider, &prep.product_type, id, remote_location);
            product.title = title;
            product.properties = extracted;
            products.push(product);
        }

        let total = numberof_records_matched(&xml);
        Ok((products, total))
    }
}

fn numberof_records_matched(xml: &str) -> Option<u64> {
    let marker = "numberOfRecordsMatched=\"";
    let start = xml.find(marker)? + marker.len();
    let end = xml[start..].find('"')? + start;
    xml[start..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_records_extracts_each_flat_record() {
        let config = PluginConfig {
            plugin_type: "CSWSearch".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra: BTreeMap::from([
                ("endpoint".to_string(), Value::String("https://csw/service".to_string())),
                ("getrecords_request_tpl".to_string(), Value::String("<GetRecords/>".to_string())),
            ]),
        };
        let plugin = CswSearchPlugin::from_config("A", &config, reqwest::Client::new()).unwrap();
        let xml = "<csw:SearchResults><csw:Record>a</csw:Record><csw:Record>b</csw:Record></csw:SearchResults>";
        let records = plugin.split_records(xml);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn numberof_records_matched_parses_attribute() {
        let xml = r#"<csw:SearchResults numberOfRecordsMatched="42"></csw:SearchResults>"#;
        assert_eq!(numberof_records_matched(xml), Some(42));
    }
}
