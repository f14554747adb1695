//! Build-from-request search: no backend call at all. Synthesizes
//! exactly one product whose id is derived deterministically from the
//! product type and the query's date range, so the same query always
//! yields the same id (needed for order-on-demand providers that only
//! accept a pre-built product reference).
//!
//! Id shape: `UPPER(productType)_startYYYYMMDD_endYYYYMMDD_<sha1>`,
//! where the sha1 digest is computed over the request kwargs serialized
//! as JSON with keys sorted (`BTreeMap` gives this for free) so two
//! calls with the same logical query never diverge.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::Result;
use crate::mapping::MappingEngine;
use crate::model::Product;

use super::{PreparedSearch, SearchPlugin};

pub struct BuildSearchResultPlugin {
    provider: String,
    mapping: MappingEngine,
    download_link_tpl: Option<String>,
}

impl BuildSearchResultPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig) -> Result<Self> {
        Ok(BuildSearchResultPlugin {
            provider: provider.to_string(),
            mapping: MappingEngine::new(config.metadata_mapping.clone()),
            download_link_tpl: config.extra_str("download_link_tpl").map(str::to_string),
        })
    }

    fn build_id(&self, prep: &PreparedSearch) -> String {
        let start = prep.kwargs.get("start_datetime").or_else(|| prep.kwargs.get("startTimeFromAscendingNode"));
        let end = prep.kwargs.get("end_datetime").or_else(|| prep.kwargs.get("completionTimeFromAscendingNode"));
        let start_ymd = date_only(start);
        let end_ymd = date_only(end);

        let canonical = serde_json::to_string(&prep.kwargs).unwrap_or_default();
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        let digest_hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();

        format!("{}_{}_{}_{}", prep.provider_product_type.to_uppercase(), start_ymd, end_ymd, digest_hex)
    }
}

fn date_only(value: Option<&Value>) -> String {
    let Some(s) = value.and_then(Value::as_str) else { return "00000000".to_string() };
    s.split(['T', ' ']).next().unwrap_or(s).replace('-', "")
}

#[async_trait]
impl SearchPlugin for BuildSearchResultPlugin {
    fn plugin_type(&self) -> &'static str {
        "BuildPostSearchResult"
    }

    fn mapping_engine(&self) -> &MappingEngine {
        &self.mapping
    }

    async fn query(&self, prep: &PreparedSearch, _authenticator: Option<&Authenticator>) -> Result<(Vec<Product>, Option<u64>)> {
        let id = self.build_id(prep);
        let remote_location = self
            .download_link_tpl
            .as_ref()
            .map(|tpl| tpl.replace("{id}", &id))
            .unwrap_or_default();
        let mut product = Product::new(&self.provider, &prep.product_type, id.clone(), remote_location);
        product.title = id;
        product.search_args = prep.kwargs.clone();
        Ok((vec![product], Some(1)))
    }
}
