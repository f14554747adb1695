//! Layered YAML configuration loader: built-in provider defaults, user
//! overrides, environment-variable overrides (`EODAG__<PROVIDER>__<TOPIC>__<KEY>`),
//! and per-invocation kwargs. Produces immutable [`ProviderConfig`] records.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EodagError, Result};
use crate::mapping::Mapping;

pub const ENV_CFG_FILE: &str = "EODAG_CFG_FILE";
pub const ENV_LOCS_CFG_FILE: &str = "EODAG_LOCS_CFG_FILE";
pub const ENV_PROVIDERS_WHITELIST: &str = "EODAG_PROVIDERS_WHITELIST";
pub const ENV_VALIDATE_COLLECTIONS: &str = "EODAG_VALIDATE_COLLECTIONS";
const ENV_OVERRIDE_PREFIX: &str = "EODAG__";

/// One of the five plugin-bearing topics a provider may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Api,
    Search,
    Download,
    Auth,
    SearchAuth,
    DownloadAuth,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Api => "api",
            Topic::Search => "search",
            Topic::Download => "download",
            Topic::Auth => "auth",
            Topic::SearchAuth => "search_auth",
            Topic::DownloadAuth => "download_auth",
        }
    }
}

/// A plugin sub-config: `type` names the plugin class, the rest is
/// plugin-specific. Kept as a generic map-plus-typed-fields envelope so
/// the mapping engine and per-strategy plugins can each read what they
/// need without a combinatorial struct explosion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata_mapping: BTreeMap<String, Mapping>,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
    #[serde(default)]
    pub literal_search_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub free_text_search_operations: Option<FreeTextSearchOperations>,
    /// Free-form extra fields (endpoints, auth_uri, headers, token keys,
    /// `auth_error_code`, `order_link`, `archive_depth`, …) that differ
    /// per plugin type and are read by name at plugin construction time.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PluginConfig {
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(|v| v.as_u64())
    }

    /// Mapping entry merge used when a product-type-level override is
    /// layered on top of the provider-global mapping: entries present in
    /// `overrides` win, the rest are inherited. Copy-on-write: the
    /// receiver is untouched, a new map is returned.
    pub fn merged_mapping(&self, overrides: &BTreeMap<String, Mapping>) -> BTreeMap<String, Mapping> {
        let mut merged = self.metadata_mapping.clone();
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    pub next_page_url_tpl: Option<String>,
    pub next_page_query_obj: Option<String>,
    pub total_items_nb_key_path: Option<String>,
    #[serde(default = "default_items_per_page")]
    pub items_per_page: u32,
}

fn default_items_per_page() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeTextSearchOperations {
    pub and_pattern: String,
    pub or_pattern: Option<String>,
    pub not_pattern: Option<String>,
    pub wrapper: Option<String>,
}

/// Per-product-type parameters declared under a provider's `products`
/// map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductTypeConfig {
    pub collection: Option<String>,
    pub product_type: Option<String>,
    /// User-facing alternate name; lookups resolve an alias to its
    /// declaring collection id before falling through to treating the
    /// query as the id itself.
    pub alias: Option<String>,
    #[serde(default)]
    pub metadata_mapping: BTreeMap<String, Mapping>,
    pub fetch_metadata: Option<String>,
    pub complementary_url_key: Option<String>,
    pub constraints_file_path: Option<String>,
    pub constraints_file_url: Option<String>,
    pub default_bucket: Option<String>,
    #[serde(default)]
    pub build_safe: bool,
    #[serde(default)]
    pub flatten_top_dirs: bool,
    #[serde(flatten)]
    pub queryable_defaults: BTreeMap<String, Value>,
}

pub const GENERIC_PRODUCT_TYPE: &str = "GENERIC_PRODUCT_TYPE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    pub description: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub products: BTreeMap<String, ProductTypeConfig>,
    pub api: Option<PluginConfig>,
    pub search: Option<PluginConfig>,
    pub download: Option<PluginConfig>,
    pub auth: Option<PluginConfig>,
    pub search_auth: Option<PluginConfig>,
    pub download_auth: Option<PluginConfig>,
}

impl ProviderConfig {
    pub fn plugin_config(&self, topic: Topic) -> Option<&PluginConfig> {
        match topic {
            Topic::Api => self.api.as_ref(),
            Topic::Search => self.search.as_ref(),
            Topic::Download => self.download.as_ref(),
            Topic::Auth => self.auth.as_ref(),
            Topic::SearchAuth => self.search_auth.as_ref(),
            Topic::DownloadAuth => self.download_auth.as_ref(),
        }
    }

    pub fn declared_topics(&self) -> Vec<Topic> {
        [
            Topic::Api,
            Topic::Search,
            Topic::Download,
            Topic::Auth,
            Topic::SearchAuth,
            Topic::DownloadAuth,
        ]
        .into_iter()
        .filter(|t| self.plugin_config(*t).is_some())
        .collect()
    }

    /// Validate the "has a name, implements >= 1 plugin topic, and api
    /// excludes other topics on the same provider" invariant.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EodagError::validation("provider config must have a non-empty name"));
        }
        let topics = self.declared_topics();
        if topics.is_empty() {
            return Err(EodagError::misconfigured(&self.name, "provider declares no plugin topic"));
        }
        if topics.contains(&Topic::Api) && topics.len() > 1 {
            return Err(EodagError::misconfigured(
                &self.name,
                "provider declaring an `api` plugin must not declare any other topic plugin",
            ));
        }
        for topic in &topics {
            if let Some(cfg) = self.plugin_config(*topic) {
                if cfg.plugin_type.is_empty() {
                    return Err(EodagError::misconfigured(
                        &self.name,
                        format!("plugin under topic {} is missing a `type`", topic.as_str()),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn supports_product_type(&self, product_type: &str) -> bool {
        self.products.contains_key(product_type) || self.products.contains_key(GENERIC_PRODUCT_TYPE)
    }

    /// `update()`: the only mutation an immutable `ProviderConfig`
    /// permits post-construction — priority and credentials.
    pub fn update(&mut self, priority: Option<i32>, credentials: Option<BTreeMap<String, String>>) {
        if let Some(priority) = priority {
            self.priority = priority;
        }
        if let Some(credentials) = credentials {
            for topic in [Topic::Auth, Topic::SearchAuth, Topic::DownloadAuth] {
                let slot = match topic {
                    Topic::Auth => &mut self.auth,
                    Topic::SearchAuth => &mut self.search_auth,
                    Topic::DownloadAuth => &mut self.download_auth,
                    _ => unreachable!(),
                };
                if let Some(plugin) = slot {
                    plugin.credentials.extend(credentials.clone());
                }
            }
        }
    }
}

pub type ConfigMap = BTreeMap<String, ProviderConfig>;

/// Loads and layers provider configuration: built-in defaults, then a
/// user file (from `EODAG_CFG_FILE` or an explicit path), then
/// environment-variable overrides, then per-invocation kwargs.
pub struct ConfigLoader {
    builtins: ConfigMap,
}

impl ConfigLoader {
    pub fn new(builtins: ConfigMap) -> Self {
        ConfigLoader { builtins }
    }

    pub fn load(&self, user_file: Option<&Path>, kwargs: &BTreeMap<String, Value>) -> Result<ConfigMap> {
        let mut merged = self.builtins.clone();

        if let Some(path) = user_file.map(Path::to_path_buf).or_else(|| std::env::var(ENV_CFG_FILE).ok().map(Into::into)) {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| EodagError::validation(format!("could not read config file {}: {e}", path.display())))?;
            let user: ConfigMap = serde_yaml::from_str(&contents)
                .map_err(|e| EodagError::validation(format!("invalid YAML config file {}: {e}", path.display())))?;
            merge_config_maps(&mut merged, user);
        }

        apply_env_overrides(&mut merged)?;
        apply_kwargs(&mut merged, kwargs)?;

        for provider in merged.values() {
            provider.validate()?;
        }

        if let Ok(whitelist) = std::env::var(ENV_PROVIDERS_WHITELIST) {
            let allowed: std::collections::HashSet<&str> = whitelist.split(',').map(str::trim).collect();
            merged.retain(|name, _| allowed.contains(name.as_str()));
        }

        Ok(merged)
    }
}

pub(crate) fn merge_config_maps(base: &mut ConfigMap, overlay: ConfigMap) {
    for (name, overlay_provider) in overlay {
        match base.get_mut(&name) {
            Some(existing) => merge_provider_config(existing, overlay_provider),
            None => {
                base.insert(name, overlay_provider);
            }
        }
    }
}

/// Deep-merge one provider config onto another: plugin sub-configs are
/// merged field-by-field; non-plugin scalar fields are overwritten by
/// the incoming side when non-nil.
fn merge_provider_config(base: &mut ProviderConfig, overlay: ProviderConfig) {
    base.priority = overlay.priority;
    if overlay.description.is_some() {
        base.description = overlay.description;
    }
    if overlay.url.is_some() {
        base.url = overlay.url;
    }
    if !overlay.roles.is_empty() {
        base.roles = overlay.roles;
    }
    if overlay.group.is_some() {
        base.group = overlay.group;
    }
    for (key, value) in overlay.products {
        base.products.insert(key, value);
    }
    merge_plugin_slot(&mut base.api, overlay.api);
    merge_plugin_slot(&mut base.search, overlay.search);
    merge_plugin_slot(&mut base.download, overlay.download);
    merge_plugin_slot(&mut base.auth, overlay.auth);
    merge_plugin_slot(&mut base.search_auth, overlay.search_auth);
    merge_plugin_slot(&mut base.download_auth, overlay.download_auth);
}

fn merge_plugin_slot(base: &mut Option<PluginConfig>, overlay: Option<PluginConfig>) {
    match (base.as_mut(), overlay) {
        (Some(existing), Some(overlay)) => {
            existing.plugin_type = overlay.plugin_type;
            existing.credentials.extend(overlay.credentials);
            existing.metadata_mapping.extend(overlay.metadata_mapping);
            if overlay.pagination.is_some() {
                existing.pagination = overlay.pagination;
            }
            existing.literal_search_params.extend(overlay.literal_search_params);
            if overlay.free_text_search_operations.is_some() {
                existing.free_text_search_operations = overlay.free_text_search_operations;
            }
            existing.extra.extend(overlay.extra);
        }
        (None, Some(overlay)) => *base = Some(overlay),
        _ => {}
    }
}

/// Applies `EODAG__<PROVIDER>__<TOPIC>__<KEY>[__SUBKEY]*` overrides.
/// `<KEY>` maps onto `extra` unless it names one of the typed fields
/// (`type`, `priority`).
fn apply_env_overrides(config: &mut ConfigMap) -> Result<()> {
    for (raw_key, raw_value) in std::env::vars() {
        let Some(rest) = raw_key.strip_prefix(ENV_OVERRIDE_PREFIX) else { continue };
        let parts: Vec<&str> = rest.split("__").collect();
        if parts.len() < 3 {
            continue;
        }
        let provider_name = parts[0].to_lowercase();
        let topic_name = parts[1].to_lowercase();
        let key_path = &parts[2..];

        let Some(topic) = topic_from_str(&topic_name) else { continue };
        let provider = config.entry(provider_name.clone()).or_insert_with(|| ProviderConfig {
            name: provider_name.clone(),
            priority: 0,
            description: None,
            url: None,
            roles: vec![],
            group: None,
            products: BTreeMap::new(),
            api: None,
            search: None,
            download: None,
            auth: None,
            search_auth: None,
            download_auth: None,
        });

        if topic == Topic::Api && key_path == ["priority"] {
            provider.priority = raw_value.parse().unwrap_or(provider.priority);
            continue;
        }

        let slot = match topic {
            Topic::Api => &mut provider.api,
            Topic::Search => &mut provider.search,
            Topic::Download => &mut provider.download,
            Topic::Auth => &mut provider.auth,
            Topic::SearchAuth => &mut provider.search_auth,
            Topic::DownloadAuth => &mut provider.download_auth,
        };
        let plugin = slot.get_or_insert_with(|| PluginConfig {
            plugin_type: String::new(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra: BTreeMap::new(),
        });

        match key_path {
            ["type"] => plugin.plugin_type = raw_value,
            ["credentials", sub_key] => {
                plugin.credentials.insert(sub_key.to_lowercase(), raw_value);
            }
            [single] => {
                plugin.extra.insert(single.to_lowercase(), Value::String(raw_value));
            }
            multi => {
                let nested_key = multi.join("__").to_lowercase();
                plugin.extra.insert(nested_key, Value::String(raw_value));
            }
        }
    }
    Ok(())
}

fn topic_from_str(s: &str) -> Option<Topic> {
    match s {
        "api" => Some(Topic::Api),
        "search" => Some(Topic::Search),
        "download" => Some(Topic::Download),
        "auth" => Some(Topic::Auth),
        "search_auth" => Some(Topic::SearchAuth),
        "download_auth" => Some(Topic::DownloadAuth),
        _ => None,
    }
}

/// Per-invocation kwargs layered last, keyed `"<provider>.<topic>.<key>"`.
fn apply_kwargs(config: &mut ConfigMap, kwargs: &BTreeMap<String, Value>) -> Result<()> {
    for (dotted_key, value) in kwargs {
        let parts: Vec<&str> = dotted_key.splitn(3, '.').collect();
        if parts.len() != 3 {
            continue;
        }
        let (provider_name, topic_name, key) = (parts[0], parts[1], parts[2]);
        let Some(topic) = topic_from_str(topic_name) else { continue };
        let Some(provider) = config.get_mut(provider_name) else { continue };
        let slot = match topic {
            Topic::Api => &mut provider.api,
            Topic::Search => &mut provider.search,
            Topic::Download => &mut provider.download,
            Topic::Auth => &mut provider.auth,
            Topic::SearchAuth => &mut provider.search_auth,
            Topic::DownloadAuth => &mut provider.download_auth,
        };
        if let Some(plugin) = slot {
            plugin.extra.insert(key.to_string(), value.clone());
        }
    }
    Ok(())
}

pub fn validate_collections_mode() -> crate::model::CollectionValidation {
    match std::env::var(ENV_VALIDATE_COLLECTIONS).as_deref() {
        Ok("strict") | Ok("1") | Ok("true") => crate::model::CollectionValidation::Strict,
        _ => crate::model::CollectionValidation::Lax,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_provider(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            priority: 0,
            description: None,
            url: None,
            roles: vec![],
            group: None,
            products: BTreeMap::new(),
            api: None,
            search: Some(PluginConfig {
                plugin_type: "QueryStringSearch".to_string(),
                credentials: BTreeMap::new(),
                metadata_mapping: BTreeMap::new(),
                pagination: None,
                literal_search_params: BTreeMap::new(),
                free_text_search_operations: None,
                extra: BTreeMap::new(),
            }),
            download: None,
            auth: None,
            search_auth: None,
            download_auth: None,
        }
    }

    #[test]
    fn provider_with_api_and_other_topic_is_rejected() {
        let mut p = sample_provider("x");
        p.api = Some(PluginConfig {
            plugin_type: "GenericApi".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra: BTreeMap::new(),
        });
        assert!(p.validate().is_err());
    }

    #[test]
    fn provider_with_no_topic_is_rejected() {
        let mut p = sample_provider("x");
        p.search = None;
        assert!(p.validate().is_err());
    }

    #[test]
    fn merge_provider_config_preserves_unmentioned_plugin_fields() {
        let mut base = sample_provider("x");
        base.search.as_mut().unwrap().extra.insert("endpoint".into(), Value::String("https://a".into()));
        let mut overlay = sample_provider("x");
        overlay.search.as_mut().unwrap().plugin_type = "QueryStringSearch".to_string();
        overlay.search.as_mut().unwrap().extra.insert("timeout".into(), Value::from(5));
        merge_provider_config(&mut base, overlay);
        let search = base.search.unwrap();
        assert_eq!(search.extra.get("endpoint").unwrap(), "https://a");
        assert_eq!(search.extra.get("timeout").unwrap(), &Value::from(5));
    }

    #[test]
    fn supports_product_type_via_generic_entry() {
        let mut p = sample_provider("x");
        p.products.insert(GENERIC_PRODUCT_TYPE.to_string(), ProductTypeConfig::default());
        assert!(p.supports_product_type("ANYTHING"));
    }
}
