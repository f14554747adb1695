//! The common data model: `Product`, `SearchResult`, `Collection`,
//! `ProductType`, `Queryables`, `Asset`, `AuthenticatedSession`.

use std::collections::BTreeMap;
use std::sync::Arc;

use geo_types::Geometry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in `Product::assets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub key: String,
    pub href: String,
    pub title: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub media_type: Option<String>,
}

impl Asset {
    /// `href` must be an absolute URI using one of the schemes the
    /// download plugins understand.
    pub fn has_supported_scheme(&self) -> bool {
        ["http://", "https://", "s3://", "file://"]
            .iter()
            .any(|scheme| self.href.starts_with(scheme))
    }
}

/// A resolved, non-owning reference to the plugin that can act on a
/// product. Kept as `(provider, topic)` coordinates rather than a
/// pointer so the plugin registry remains the single owner of plugin
/// instances (see DESIGN.md, "Cyclic references Product <-> Downloader").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRef {
    pub provider: String,
    pub plugin_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub provider: String,
    pub product_type: String,
    pub id: String,
    pub title: String,
    /// Always WGS84.
    pub geometry: Option<GeometryWrapper>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
    /// Mutable; equals `remote_location` until a successful download,
    /// after which it becomes `file://<local path>`.
    pub location: String,
    /// Immutable origin location, preserved across downloads.
    pub remote_location: String,
    /// Snapshot of the search arguments that produced this product,
    /// used to rebuild a request for order-on-demand backends.
    #[serde(default)]
    pub search_args: BTreeMap<String, Value>,
    pub downloader: Option<PluginRef>,
    pub downloader_auth: Option<PluginRef>,
}

impl Product {
    pub fn new(provider: impl Into<String>, product_type: impl Into<String>, id: impl Into<String>, remote_location: impl Into<String>) -> Self {
        let remote_location = remote_location.into();
        Product {
            provider: provider.into(),
            product_type: product_type.into(),
            id: id.into(),
            title: String::new(),
            geometry: None,
            properties: BTreeMap::new(),
            assets: BTreeMap::new(),
            location: remote_location.clone(),
            remote_location,
            search_args: BTreeMap::new(),
            downloader: None,
            downloader_auth: None,
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.location.starts_with("file://") && self.location != self.remote_location
    }

    pub fn mark_downloaded(&mut self, local_path: &str) {
        self.location = format!("file://{local_path}");
    }
}

/// Thin wrapper so we can derive Serialize/Deserialize without fighting
/// geo_types's own (de)serialization story; internally it is just a
/// `geo_types::Geometry<f64>` round-tripped through WKT.
#[derive(Debug, Clone)]
pub struct GeometryWrapper(pub Geometry<f64>);

impl Serialize for GeometryWrapper {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use wkt::ToWkt;
        serializer.serialize_str(&self.0.wkt_string())
    }
}

impl<'de> Deserialize<'de> for GeometryWrapper {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let wkt_geom: wkt::Wkt<f64> = s.parse().map_err(serde::de::Error::custom)?;
        let geom: Geometry<f64> = wkt_geom.try_into().map_err(|e: wkt::conversion::Error| serde::de::Error::custom(e.to_string()))?;
        Ok(GeometryWrapper(geom))
    }
}

/// Ordered sequence of products plus optional total count and the
/// identity of the provider that produced them; concatenation is
/// associative and deduplication is by `(provider, id)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub products: Vec<Product>,
    pub total_items: Option<u64>,
}

impl SearchResult {
    pub fn new(products: Vec<Product>, total_items: Option<u64>) -> Self {
        SearchResult { products, total_items }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Associative concatenation, deduplicating by `(provider, id)`
    /// while preserving the order of first occurrence.
    pub fn merge(mut self, other: SearchResult) -> SearchResult {
        let mut seen: std::collections::HashSet<(String, String)> = self
            .products
            .iter()
            .map(|p| (p.provider.clone(), p.id.clone()))
            .collect();
        for product in other.products {
            let key = (product.provider.clone(), product.id.clone());
            if seen.insert(key) {
                self.products.push(product);
            }
        }
        let total_items = match (self.total_items, other.total_items) {
            (Some(a), Some(b)) => Some(a + b),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        SearchResult { products: self.products, total_items }
    }
}

/// A queryable's type annotation, modeled after Python-typing-style
/// annotations in the original (`base type`, optional alias, default,
/// required flag, description).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryableAnnotation {
    pub base_type: String,
    pub alias: Option<String>,
    pub default: Option<Value>,
    pub required: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Queryables {
    pub properties: BTreeMap<String, QueryableAnnotation>,
    pub additional_properties: bool,
}

impl Queryables {
    pub fn with_defaults() -> Self {
        let mut q = Queryables::default();
        q.properties.insert(
            "collection".to_string(),
            QueryableAnnotation {
                base_type: "string".to_string(),
                alias: None,
                default: None,
                required: true,
                description: Some("Collection/product type identifier".to_string()),
            },
        );
        q.properties.insert(
            "datetime".to_string(),
            QueryableAnnotation {
                base_type: "string".to_string(),
                alias: None,
                default: None,
                required: false,
                description: Some("RFC 3339 interval; exposes start_datetime/end_datetime aliases".to_string()),
            },
        );
        q
    }

    /// Union with another queryables set: properties from `other` are
    /// added when absent; the `additional_properties` flag is the OR of
    /// both sides.
    pub fn union(mut self, other: Queryables) -> Queryables {
        for (key, value) in other.properties {
            self.properties.entry(key).or_insert(value);
        }
        self.additional_properties = self.additional_properties || other.additional_properties;
        self
    }

    /// Look up a queryable by its provider-facing alias, falling back to
    /// the canonical key itself.
    pub fn get_by_provider_key(&self, provider_key: &str) -> Option<(&str, &QueryableAnnotation)> {
        self.properties.iter().find_map(|(key, annotation)| {
            if key == provider_key || annotation.alias.as_deref() == Some(provider_key) {
                Some((key.as_str(), annotation))
            } else {
                None
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalExtent {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialExtent {
    pub bbox: Option<[f64; 4]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub title: Option<String>,
    pub temporal_extent: Option<TemporalExtent>,
    pub spatial_extent: Option<SpatialExtent>,
    #[serde(default)]
    pub instruments: Vec<String>,
    pub platform: Option<String>,
    pub constellation: Option<String>,
    pub processing_level: Option<String>,
    pub license: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub alias: Option<String>,
}

/// Whether RFC 3339 validation is strict (fail on malformed extents) or
/// lax (coerce to defaults and warn), controlled by
/// `EODAG_VALIDATE_COLLECTIONS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionValidation {
    Strict,
    Lax,
}

impl Collection {
    pub fn validate(&self, mode: CollectionValidation) -> crate::error::Result<()> {
        if self.id.is_empty() {
            return Err(crate::error::EodagError::validation("collection id must be non-empty"));
        }
        if let Some(extent) = &self.temporal_extent {
            for bound in [&extent.start, &extent.end].into_iter().flatten() {
                if chrono::DateTime::parse_from_rfc3339(bound).is_err() {
                    match mode {
                        CollectionValidation::Strict => {
                            return Err(crate::error::EodagError::validation(format!(
                                "temporal extent bound {bound} is not RFC 3339"
                            )));
                        }
                        CollectionValidation::Lax => {
                            tracing::warn!("collection {} has a non-RFC3339 extent bound: {bound}; coercing", self.id);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// A logical product type, e.g. `S2_MSI_L1C`.
pub type ProductType = Collection;

/// Opaque authentication state owned by an auth plugin. Thread-safe for
/// reads; renewal is guarded by the single-flight lock in
/// `auth::SessionCache`.
#[derive(Debug, Clone, Default)]
pub struct AuthenticatedSession {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub signed_urls: BTreeMap<String, (String, chrono::DateTime<chrono::Utc>)>,
    pub aws_credentials: Option<Arc<aws_credential_types::Credentials>>,
}

impl AuthenticatedSession {
    pub fn is_token_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now >= expiry,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_result_merge_dedupes_by_provider_and_id() {
        let a = SearchResult::new(vec![Product::new("A", "S2_MSI_L1C", "1", "https://a/1")], Some(1));
        let b = SearchResult::new(
            vec![
                Product::new("A", "S2_MSI_L1C", "1", "https://a/1"),
                Product::new("B", "S2_MSI_L1C", "1", "https://b/1"),
            ],
            Some(2),
        );
        let merged = a.merge(b);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.total_items, Some(3));
    }

    #[test]
    fn queryables_always_includes_collection() {
        let q = Queryables::with_defaults();
        assert!(q.properties.contains_key("collection"));
        assert!(q.properties["collection"].required);
    }

    #[test]
    fn product_location_starts_equal_to_remote_location() {
        let p = Product::new("A", "S2_MSI_L1C", "1", "https://a/1");
        assert_eq!(p.location, p.remote_location);
        assert!(!p.is_downloaded());
    }

    #[test]
    fn product_mark_downloaded_sets_file_scheme_and_preserves_remote() {
        let mut p = Product::new("A", "S2_MSI_L1C", "1", "https://a/1");
        p.mark_downloaded("/tmp/out/1.zip");
        assert_eq!(p.location, "file:///tmp/out/1.zip");
        assert_eq!(p.remote_location, "https://a/1");
        assert!(p.is_downloaded());
    }

    #[test]
    fn collection_validate_rejects_empty_id() {
        let c = Collection {
            id: String::new(),
            title: None,
            temporal_extent: None,
            spatial_extent: None,
            instruments: vec![],
            platform: None,
            constellation: None,
            processing_level: None,
            license: None,
            keywords: vec![],
            alias: None,
        };
        assert!(c.validate(CollectionValidation::Strict).is_err());
    }
}
