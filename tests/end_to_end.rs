//! End-to-end scenarios against the full config → gateway → plugin
//! pipeline, using `httpmock` to stand in for provider HTTP endpoints.

use std::collections::BTreeMap;

use eodag_core::config::{PaginationConfig, PluginConfig, ProductTypeConfig, ProviderConfig};
use eodag_core::download::DownloadOptions;
use eodag_core::gateway::Gateway;
use eodag_core::mapping::Mapping;
use eodag_core::model::Product;
use httpmock::MockServer;
use serde_json::{json, Value};

fn mapping() -> BTreeMap<String, Mapping> {
    BTreeMap::from([
        ("id".to_string(), Mapping::parse_single("$.properties.id").unwrap()),
        ("title".to_string(), Mapping::parse_single("$.properties.title").unwrap()),
        ("downloadLink".to_string(), Mapping::parse_single("$.properties.downloadLink").unwrap()),
    ])
}

fn search_provider(name: &str, priority: i32, endpoint: &str, auth_error_codes: Vec<u16>) -> ProviderConfig {
    let mut extra = BTreeMap::new();
    extra.insert("endpoint".to_string(), Value::String(endpoint.to_string()));
    if !auth_error_codes.is_empty() {
        extra.insert("auth_error_code".to_string(), Value::Array(auth_error_codes.into_iter().map(Value::from).collect()));
    }
    ProviderConfig {
        name: name.to_string(),
        priority,
        description: None,
        url: None,
        roles: vec![],
        group: None,
        products: BTreeMap::from([("SAT1".to_string(), ProductTypeConfig::default())]),
        api: None,
        search: Some(PluginConfig {
            plugin_type: "QueryStringSearch".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: mapping(),
            pagination: Some(PaginationConfig { next_page_url_tpl: None, next_page_query_obj: None, total_items_nb_key_path: None, items_per_page: 20 }),
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra,
        }),
        download: None,
        auth: None,
        search_auth: None,
        download_auth: None,
    }
}

fn feature(id: &str, title: &str, download_link: &str) -> Value {
    json!({"properties": {"id": id, "title": title, "downloadLink": download_link}})
}

#[tokio::test]
async fn happy_path_search_prefers_the_higher_priority_provider() {
    let server_a = MockServer::start_async().await;
    let server_b = MockServer::start_async().await;
    let mock_a = server_a
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/search");
            then.status(200).json_body(json!({"features": [
                feature("1", "P1", "https://a/1"),
                feature("2", "P2", "https://a/2"),
                feature("3", "P3", "https://a/3"),
            ]}));
        })
        .await;

    let config = BTreeMap::from([
        ("A".to_string(), search_provider("A", 2, &format!("{}/search", server_a.base_url()), vec![])),
        ("B".to_string(), search_provider("B", 1, &format!("{}/search", server_b.base_url()), vec![])),
    ]);
    let gateway = Gateway::new(config, reqwest::Client::new());

    let result = gateway.search("SAT1", 1, 10, true, BTreeMap::new(), None).await.unwrap();

    assert_eq!(result.len(), 3);
    assert!(result.products.iter().all(|p| p.provider == "A"));
    assert!(result.products.iter().all(|p| p.downloader.is_some() && p.downloader_auth.is_some()));
    mock_a.assert_async().await;
}

#[tokio::test]
async fn falls_back_to_next_provider_on_authentication_failure() {
    let server_a = MockServer::start_async().await;
    let server_b = MockServer::start_async().await;
    server_a
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/search");
            then.status(401);
        })
        .await;
    server_b
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/search");
            then.status(200).json_body(json!({"features": [
                feature("1", "P1", "https://b/1"),
                feature("2", "P2", "https://b/2"),
            ]}));
        })
        .await;

    let config = BTreeMap::from([
        ("A".to_string(), search_provider("A", 2, &format!("{}/search", server_a.base_url()), vec![401])),
        ("B".to_string(), search_provider("B", 1, &format!("{}/search", server_b.base_url()), vec![])),
    ]);
    let gateway = Gateway::new(config, reqwest::Client::new());

    let result = gateway.search("SAT1", 1, 10, true, BTreeMap::new(), None).await.unwrap();

    assert_eq!(result.len(), 2);
    assert!(result.products.iter().all(|p| p.provider == "B"));
}

#[tokio::test]
async fn misconfigured_provider_does_not_fall_back_to_next_provider() {
    let server_b = MockServer::start_async().await;
    let mock_b = server_b
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/search");
            then.status(200).json_body(json!({"features": [feature("1", "P1", "https://b/1")]}));
        })
        .await;

    let mut broken = search_provider("A", 2, "https://a/search", vec![]);
    broken.search.as_mut().unwrap().plugin_type = "NoSuchSearchPlugin".to_string();
    let config = BTreeMap::from([
        ("A".to_string(), broken),
        ("B".to_string(), search_provider("B", 1, &format!("{}/search", server_b.base_url()), vec![])),
    ]);
    let gateway = Gateway::new(config, reqwest::Client::new());

    let result = gateway.search("SAT1", 1, 10, true, BTreeMap::new(), None).await;

    assert!(matches!(result, Err(eodag_core::EodagError::Misconfigured { .. })));
    mock_b.assert_hits_async(0).await;
}

#[tokio::test]
async fn offline_product_orders_then_succeeds_once_ready() {
    use eodag_core::model::PluginRef;

    let server = MockServer::start_async().await;
    let mut offline_mock = server
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/product/1");
            then.status(503);
        })
        .await;
    let order_mock = server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/order/1");
            then.status(202);
        })
        .await;

    let mut extra = BTreeMap::new();
    extra.insert("order_link".to_string(), Value::String(format!("{}/order/{{id}}", server.base_url())));
    extra.insert("offline_status_code".to_string(), Value::from(503));
    let download_config = PluginConfig {
        plugin_type: "HTTPDownload".to_string(),
        credentials: BTreeMap::new(),
        metadata_mapping: BTreeMap::new(),
        pagination: None,
        literal_search_params: BTreeMap::new(),
        free_text_search_operations: None,
        extra,
    };
    let provider_config = ProviderConfig {
        name: "A".to_string(),
        priority: 0,
        description: None,
        url: None,
        roles: vec![],
        group: None,
        products: BTreeMap::from([("SAT1".to_string(), ProductTypeConfig::default())]),
        api: None,
        search: None,
        download: Some(download_config),
        auth: None,
        search_auth: None,
        download_auth: None,
    };
    let config = BTreeMap::from([("A".to_string(), provider_config)]);
    let gateway = Gateway::new(config, reqwest::Client::new());

    let dir = tempfile::tempdir().unwrap();
    let options = DownloadOptions { outputs_prefix: dir.path().to_path_buf(), extract: false, ..DownloadOptions::default() };
    let mut product = Product::new("A", "SAT1", "1", format!("{}/product/1", server.base_url()));
    product.title = "Prod1".to_string();
    product.downloader = Some(PluginRef { provider: "A".to_string(), plugin_type: "download".to_string() });

    let first_attempt = gateway.download(&mut product, &options).await;
    assert!(matches!(first_attempt, Err(eodag_core::EodagError::NotAvailable { .. })));
    order_mock.assert_async().await;

    offline_mock.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/product/1");
            then.status(200).body(vec![0u8; 1024]);
        })
        .await;

    let path = gateway.download(&mut product, &options).await.unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
    assert!(product.is_downloaded());
}

#[tokio::test]
async fn resume_skips_network_when_destination_and_record_already_exist() {
    use eodag_core::download::http::HttpDownloadPlugin;
    use eodag_core::download::DownloadPlugin;

    let server = MockServer::start_async().await;
    let never_called = server
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/product/1");
            then.status(200).body("should never be fetched");
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut product = Product::new("A", "SAT1", "1", format!("{}/product/1", server.base_url()));
    product.title = "SanitizedTitle".to_string();

    let options = DownloadOptions { outputs_prefix: dir.path().to_path_buf(), extract: false, ..DownloadOptions::default() };
    let destination = dir.path().join("SanitizedTitle.zip");
    std::fs::write(&destination, b"already here").unwrap();
    let record_dir = dir.path().join(".downloaded");
    std::fs::create_dir_all(&record_dir).unwrap();
    std::fs::write(record_dir.join(format!("{:x}", md5::compute(product.remote_location.as_bytes()))), &product.remote_location).unwrap();

    let plugin = HttpDownloadPlugin::from_config("A", &PluginConfig {
        plugin_type: "HTTPDownload".to_string(),
        credentials: BTreeMap::new(),
        metadata_mapping: BTreeMap::new(),
        pagination: None,
        literal_search_params: BTreeMap::new(),
        free_text_search_operations: None,
        extra: BTreeMap::new(),
    }, reqwest::Client::new())
    .unwrap();

    let path = plugin.download(&mut product, None, &options).await.unwrap();

    assert_eq!(path, destination);
    assert!(product.is_downloaded());
    never_called.assert_hits_async(0).await;
}
