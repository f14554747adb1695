//! S3-via-REST download: lists keys under a prefix through the plain
//! HTTP XML listing API (no AWS SDK, no signing), then streams each
//! matching key individually, preserving relative paths under the
//! destination directory.

use std::path::PathBuf;

use async_trait::async_trait;
use glob::Pattern;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::model::Product;

use super::base::{self, DownloadOptions, PrepareOutcome};
use super::DownloadPlugin;

pub struct S3RestDownloadPlugin {
    provider: String,
    bucket_base_url: String,
    glob_patterns: Vec<Pattern>,
    http_client: reqwest::Client,
}

impl S3RestDownloadPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let bucket_base_url = config
            .extra_str("bucket_base_url")
            .ok_or_else(|| EodagError::misconfigured(provider, "S3RestDownload requires bucket_base_url"))?
            .to_string();
        let glob_patterns = config
            .extra
            .get("glob_patterns")
            .and_then(serde_json::Value::as_array)
            .map(|values| values.iter().filter_map(serde_json::Value::as_str).filter_map(|s| Pattern::new(s).ok()).collect())
            .unwrap_or_default();
        Ok(S3RestDownloadPlugin { provider: provider.to_string(), bucket_base_url, glob_patterns, http_client })
    }

    fn matches(&self, key: &str) -> bool {
        self.glob_patterns.is_empty() || self.glob_patterns.iter().any(|p| p.matches(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .http_client
            .get(format!("{}?list-type=2&prefix={prefix}", self.bucket_base_url))
            .send()
            .await
            .map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
        if !response.status().is_success() {
            return Err(EodagError::request(&self.provider, format!("listing failed with HTTP {}", response.status())));
        }
        let xml = response.text().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
        Ok(parse_keys(&xml))
    }
}

fn parse_keys(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut keys = Vec::new();
    let mut in_key = false;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"Key" => in_key = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"Key" => in_key = false,
            Ok(Event::Text(t)) if in_key => {
                if let Ok(text) = t.unescape() {
                    keys.push(text.into_owned());
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    keys
}

#[async_trait]
impl DownloadPlugin for S3RestDownloadPlugin {
    fn plugin_type(&self) -> &'static str {
        "S3RestDownload"
    }

    async fn download(&self, product: &mut Product, authenticator: Option<&Authenticator>, options: &DownloadOptions) -> Result<PathBuf> {
        let (destination_dir, record_file) = match base::prepare(product, options, "")? {
            PrepareOutcome::AlreadyDownloaded(path) => {
                product.mark_downloaded(&path.display().to_string());
                return Ok(path);
            }
            PrepareOutcome::NeedsDownload { destination, record_file } => (destination, record_file),
        };

        let prefix = product.remote_location.trim_start_matches(&self.bucket_base_url).trim_start_matches('/');
        let keys = self.list_keys(prefix).await?;
        std::fs::create_dir_all(&destination_dir)
            .map_err(|e| EodagError::download(&product.id, format!("could not create destination directory: {e}")))?;

        for key in keys.iter().filter(|k| self.matches(k)) {
            let relative = key.strip_prefix(prefix).unwrap_or(key).trim_start_matches('/');
            let target = destination_dir.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| EodagError::download(&product.id, format!("could not create subdirectory: {e}")))?;
            }
            let mut request = self.http_client.get(format!("{}/{key}", self.bucket_base_url));
            if let Some(auth) = authenticator {
                for (header_key, header_value) in &auth.headers {
                    request = request.header(header_key, header_value);
                }
            }
            let response = request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
            if !response.status().is_success() {
                return Err(EodagError::download(&product.id, format!("failed to fetch key {key}: HTTP {}", response.status())));
            }
            let total = response.content_length();
            base::stream_body_to_file(response.bytes_stream(), &target, total, options.progress.as_ref(), options.cancellation.as_ref()).await?;
        }

        base::write_record(&record_file, &product.remote_location)?;
        let final_path = base::finalize(&destination_dir, options)?;
        product.mark_downloaded(&final_path.display().to_string());
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keys_extracts_key_elements() {
        let xml = "<ListBucketResult><Contents><Key>a/b.jp2</Key></Contents><Contents><Key>a/c.jp2</Key></Contents></ListBucketResult>";
        assert_eq!(parse_keys(xml), vec!["a/b.jp2".to_string(), "a/c.jp2".to_string()]);
    }

    #[test]
    fn matches_is_permissive_when_no_patterns_configured() {
        let plugin = S3RestDownloadPlugin {
            provider: "A".to_string(),
            bucket_base_url: "https://bucket".to_string(),
            glob_patterns: vec![],
            http_client: reqwest::Client::new(),
        };
        assert!(plugin.matches("anything.jp2"));
    }
}
