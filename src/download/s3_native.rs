//! S3-native download: authenticates via the AWS strategy chain,
//! lists objects through the SDK, and for providers requiring SAFE
//! layout rewrites each key according to a fixed, data-driven regex
//! table before writing it to disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::config::{AppName, BehaviorVersion};
use aws_types::region::Region;
use regex::Regex;

use crate::auth::aws::AwsAuth;
use crate::auth::Authenticator;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::model::Product;

use super::base::{self, DownloadOptions, PrepareOutcome};
use super::DownloadPlugin;

pub struct S3NativeDownloadPlugin {
    provider: String,
    endpoint_url: Option<String>,
    region: String,
    bucket: String,
    build_safe: bool,
    aws_auth: AwsAuth,
}

impl S3NativeDownloadPlugin {
    pub fn from_config(provider: &str, config: &PluginConfig) -> Result<Self> {
        let bucket = config
            .extra_str("bucket")
            .ok_or_else(|| EodagError::misconfigured(provider, "S3NativeDownload requires bucket"))?
            .to_string();
        Ok(S3NativeDownloadPlugin {
            provider: provider.to_string(),
            endpoint_url: config.extra_str("endpoint_url").map(str::to_string),
            region: config.extra_str("region").unwrap_or("us-east-1").to_string(),
            bucket,
            build_safe: config.extra.get("build_safe").and_then(serde_json::Value::as_bool).unwrap_or(false),
            aws_auth: AwsAuth::from_config(config)?,
        })
    }

    async fn client(&self) -> Result<aws_sdk_s3::Client> {
        let credentials = self.aws_auth.resolve_credentials()?;
        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .app_name(AppName::new(env!("CARGO_PKG_NAME")).expect("invalid package name"))
            .behavior_version(BehaviorVersion::latest())
            .force_path_style(true)
            .region(Region::new(self.region.clone()));
        if let Some(endpoint) = &self.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(aws_sdk_s3::Client::from_conf(builder.build()))
    }

    async fn list_keys(&self, client: &aws_sdk_s3::Client, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut request = client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let response = request.send().await.map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl DownloadPlugin for S3NativeDownloadPlugin {
    fn plugin_type(&self) -> &'static str {
        "S3NativeDownload"
    }

    async fn download(&self, product: &mut Product, _authenticator: Option<&Authenticator>, options: &DownloadOptions) -> Result<PathBuf> {
        let (destination_dir, record_file) = match base::prepare(product, options, "")? {
            PrepareOutcome::AlreadyDownloaded(path) => {
                product.mark_downloaded(&path.display().to_string());
                return Ok(path);
            }
            PrepareOutcome::NeedsDownload { destination, record_file } => (destination, record_file),
        };

        let prefix = product.remote_location.trim_start_matches(&format!("s3://{}/", self.bucket));
        let client = self.client().await?;
        let keys = self.list_keys(&client, prefix).await?;

        std::fs::create_dir_all(&destination_dir)
            .map_err(|e| EodagError::download(&product.id, format!("could not create destination directory: {e}")))?;

        for key in &keys {
            let relative = if self.build_safe {
                safe_format::rewrite_key(key, &base::sanitize(&product.title), &product.id)
            } else {
                key.strip_prefix(prefix).unwrap_or(key).trim_start_matches('/').to_string()
            };
            let target = destination_dir.join(&relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| EodagError::download(&product.id, format!("could not create subdirectory: {e}")))?;
            }
            let object = client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| EodagError::request(&self.provider, e.to_string()))?;
            let mut body = object.body.into_async_read();
            let mut file = tokio::fs::File::create(&target)
                .await
                .map_err(|e| EodagError::download(&product.id, format!("could not create {}: {e}", target.display())))?;
            let written = tokio::io::copy(&mut body, &mut file)
                .await
                .map_err(|e| EodagError::download(&product.id, format!("could not write {}: {e}", target.display())))?;
            if let Some(progress) = &options.progress {
                progress(written, None);
            }
        }

        if self.build_safe {
            safe_format::post_process_manifest(&destination_dir)?;
        }

        base::write_record(&record_file, &product.remote_location)?;
        let final_path = base::finalize(&destination_dir, options)?;
        product.mark_downloaded(&final_path.display().to_string());
        Ok(final_path)
    }
}

/// SAFE-format path rewriting rules: deliberately a data table rather
/// than bespoke branching code, so adding a new Sentinel variant is an
/// edit to the table, not to control flow.
mod safe_format {
    use super::*;
    use std::sync::OnceLock;

    struct Rule {
        pattern: Regex,
        template: &'static str,
    }

    fn rules() -> &'static Vec<Rule> {
        static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
        RULES.get_or_init(|| {
            vec![
                Rule {
                    pattern: Regex::new(r"tiles/.*/R(?P<res>\d+m)/(?P<file>[^/]+)\.jp2$").unwrap(),
                    template: "{title}.SAFE/GRANULE/{id}/IMG_DATA/R{res}/{file}.jp2",
                },
                Rule {
                    pattern: Regex::new(r"tiles/.*/(?P<file>MTD_TL)\.xml$").unwrap(),
                    template: "{title}.SAFE/GRANULE/{id}/{file}.xml",
                },
                Rule {
                    pattern: Regex::new(r"tiles/.*/qi/(?P<file>[^/]+)$").unwrap(),
                    template: "{title}.SAFE/GRANULE/{id}/QI_DATA/{file}",
                },
                Rule {
                    pattern: Regex::new(r"datastrip/.*/(?P<file>[^/]+)$").unwrap(),
                    template: "{title}.SAFE/DATASTRIP/{id}/{file}",
                },
                Rule {
                    pattern: Regex::new(r"measurement/(?P<file>s1[a-z0-9\-]+\.tiff)$").unwrap(),
                    template: "{title}.SAFE/measurement/{file}",
                },
                Rule {
                    pattern: Regex::new(r"annotation/(?P<file>s1[a-z0-9\-]+\.xml)$").unwrap(),
                    template: "{title}.SAFE/annotation/{file}",
                },
                Rule {
                    pattern: Regex::new(r"annotation/calibration/(?P<file>[^/]+)$").unwrap(),
                    template: "{title}.SAFE/annotation/calibration/{file}",
                },
            ]
        })
    }

    /// Rewrites one S3 key into its SAFE-relative path; keys matching no
    /// rule fall through unchanged (relative to the bucket root) so
    /// unrecognized auxiliary files are still preserved rather than
    /// dropped.
    pub fn rewrite_key(key: &str, title: &str, id: &str) -> String {
        for rule in rules() {
            if let Some(captures) = rule.pattern.captures(key) {
                let mut rendered = rule.template.replace("{title}", title).replace("{id}", id);
                for name in rule.pattern.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        rendered = rendered.replace(&format!("{{{name}}}"), value.as_str());
                    }
                }
                return rendered;
            }
        }
        key.to_string()
    }

    /// After extraction, creates the empty directories SAFE products
    /// expect but S3 listings never materialize (`AUX_DATA`, `HTML`,
    /// `rep_info`), and renames `GRANULE/0`/`DATASTRIP/0` placeholders to
    /// the ids recorded in `manifest.safe`'s `fileLocation` entries.
    pub fn post_process_manifest(destination_dir: &Path) -> Result<()> {
        let Some(safe_root) = find_safe_root(destination_dir) else { return Ok(()) };

        for empty_dir in ["AUX_DATA", "HTML", "rep_info"] {
            std::fs::create_dir_all(safe_root.join(empty_dir))
                .map_err(|e| EodagError::download(safe_root.display().to_string(), format!("could not create {empty_dir}: {e}")))?;
        }

        let manifest_path = safe_root.join("manifest.safe");
        if !manifest_path.exists() {
            return Ok(());
        }
        let manifest = std::fs::read_to_string(&manifest_path)
            .map_err(|e| EodagError::download(manifest_path.display().to_string(), format!("could not read manifest: {e}")))?;

        rename_placeholder(&safe_root.join("GRANULE").join("0"), &manifest_granule_id(&manifest));
        rename_placeholder(&safe_root.join("DATASTRIP").join("0"), &manifest_datastrip_id(&manifest));
        Ok(())
    }

    fn find_safe_root(destination_dir: &Path) -> Option<PathBuf> {
        if destination_dir.extension().and_then(|e| e.to_str()) == Some("SAFE") {
            return Some(destination_dir.to_path_buf());
        }
        std::fs::read_dir(destination_dir).ok()?.flatten().map(|e| e.path()).find(|p| p.extension().and_then(|e| e.to_str()) == Some("SAFE"))
    }

    fn manifest_granule_id(manifest: &str) -> String {
        extract_href_segment(manifest, "GRANULE/").unwrap_or_else(|| "UNKNOWN_GRANULE".to_string())
    }

    fn manifest_datastrip_id(manifest: &str) -> String {
        extract_href_segment(manifest, "DATASTRIP/").unwrap_or_else(|| "UNKNOWN_DATASTRIP".to_string())
    }

    fn extract_href_segment(manifest: &str, marker: &str) -> Option<String> {
        let start = manifest.find(marker)? + marker.len();
        let rest = &manifest[start..];
        let end = rest.find(['/', '"']).unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }

    fn rename_placeholder(placeholder: &Path, new_id: &str) {
        if !placeholder.exists() {
            return;
        }
        if let Some(parent) = placeholder.parent() {
            let _ = std::fs::rename(placeholder, parent.join(new_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::safe_format::rewrite_key;

    #[test]
    fn rewrites_jp2_tile_into_safe_granule_layout() {
        let rewritten = rewrite_key("tiles/33/T/WN/R10m/B04.jp2", "S2A_TITLE", "L1C_T33TWN_A001");
        assert_eq!(rewritten, "S2A_TITLE.SAFE/GRANULE/L1C_T33TWN_A001/IMG_DATA/R10m/B04.jp2");
    }

    #[test]
    fn unmatched_key_passes_through_unchanged() {
        assert_eq!(rewrite_key("unrelated/path.txt", "title", "id"), "unrelated/path.txt");
    }
}
