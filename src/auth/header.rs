//! Copies a configured header template map, substituting credential
//! placeholders (`{username}`, `{password}`, or any other configured
//! credential key) into each header value.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::PluginConfig;
use crate::error::Result;

use super::{AuthPlugin, Authenticator};

pub struct HeaderAuth {
    headers: Vec<(String, String)>,
}

impl HeaderAuth {
    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        let mut headers = Vec::new();
        if let Some(Value::Object(map)) = config.extra.get("headers") {
            for (key, value) in map {
                if let Some(template) = value.as_str() {
                    let mut rendered = template.to_string();
                    for (cred_key, cred_value) in &config.credentials {
                        rendered = rendered.replace(&format!("{{{cred_key}}}"), cred_value);
                    }
                    headers.push((key.clone(), rendered));
                }
            }
        }
        Ok(HeaderAuth { headers })
    }
}

#[async_trait]
impl AuthPlugin for HeaderAuth {
    fn plugin_type(&self) -> &'static str {
        "HeaderAuth"
    }

    async fn authenticate(&self) -> Result<Authenticator> {
        let mut authenticator = Authenticator::default();
        for (key, value) in &self.headers {
            authenticator.headers.insert(key.clone(), value.clone());
        }
        Ok(authenticator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn substitutes_credential_placeholders_in_header_templates() {
        let mut credentials = BTreeMap::new();
        credentials.insert("apikey".to_string(), "abc123".to_string());
        let mut extra = BTreeMap::new();
        extra.insert("headers".to_string(), serde_json::json!({"X-Api-Key": "{apikey}"}));
        let config = PluginConfig {
            plugin_type: "HeaderAuth".to_string(),
            credentials,
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra,
        };
        let auth = HeaderAuth::from_config(&config).unwrap();
        let authenticator = auth.authenticate().await.unwrap();
        assert_eq!(authenticator.headers.get("X-Api-Key").unwrap(), "abc123");
    }
}
