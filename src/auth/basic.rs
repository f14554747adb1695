//! HTTP Basic/Digest authentication: wraps credentials from config into
//! the standard `Authorization` header. (Digest's challenge-response
//! handshake is left to the HTTP transport layer; this plugin supplies
//! the credential material either way.)

use async_trait::async_trait;
use base64::Engine;

use crate::config::PluginConfig;
use crate::error::{EodagError, Result};

use super::{AuthPlugin, Authenticator};

pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        let username = config
            .credentials
            .get("username")
            .ok_or_else(|| EodagError::misconfigured("auth", "HTTPBasicAuth requires a username credential"))?
            .clone();
        let password = config
            .credentials
            .get("password")
            .ok_or_else(|| EodagError::misconfigured("auth", "HTTPBasicAuth requires a password credential"))?
            .clone();
        Ok(BasicAuth { username, password })
    }
}

#[async_trait]
impl AuthPlugin for BasicAuth {
    fn plugin_type(&self) -> &'static str {
        "HTTPBasicAuth"
    }

    async fn authenticate(&self) -> Result<Authenticator> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", self.username, self.password));
        Ok(Authenticator::with_header("Authorization", format!("Basic {encoded}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(username: &str, password: &str) -> PluginConfig {
        let mut credentials = BTreeMap::new();
        credentials.insert("username".to_string(), username.to_string());
        credentials.insert("password".to_string(), password.to_string());
        PluginConfig {
            plugin_type: "HTTPBasicAuth".to_string(),
            credentials,
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn encodes_username_and_password() {
        let auth = BasicAuth::from_config(&config("alice", "secret")).unwrap();
        let authenticator = auth.authenticate().await.unwrap();
        assert_eq!(authenticator.headers.get("Authorization").unwrap(), "Basic YWxpY2U6c2VjcmV0");
    }

    #[test]
    fn missing_credentials_is_misconfigured() {
        let config = PluginConfig {
            plugin_type: "HTTPBasicAuth".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra: BTreeMap::new(),
        };
        assert!(BasicAuth::from_config(&config).is_err());
    }
}
