//! Simple token auth: `POST`s credentials to `auth_uri`, extracts a
//! token from the text body or a JSON key, then injects it as an
//! `Authorization: Bearer` header (or query string, if configured).

use async_trait::async_trait;
use serde_json::Value;

use crate::config::PluginConfig;
use crate::error::{EodagError, Result};
use crate::mapping::eval_jsonpath;

use super::{AuthPlugin, Authenticator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Injection {
    Header,
    QueryString,
}

pub struct TokenAuth {
    auth_uri: String,
    credentials: std::collections::BTreeMap<String, String>,
    headers: std::collections::BTreeMap<String, String>,
    token_key_path: Option<String>,
    injection: Injection,
    http_client: reqwest::Client,
}

impl TokenAuth {
    pub fn from_config(config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let auth_uri = config
            .extra_str("auth_uri")
            .ok_or_else(|| EodagError::misconfigured("auth", "TokenAuth requires auth_uri"))?
            .to_string();
        let token_key_path = config.extra_str("token_key_path").map(str::to_string);
        let injection = match config.extra_str("token_provision") {
            Some("qs") => Injection::QueryString,
            _ => Injection::Header,
        };
        let headers = config
            .extra
            .get("headers")
            .and_then(Value::as_object)
            .map(|map| map.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default();
        Ok(TokenAuth {
            auth_uri,
            credentials: config.credentials.clone(),
            headers,
            token_key_path,
            injection,
            http_client,
        })
    }
}

#[async_trait]
impl AuthPlugin for TokenAuth {
    fn plugin_type(&self) -> &'static str {
        "TokenAuth"
    }

    async fn authenticate(&self) -> Result<Authenticator> {
        let mut request = self.http_client.post(&self.auth_uri).form(&self.credentials);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request.send().await.map_err(|e| EodagError::request("token_auth", e.to_string()))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED || response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(EodagError::authentication("token_auth", "credentials rejected"));
        }
        let body = response.text().await.map_err(|e| EodagError::request("token_auth", e.to_string()))?;
        let token = match &self.token_key_path {
            Some(path) => {
                let doc: Value = serde_json::from_str(&body)
                    .map_err(|e| EodagError::misconfigured("token_auth", format!("auth response is not JSON: {e}")))?;
                match eval_jsonpath(path, &doc) {
                    crate::mapping::Extracted::One(v) => v.as_str().map(str::to_string).unwrap_or_default(),
                    _ => return Err(EodagError::authentication("token_auth", "token_key_path did not resolve to a single value")),
                }
            }
            None => body.trim().to_string(),
        };
        let mut authenticator = match self.injection {
            Injection::Header => Authenticator::with_bearer(&token),
            Injection::QueryString => Authenticator::default(),
        };
        if self.injection == Injection::QueryString {
            authenticator.query_params.insert("token".to_string(), token);
        }
        Ok(authenticator)
    }
}
