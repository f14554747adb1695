//! Appends configured keys to URL query parameters; may probe an
//! `auth_uri` to validate credentials before use.

use async_trait::async_trait;

use crate::config::PluginConfig;
use crate::error::{EodagError, Result};

use super::{AuthPlugin, Authenticator};

pub struct QueryStringAuth {
    params: Vec<(String, String)>,
    auth_uri: Option<String>,
    http_client: reqwest::Client,
}

impl QueryStringAuth {
    pub fn from_config(config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let params = config.credentials.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let auth_uri = config.extra_str("auth_uri").map(str::to_string);
        Ok(QueryStringAuth { params, auth_uri, http_client })
    }
}

#[async_trait]
impl AuthPlugin for QueryStringAuth {
    fn plugin_type(&self) -> &'static str {
        "QueryStringAuth"
    }

    async fn authenticate(&self) -> Result<Authenticator> {
        if let Some(uri) = &self.auth_uri {
            let mut request = self.http_client.get(uri);
            for (k, v) in &self.params {
                request = request.query(&[(k, v)]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| EodagError::request("query_string_auth", e.to_string()))?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED || response.status() == reqwest::StatusCode::FORBIDDEN {
                return Err(EodagError::authentication("query_string_auth", "auth_uri probe rejected credentials"));
            }
        }
        let mut authenticator = Authenticator::default();
        for (k, v) in &self.params {
            authenticator.query_params.insert(k.clone(), v.clone());
        }
        Ok(authenticator)
    }
}
