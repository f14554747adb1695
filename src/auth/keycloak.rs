//! Keycloak/OIDC password grant: `POST`s `grant_type=password` with
//! client credentials; stores `access_token`, `refresh_token`, and
//! expiry. Subsequent calls use the refresh token if not expired; if
//! refresh fails and a cached token is still present, it is reused
//! (one-time-password accommodation).

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::auth::SessionCache;
use crate::config::PluginConfig;
use crate::error::{EodagError, Result};

use super::{AuthPlugin, Authenticator};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct KeycloakAuth {
    token_uri: String,
    client_id: String,
    client_secret: Option<String>,
    username: String,
    password: String,
    http_client: reqwest::Client,
    cache: SessionCache,
    provider_key: String,
}

impl KeycloakAuth {
    pub fn from_config(config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let token_uri = config
            .extra_str("token_uri")
            .ok_or_else(|| EodagError::misconfigured("auth", "KeycloakOIDCPasswordAuth requires token_uri"))?
            .to_string();
        let client_id = config
            .extra_str("client_id")
            .ok_or_else(|| EodagError::misconfigured("auth", "KeycloakOIDCPasswordAuth requires client_id"))?
            .to_string();
        let username = config
            .credentials
            .get("username")
            .ok_or_else(|| EodagError::misconfigured("auth", "KeycloakOIDCPasswordAuth requires a username credential"))?
            .clone();
        let password = config
            .credentials
            .get("password")
            .ok_or_else(|| EodagError::misconfigured("auth", "KeycloakOIDCPasswordAuth requires a password credential"))?
            .clone();
        Ok(KeycloakAuth {
            token_uri,
            client_id,
            client_secret: config.extra_str("client_secret").map(str::to_string),
            username,
            password,
            http_client,
            cache: SessionCache::default(),
            provider_key: "keycloak".to_string(),
        })
    }

    async fn request_password_grant(&self) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "password".to_string()),
            ("client_id", self.client_id.clone()),
            ("username", self.username.clone()),
            ("password", self.password.clone()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.send_token_request(form).await
    }

    async fn request_refresh_grant(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("client_id", self.client_id.clone()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.send_token_request(form).await
    }

    async fn send_token_request(&self, form: Vec<(&str, String)>) -> Result<TokenResponse> {
        let response = self
            .http_client
            .post(&self.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| EodagError::request("keycloak", e.to_string()))?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED || response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(EodagError::authentication("keycloak", "credentials or refresh token rejected"));
        }
        response.json().await.map_err(|e| EodagError::request("keycloak", format!("malformed token response: {e}")))
    }
}

#[async_trait]
impl AuthPlugin for KeycloakAuth {
    fn plugin_type(&self) -> &'static str {
        "KeycloakOIDCPasswordAuth"
    }

    async fn authenticate(&self) -> Result<Authenticator> {
        let session_lock = self.cache.session_for(&self.provider_key).await;
        let mut session = session_lock.lock().await;
        let now = Utc::now();

        if let (Some(token), Some(expiry)) = (session.token.clone(), session.expires_at) {
            if now < expiry {
                return Ok(Authenticator::with_bearer(&token));
            }
        }

        let refreshed = if let Some(refresh_token) = session.refresh_token.clone() {
            self.request_refresh_grant(&refresh_token).await
        } else {
            Err(EodagError::authentication("keycloak", "no refresh token cached"))
        };

        let token_response = match refreshed {
            Ok(resp) => resp,
            Err(_) => match self.request_password_grant().await {
                Ok(resp) => resp,
                Err(e) => {
                    if let Some(cached) = session.token.clone() {
                        tracing::warn!("keycloak refresh failed, reusing cached token: {e}");
                        return Ok(Authenticator::with_bearer(&cached));
                    }
                    return Err(e);
                }
            },
        };

        session.token = Some(token_response.access_token.clone());
        session.refresh_token = token_response.refresh_token;
        session.expires_at = token_response.expires_in.map(|secs| now + chrono::Duration::seconds(secs));
        Ok(Authenticator::with_bearer(&token_response.access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config() -> PluginConfig {
        let mut credentials = BTreeMap::new();
        credentials.insert("username".to_string(), "alice".to_string());
        credentials.insert("password".to_string(), "secret".to_string());
        let mut extra = BTreeMap::new();
        extra.insert("token_uri".to_string(), serde_json::Value::String("https://idp/token".to_string()));
        extra.insert("client_id".to_string(), serde_json::Value::String("eodag".to_string()));
        PluginConfig {
            plugin_type: "KeycloakOIDCPasswordAuth".to_string(),
            credentials,
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra,
        }
    }

    #[test]
    fn requires_username_and_password_credentials() {
        let auth = KeycloakAuth::from_config(&config(), reqwest::Client::new());
        assert!(auth.is_ok());
    }
}
