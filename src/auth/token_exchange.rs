//! OIDC token-exchange: runs a nested OIDC auth to obtain a subject
//! token, then exchanges it at `token_uri` for a target-audience token.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::PluginConfig;
use crate::error::{EodagError, Result};

use super::{AuthPlugin, Authenticator, SharedAuthPlugin};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct TokenExchangeAuth {
    token_uri: String,
    audience: String,
    subject_issuer: String,
    subject_auth: SharedAuthPlugin,
    http_client: reqwest::Client,
}

impl TokenExchangeAuth {
    pub fn from_config(config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let token_uri = config
            .extra_str("token_uri")
            .ok_or_else(|| EodagError::misconfigured("auth", "OIDCTokenExchangeAuth requires token_uri"))?
            .to_string();
        let audience = config
            .extra_str("audience")
            .ok_or_else(|| EodagError::misconfigured("auth", "OIDCTokenExchangeAuth requires audience"))?
            .to_string();
        let subject_issuer = config
            .extra_str("subject_issuer")
            .ok_or_else(|| EodagError::misconfigured("auth", "OIDCTokenExchangeAuth requires subject_issuer"))?
            .to_string();
        let subject_auth = super::keycloak::KeycloakAuth::from_config(config, http_client.clone())
            .map(|a| Arc::new(a) as SharedAuthPlugin)?;
        Ok(TokenExchangeAuth { token_uri, audience, subject_issuer, subject_auth, http_client })
    }

    pub fn with_subject_auth(token_uri: String, audience: String, subject_issuer: String, subject_auth: SharedAuthPlugin, http_client: reqwest::Client) -> Self {
        TokenExchangeAuth { token_uri, audience, subject_issuer, subject_auth, http_client }
    }
}

#[async_trait]
impl AuthPlugin for TokenExchangeAuth {
    fn plugin_type(&self) -> &'static str {
        "OIDCTokenExchangeAuth"
    }

    async fn authenticate(&self) -> Result<Authenticator> {
        let subject_authenticator = self.subject_auth.authenticate().await?;
        let subject_token = subject_authenticator
            .headers
            .get("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or_else(|| EodagError::authentication("oidc_token_exchange", "nested auth did not produce a bearer token"))?
            .to_string();

        let response: TokenResponse = self
            .http_client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
                ("audience", self.audience.as_str()),
                ("subject_issuer", self.subject_issuer.as_str()),
                ("subject_token", subject_token.as_str()),
                ("subject_token_type", "urn:ietf:params:oauth:token-type:access_token"),
            ])
            .send()
            .await
            .map_err(|e| EodagError::request("oidc_token_exchange", e.to_string()))?
            .json()
            .await
            .map_err(|e| EodagError::request("oidc_token_exchange", format!("malformed token response: {e}")))?;

        Ok(Authenticator::with_bearer(&response.access_token))
    }
}
