// src/auth/oauth.rs — Google sign-in (authorization code flow)

use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::time::Duration;

use crate::infra::config::GoogleOAuthConfig;
use crate::infra::errors::ChatHubError;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Profile returned by the userinfo endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleUserInfo {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub verified_email: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GoogleOAuth {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

fn oauth_err(context: &str, e: impl std::fmt::Display) -> ChatHubError {
    ChatHubError::OAuth(format!("{context}: {e}"))
}

impl GoogleOAuth {
    /// `default_redirect` is used when the config does not name one.
    pub fn new(config: &GoogleOAuthConfig, default_redirect: &str) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config
                .redirect_uri
                .clone()
                .unwrap_or_else(|| default_redirect.to_string()),
        }
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Consent URL carrying `state` for CSRF verification on return.
    pub fn authorization_url(&self, state: &str) -> Result<String, ChatHubError> {
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(AUTH_URL.into()).map_err(|e| oauth_err("auth url", e))?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.into()).map_err(|e| oauth_err("token url", e))?)
            .set_redirect_uri(
                RedirectUrl::new(self.redirect_uri.clone())
                    .map_err(|e| oauth_err("redirect url", e))?,
            );

        let state = state.to_string();
        let (url, _) = client
            .authorize_url(move || CsrfToken::new(state))
            .add_scope(Scope::new("openid".into()))
            .add_scope(Scope::new("email".into()))
            .add_scope(Scope::new("profile".into()))
            .url();

        Ok(url.to_string())
    }

    /// Exchange the callback code for a token and fetch the user's profile.
    pub async fn exchange(&self, code: &str) -> Result<GoogleUserInfo, ChatHubError> {
        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(AUTH_URL.into()).map_err(|e| oauth_err("auth url", e))?)
            .set_token_uri(TokenUrl::new(TOKEN_URL.into()).map_err(|e| oauth_err("token url", e))?)
            .set_redirect_uri(
                RedirectUrl::new(self.redirect_uri.clone())
                    .map_err(|e| oauth_err("redirect url", e))?,
            );

        // No redirects on the token endpoint (SSRF)
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| oauth_err("http client", e))?;

        let token = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&http_client)
            .await
            .map_err(|e| oauth_err("code exchange failed", e))?;

        let response = http_client
            .get(USERINFO_URL)
            .bearer_auth(token.access_token().secret())
            .send()
            .await
            .map_err(|e| oauth_err("userinfo request failed", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatHubError::OAuth(format!("userinfo HTTP {}: {}", status, body)));
        }

        response
            .json::<GoogleUserInfo>()
            .await
            .map_err(|e| oauth_err("invalid userinfo", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(redirect: Option<&str>) -> GoogleOAuthConfig {
        GoogleOAuthConfig {
            client_id: "client-123".into(),
            client_secret: "secret".into(),
            redirect_uri: redirect.map(String::from),
        }
    }

    #[test]
    fn test_default_redirect_used() {
        let g = GoogleOAuth::new(&config(None), "http://localhost:5000/auth/google/callback");
        assert_eq!(g.redirect_uri(), "http://localhost:5000/auth/google/callback");

        let g = GoogleOAuth::new(&config(Some("https://chat.example.com/cb")), "unused");
        assert_eq!(g.redirect_uri(), "https://chat.example.com/cb");
    }

    #[test]
    fn test_authorization_url_contains_state_and_scopes() {
        let g = GoogleOAuth::new(&config(None), "http://localhost:5000/auth/google/callback");
        let url = g.authorization_url("state-xyz").unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["state"], "state-xyz");
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["response_type"], "code");
        assert!(params["scope"].contains("email"));
        assert!(url.starts_with(AUTH_URL));
    }

    #[test]
    fn test_bad_redirect_rejected() {
        let g = GoogleOAuth::new(&config(Some("not a url")), "unused");
        assert!(matches!(g.authorization_url("s"), Err(ChatHubError::OAuth(_))));
    }

    #[test]
    fn test_userinfo_deserialize_minimal() {
        let info: GoogleUserInfo =
            serde_json::from_str(r#"{"id":"1","email":"x@gmail.com"}"#).unwrap();
        assert_eq!(info.email, "x@gmail.com");
        assert!(info.picture.is_none());
        assert!(!info.verified_email);
    }
}
