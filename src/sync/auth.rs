//! Request authentication
//!
//! Applies the configured strategy to each outgoing sync request. All
//! strategies are stateless except OAuth2 client-credentials, which
//! caches its access token until 90% of the reported lifetime has
//! elapsed. A token fetch failure fails the attempt; requests are never
//! sent unauthenticated when OAuth2 is configured.

use crate::config::AuthConfig;
use crate::error::{LinkError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_after: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: i64,
}

fn default_expiry() -> i64 {
    3600
}

/// Applies one [`AuthConfig`] strategy to outgoing requests
pub struct Authenticator {
    config: AuthConfig,
    cache: Mutex<Option<CachedToken>>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        Authenticator {
            config,
            cache: Mutex::new(None),
        }
    }

    /// Attach credentials to a request builder
    pub async fn apply(
        &self,
        client: &reqwest::Client,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder> {
        match &self.config {
            AuthConfig::None => Ok(request),
            AuthConfig::ApiKey { header, value } => Ok(request.header(header, value)),
            AuthConfig::Bearer { token } => Ok(request.bearer_auth(token)),
            AuthConfig::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password)))
            }
            AuthConfig::CustomHeader { name, value } => Ok(request.header(name, value)),
            AuthConfig::OAuth2 { .. } => {
                let token = self.oauth2_token(client).await?;
                Ok(request.bearer_auth(token))
            }
        }
    }

    /// Cached token, refreshed once 90% of its lifetime has passed
    async fn oauth2_token(&self, client: &reqwest::Client) -> Result<String> {
        {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(token) = cache.as_ref() {
                if Utc::now() < token.refresh_after {
                    return Ok(token.access_token.clone());
                }
            }
        }
        self.fetch_token(client).await
    }

    async fn fetch_token(&self, client: &reqwest::Client) -> Result<String> {
        let (token_url, client_id, client_secret, scope) = match &self.config {
            AuthConfig::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            } => (token_url, client_id, client_secret, scope),
            _ => return Err(LinkError::Auth("not an OAuth2 configuration".into())),
        };

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope.as_str()));
        }

        let response = client
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| LinkError::Auth(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, token_url = %token_url, "Token endpoint rejected request");
            return Err(LinkError::Auth(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| LinkError::Auth(format!("token response malformed: {e}")))?;

        let lifetime = token.expires_in.max(1);
        let refresh_after = Utc::now() + ChronoDuration::seconds(lifetime * 9 / 10);
        debug!(expires_in = lifetime, "OAuth2 token refreshed");

        let access_token = token.access_token.clone();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedToken {
            access_token: token.access_token,
            refresh_after,
        });
        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_api_key_sets_header() {
        let auth = Authenticator::new(AuthConfig::ApiKey {
            header: "X-Api-Key".to_string(),
            value: "secret".to_string(),
        });
        let client = reqwest::Client::new();
        let builder = auth
            .apply(&client, client.get("http://localhost/x"))
            .await
            .unwrap();
        let request = builder.build().unwrap();
        assert_eq!(request.headers().get("X-Api-Key").unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_bearer_sets_authorization() {
        let auth = Authenticator::new(AuthConfig::Bearer {
            token: "tok-1".to_string(),
        });
        let client = reqwest::Client::new();
        let request = auth
            .apply(&client, client.get("http://localhost/x"))
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer tok-1"
        );
    }

    #[tokio::test]
    async fn test_basic_sets_authorization() {
        let auth = Authenticator::new(AuthConfig::Basic {
            username: "lab".to_string(),
            password: "pw".to_string(),
        });
        let client = reqwest::Client::new();
        let request = auth
            .apply(&client, client.get("http://localhost/x"))
            .await
            .unwrap()
            .build()
            .unwrap();
        let header = request.headers().get("authorization").unwrap();
        assert!(header.to_str().unwrap().starts_with("Basic "));
    }

    #[tokio::test]
    async fn test_none_leaves_request_untouched() {
        let auth = Authenticator::new(AuthConfig::None);
        let client = reqwest::Client::new();
        let request = auth
            .apply(&client, client.get("http://localhost/x"))
            .await
            .unwrap()
            .build()
            .unwrap();
        assert!(request.headers().get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_oauth2_unreachable_endpoint_is_auth_error() {
        let auth = Authenticator::new(AuthConfig::OAuth2 {
            token_url: "http://127.0.0.1:1/token".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            scope: None,
        });
        let client = reqwest::Client::new();
        let err = auth
            .apply(&client, client.get("http://localhost/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Auth(_)));
    }
}
