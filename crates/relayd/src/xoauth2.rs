use anyhow::Context;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;

/// Slack subtracted from `expires_in` so a token is refreshed before
/// the upstream would start rejecting it.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// OAuth2 access tokens for XOAUTH2 upstream auth, minted from a
/// refresh token. The latest access token is cached until shortly
/// before its expiry.
pub struct TokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(
        token_url: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url,
            client_id,
            client_secret,
            refresh_token,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> anyhow::Result<String> {
        if let Some(cached) = &*self.cached.lock() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("requesting access token")?
            .error_for_status()
            .context("token endpoint rejected the refresh request")?;

        let token: TokenResponse = response
            .json()
            .await
            .context("decoding token endpoint response")?;

        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let expires_at = Instant::now() + lifetime.saturating_sub(EXPIRY_SLACK);

        tracing::debug!("obtained fresh access token");

        self.cached.lock().replace(CachedToken {
            access_token: token.access_token.clone(),
            expires_at,
        });

        Ok(token.access_token)
    }
}
