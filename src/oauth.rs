use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

use crate::config::OAuthSettings;
use crate::platform::TokenProvider;
use crate::store::CredentialStore;

const STATE_LENGTH: usize = 64;
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Operator OAuth state, stored as a singleton.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCredentials {
    /// Anti-forgery value of the login in progress.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expiry: Option<OffsetDateTime>,
}

impl AdminCredentials {
    fn needs_refresh(&self, now: OffsetDateTime) -> bool {
        self.expiry.is_some_and(|expiry| expiry - REFRESH_MARGIN <= now)
    }
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("state", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OAuthError {
    #[error("login state does not match")]
    StateMismatch,
    #[error("operator has not logged in")]
    NotLoggedIn,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Authorization-code login for the operator and the platform token it yields.
pub struct OAuthLogin {
    settings: OAuthSettings,
    store: Arc<dyn CredentialStore>,
    client: Client,
}

impl OAuthLogin {
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(settings: OAuthSettings, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build OAuth HTTP client")?;
        Ok(Self {
            settings,
            store,
            client,
        })
    }

    /// Stores a fresh state value and returns the provider URL to redirect to.
    ///
    /// # Errors
    /// Returns error if the state cannot be stored or the auth URL is invalid.
    pub async fn begin_login(&self) -> Result<String> {
        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_LENGTH)
            .map(char::from)
            .collect();

        let mut credentials = self.store.get_admin().await?.unwrap_or_default();
        credentials.state.clone_from(&state);
        self.store.save_admin(&credentials).await?;

        let url = Url::parse_with_params(
            &self.settings.auth_url,
            &[
                ("client_id", self.settings.client_id.as_str()),
                ("redirect_uri", self.settings.redirect_url.as_str()),
                ("response_type", "code"),
                ("scope", self.settings.scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state.as_str()),
            ],
        )
        .context("Invalid oauth.auth_url")?;
        Ok(url.into())
    }

    /// Exchanges the provider's authorization code for tokens.
    ///
    /// # Errors
    /// Returns [`OAuthError::StateMismatch`] if `state` is not the pending one, or
    /// an error if the token exchange fails.
    pub async fn complete_login(&self, code: &str, state: &str) -> Result<()> {
        let mut credentials = self.store.get_admin().await?.unwrap_or_default();
        if credentials.state.is_empty() || credentials.state != state {
            return Err(OAuthError::StateMismatch.into());
        }

        let token = self
            .request_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.settings.redirect_url.as_str()),
            ])
            .await
            .context("Authorization code exchange failed")?;

        credentials.state.clear();
        apply_token(&mut credentials, token, OffsetDateTime::now_utc());
        self.store.save_admin(&credentials).await?;
        info!("Operator login completed");
        Ok(())
    }

    async fn refresh(&self, mut credentials: AdminCredentials) -> Result<AdminCredentials> {
        if credentials.refresh_token.is_empty() {
            return Err(OAuthError::NotLoggedIn.into());
        }
        let refresh_token = credentials.refresh_token.clone();
        let token = self
            .request_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .await
            .context("Token refresh failed")?;
        apply_token(&mut credentials, token, OffsetDateTime::now_utc());
        self.store.save_admin(&credentials).await?;
        info!("Refreshed operator access token");
        Ok(credentials)
    }

    async fn request_token(&self, grant: &[(&str, &str)]) -> Result<TokenResponse> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ];
        form.extend_from_slice(grant);

        let response = self
            .client
            .post(&self.settings.token_url)
            .form(&form)
            .send()
            .await
            .context("Token endpoint request failed")?;
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read token response body")?;
        if !status.is_success() {
            anyhow::bail!("Token endpoint error ({status}): {text}");
        }
        serde_json::from_str(&text).context("Failed to parse token response")
    }
}

fn apply_token(credentials: &mut AdminCredentials, token: TokenResponse, now: OffsetDateTime) {
    credentials.access_token = token.access_token;
    if let Some(refresh_token) = token.refresh_token.filter(|t| !t.is_empty()) {
        credentials.refresh_token = refresh_token;
    }
    credentials.expiry = token
        .expires_in
        .map(|secs| now + time::Duration::seconds(secs));
}

#[async_trait]
impl TokenProvider for OAuthLogin {
    async fn access_token(&self) -> Result<String> {
        let credentials = self
            .store
            .get_admin()
            .await?
            .filter(|c| !c.access_token.is_empty())
            .ok_or(OAuthError::NotLoggedIn)?;
        if credentials.needs_refresh(OffsetDateTime::now_utc()) {
            return Ok(self.refresh(credentials).await?.access_token);
        }
        Ok(credentials.access_token)
    }
}
