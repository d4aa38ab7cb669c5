//! Bearer credential acquisition and the process-wide token cache.
//!
//! The backend authenticates with short-lived bearer tokens minted from an API
//! key. `TokenCache` holds the current token, refreshes it once it is within
//! `refresh_margin` of expiry, and serializes refreshes so concurrent callers
//! that all find the cache stale trigger exactly one issuer request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::error::{ErrorContext, ProviderError};

/// Refresh a cached token once it is this close to expiry.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Default IAM endpoint for API-key token exchange.
pub const DEFAULT_IAM_URL: &str = "https://iam.cloud.ibm.com/identity/token";

/// Lifetime assumed when the issuer omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(20 * 60);

const IAM_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

/// A freshly issued bearer token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Exchanges an API key for a bearer token.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, api_key: &str) -> Result<IssuedToken, ProviderError>;
}

// =============================================================================
// IAM ISSUER
// =============================================================================

/// HTTP credential issuer speaking the IAM API-key grant.
#[derive(Debug, Clone)]
pub struct IamTokenIssuer {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct IamTokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

impl IamTokenIssuer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ProviderError::config("IAM token URL is empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl CredentialIssuer for IamTokenIssuer {
    async fn issue(&self, api_key: &str) -> Result<IssuedToken, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[("grant_type", IAM_GRANT_TYPE), ("apikey", api_key)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let ctx = ErrorContext::new().with_status(status.as_u16());
        let parsed = serde_json::from_str::<IamTokenResponse>(&body).ok();

        if !status.is_success() {
            let (message, ctx) = match parsed {
                Some(p) => {
                    let ctx = match p.error_code {
                        Some(code) => ctx.with_code(code),
                        None => ctx,
                    };
                    (p.error_message.unwrap_or_default(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };
            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited(Duration::from_secs(5), ctx),
                400 | 401 | 403 => ProviderError::auth_with_context(message, ctx),
                s => ProviderError::provider_with_context("iam", message, s >= 500, ctx),
            });
        }

        let parsed = parsed
            .ok_or_else(|| ProviderError::provider("iam", "Invalid token response JSON", false))?;
        let access_token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::auth("Token response missing access_token"))?;

        Ok(IssuedToken {
            access_token,
            expires_in: parsed
                .expires_in
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TOKEN_LIFETIME),
        })
    }
}

// =============================================================================
// TOKEN CACHE
// =============================================================================

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, margin: Duration, now: Instant) -> bool {
        self.expires_at
            .checked_duration_since(now)
            .map(|left| left > margin)
            .unwrap_or(false)
    }
}

/// Expiry-aware bearer token cache with single-flight refresh.
///
/// Share one instance (behind `Arc`) across every gateway that talks to the
/// same backend account.
pub struct TokenCache {
    issuer: Arc<dyn CredentialIssuer>,
    api_key: String,
    refresh_margin: Duration,
    state: Mutex<Option<CachedToken>>,
    refreshes: AtomicUsize,
}

impl TokenCache {
    pub fn new(issuer: Arc<dyn CredentialIssuer>, api_key: impl Into<String>) -> Self {
        Self::with_margin(issuer, api_key, DEFAULT_REFRESH_MARGIN)
    }

    pub fn with_margin(
        issuer: Arc<dyn CredentialIssuer>,
        api_key: impl Into<String>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            issuer,
            api_key: api_key.into(),
            refresh_margin,
            state: Mutex::new(None),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Whether an API key is present at all.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Return a valid bearer token, refreshing it if needed.
    ///
    /// The state lock is held across the issuer call: callers arriving while a
    /// refresh is in flight wait for it and then reuse its result.
    pub async fn bearer(&self) -> Result<String, ProviderError> {
        if !self.has_api_key() {
            return Err(ProviderError::config("API key not set"));
        }

        let mut state = self.state.lock().await;
        if let Some(cached) = state.as_ref() {
            if cached.is_fresh(self.refresh_margin, Instant::now()) {
                return Ok(cached.token.clone());
            }
        }

        let issued = self.issuer.issue(&self.api_key).await?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(
            expires_in_secs = issued.expires_in.as_secs(),
            "Refreshed bearer token"
        );

        let token = issued.access_token.clone();
        *state = Some(CachedToken {
            token: issued.access_token,
            expires_at: Instant::now() + issued.expires_in,
        });
        Ok(token)
    }

    /// Drop the cached token if it is still the one the backend rejected.
    pub async fn invalidate(&self, rejected: &str) {
        let mut state = self.state.lock().await;
        if state.as_ref().map(|c| c.token == rejected).unwrap_or(false) {
            *state = None;
        }
    }

    /// Number of successful issuer round-trips so far.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("refresh_margin", &self.refresh_margin)
            .field("refreshes", &self.refresh_count())
            .finish_non_exhaustive()
    }
}
