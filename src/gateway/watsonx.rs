//! watsonx.ai adapter for text generation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::credentials::{IamTokenIssuer, TokenCache, DEFAULT_IAM_URL};
use super::error::{ErrorContext, ProviderError};
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for text-generation providers.
#[async_trait]
pub trait TextGenerationProvider: Send + Sync {
    async fn generate(&self, call: &GenerationCall) -> Result<GenerationOutput, ProviderError>;

    /// Model this provider generates with.
    fn model(&self) -> &ModelRef;

    /// Re-validate configuration before any call is attempted.
    fn ensure_configured(&self) -> Result<(), ProviderError>;
}

// =============================================================================
// CONFIG
// =============================================================================

pub const DEFAULT_BASE_URL: &str = "https://us-south.ml.cloud.ibm.com";
pub const DEFAULT_MODEL_ID: &str = "ibm/granite-3-8b-instruct";
pub const DEFAULT_API_VERSION: &str = "2024-05-01";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum stop sequences the backend accepts per call.
pub const MAX_STOP_SEQUENCES: usize = 6;

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters.
const MAX_INPUT_CHARS: usize = 200_000;

/// Host configuration for the watsonx backend.
#[derive(Debug, Clone)]
pub struct WatsonxConfig {
    pub api_key: String,
    pub project_id: String,
    pub base_url: String,
    pub model_id: String,
    /// Embedding model; `None` disables semantic similarity.
    pub embed_model_id: Option<String>,
    pub iam_url: String,
    pub api_version: String,
    /// HTTP timeout and per-call generation deadline.
    pub timeout: Duration,
}

impl WatsonxConfig {
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            base_url: DEFAULT_BASE_URL.into(),
            model_id: DEFAULT_MODEL_ID.into(),
            embed_model_id: None,
            iam_url: DEFAULT_IAM_URL.into(),
            api_version: DEFAULT_API_VERSION.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Load from environment variables, failing fast on anything required.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = required_env("WATSONX_API_KEY")?;
        let project_id = required_env("WATSONX_PROJECT_ID")?;

        let mut config = Self::new(api_key, project_id);
        if let Some(url) = optional_env("WATSONX_URL") {
            config.base_url = url;
        }
        if let Some(model) = optional_env("WATSONX_MODEL_ID") {
            config.model_id = model;
        }
        config.embed_model_id = optional_env("WATSONX_EMBED_MODEL_ID");
        if let Some(iam) = optional_env("WATSONX_IAM_URL") {
            config.iam_url = iam;
        }
        if let Some(version) = optional_env("WATSONX_API_VERSION") {
            config.api_version = version;
        }
        config.timeout = optional_env("WATSONX_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        config.validate()?;
        Ok(config)
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn iam_url(mut self, url: impl Into<String>) -> Self {
        self.iam_url = url.into();
        self
    }

    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn embed_model(mut self, model_id: impl Into<String>) -> Self {
        self.embed_model_id = Some(model_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check every required field is present.
    pub fn validate(&self) -> Result<(), ProviderError> {
        let required = [
            ("api key", &self.api_key),
            ("project id", &self.project_id),
            ("endpoint URL", &self.base_url),
            ("model id", &self.model_id),
            ("IAM URL", &self.iam_url),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ProviderError::config(format!("watsonx {name} not set")));
            }
        }
        if self.timeout.is_zero() {
            return Err(ProviderError::config("watsonx timeout must be > 0"));
        }
        Ok(())
    }

    /// Build the shared token cache for this account.
    pub fn token_cache(&self) -> Result<Arc<TokenCache>, ProviderError> {
        let issuer = IamTokenIssuer::new(&self.iam_url, self.timeout)?;
        Ok(Arc::new(TokenCache::new(Arc::new(issuer), &self.api_key)))
    }
}

fn required_env(name: &str) -> Result<String, ProviderError> {
    optional_env(name).ok_or_else(|| ProviderError::config(format!("{name} not set")))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// =============================================================================
// ADAPTER
// =============================================================================

/// watsonx.ai text-generation adapter.
#[derive(Debug, Clone)]
pub struct WatsonxAdapter {
    client: reqwest::Client,
    config: WatsonxConfig,
    model: ModelRef,
    tokens: Arc<TokenCache>,
}

impl WatsonxAdapter {
    /// Create from environment variables with a fresh token cache.
    pub fn from_env() -> Result<Self, ProviderError> {
        let config = WatsonxConfig::from_env()?;
        let tokens = config.token_cache()?;
        Self::with_config(config, tokens)
    }

    /// Create with explicit configuration and a (possibly shared) token cache.
    pub fn with_config(
        config: WatsonxConfig,
        tokens: Arc<TokenCache>,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        let model = ModelRef::new(&config.model_id, &config.project_id);
        Ok(Self {
            client,
            config,
            model,
            tokens,
        })
    }

    pub fn config(&self) -> &WatsonxConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn generation_url(&self) -> String {
        format!(
            "{}/ml/v1/text/generation?version={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version
        )
    }

    /// Extract request ID from response headers.
    pub(crate) fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        ["x-request-id", "x-global-transaction-id"]
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct GenerationApiRequest<'a> {
    input: &'a str,
    model_id: &'a str,
    project_id: &'a str,
    parameters: GenerationApiParameters<'a>,
}

#[derive(Serialize)]
struct GenerationApiParameters<'a> {
    decoding_method: &'static str,
    temperature: f64,
    top_p: f64,
    top_k: u32,
    max_new_tokens: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
    random_seed: u32,
    return_options: ReturnOptions,
}

#[derive(Serialize)]
struct ReturnOptions {
    generated_tokens: bool,
    token_logprobs: bool,
}

#[derive(Deserialize)]
struct GenerationApiResponse {
    results: Option<Vec<GenerationResult>>,
    errors: Option<Vec<ApiError>>,
}

#[derive(Deserialize)]
struct GenerationResult {
    generated_text: Option<String>,
    generated_token_count: Option<u32>,
    input_token_count: Option<u32>,
    stop_reason: Option<String>,
    #[serde(default)]
    generated_tokens: Option<Vec<GeneratedToken>>,
}

#[derive(Deserialize)]
struct GeneratedToken {
    #[serde(default)]
    text: Option<String>,
    logprob: Option<f64>,
}

#[derive(Deserialize)]
pub(crate) struct ApiError {
    pub(crate) code: Option<String>,
    pub(crate) message: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ApiErrorBody {
    pub(crate) errors: Option<Vec<ApiError>>,
}

/// Map a non-success HTTP response to a provider error.
pub(crate) fn classify_http_error(status: u16, body: &str, ctx: ErrorContext) -> ProviderError {
    let first = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.errors)
        .and_then(|e| e.into_iter().next());

    let (message, ctx) = match first {
        Some(err) => {
            let ctx = match err.code {
                Some(code) => ctx.with_code(code),
                None => ctx,
            };
            (err.message.unwrap_or_default(), ctx)
        }
        None => (format!("HTTP {status}"), ctx),
    };

    match status {
        429 => ProviderError::rate_limited(Duration::from_secs(10), ctx),
        401 | 403 => ProviderError::auth_with_context(message, ctx),
        400 | 404 | 422 => ProviderError::InvalidRequest {
            message,
            context: Some(ctx),
        },
        s => ProviderError::provider_with_context("watsonx", message, s >= 500, ctx),
    }
}

// =============================================================================
// PROVIDER IMPL
// =============================================================================

#[async_trait]
impl TextGenerationProvider for WatsonxAdapter {
    async fn generate(&self, call: &GenerationCall) -> Result<GenerationOutput, ProviderError> {
        if call.input.chars().count() > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large (max {MAX_INPUT_CHARS} chars)"
            )));
        }

        let token = self.tokens.bearer().await?;
        let start = Instant::now();

        let stop_len = call.params.stop.len().min(MAX_STOP_SEQUENCES);
        let api_req = GenerationApiRequest {
            input: &call.input,
            model_id: &self.config.model_id,
            project_id: &self.config.project_id,
            parameters: GenerationApiParameters {
                decoding_method: "sample",
                temperature: call.params.temperature,
                top_p: call.params.top_p,
                top_k: call.params.top_k,
                max_new_tokens: call.params.max_new_tokens,
                stop_sequences: &call.params.stop[..stop_len],
                random_seed: call.seed,
                return_options: ReturnOptions {
                    generated_tokens: true,
                    token_logprobs: true,
                },
            },
        };

        let mut response = self
            .client
            .post(self.generation_url())
            .bearer_auth(&token)
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    "watsonx",
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match &request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let err = classify_http_error(status.as_u16(), &body, ctx);
            if err.is_auth() {
                self.tokens.invalidate(&token).await;
            }
            return Err(err);
        }

        let parsed: GenerationApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("watsonx", format!("Invalid JSON: {e}"), false)
        })?;

        if let Some(err) = parsed.errors.and_then(|e| e.into_iter().next()) {
            return Err(ProviderError::provider(
                "watsonx",
                err.message.unwrap_or_default(),
                false,
            ));
        }

        let result = parsed
            .results
            .and_then(|r| r.into_iter().next())
            .ok_or_else(|| ProviderError::provider("watsonx", "No results in response", false))?;

        let token_logprobs = result.generated_tokens.map(|tokens| {
            tokens
                .into_iter()
                .filter_map(|t| {
                    t.logprob.map(|logprob| TokenLogprob {
                        token: t.text.unwrap_or_default(),
                        logprob,
                    })
                })
                .collect::<Vec<_>>()
        });

        Ok(GenerationOutput {
            text: result.generated_text.unwrap_or_default(),
            output_tokens: result.generated_token_count,
            input_tokens: result.input_token_count,
            token_logprobs,
            stop_reason: StopReason::from(result.stop_reason),
            latency: start.elapsed(),
            request_id,
        })
    }

    fn model(&self) -> &ModelRef {
        &self.model
    }

    fn ensure_configured(&self) -> Result<(), ProviderError> {
        self.config.validate()?;
        if !self.tokens.has_api_key() {
            return Err(ProviderError::config("watsonx api key not set"));
        }
        Ok(())
    }
}
