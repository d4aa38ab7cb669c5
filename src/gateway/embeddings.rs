//! Optional embedding capability used for semantic similarity.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::credentials::TokenCache;
use super::error::{ErrorContext, ProviderError};
use super::types::{EmbedRequest, EmbedResponse};
use super::watsonx::{classify_http_error, WatsonxAdapter, WatsonxConfig};

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

/// watsonx.ai embeddings endpoint.
#[derive(Debug, Clone)]
pub struct WatsonxEmbedder {
    client: reqwest::Client,
    url: String,
    model_id: String,
    project_id: String,
    tokens: Arc<TokenCache>,
}

#[derive(Serialize)]
struct EmbedApiRequest<'a> {
    inputs: &'a [String],
    model_id: &'a str,
    project_id: &'a str,
}

#[derive(Deserialize)]
struct EmbedApiResponse {
    results: Option<Vec<EmbedResult>>,
    input_token_count: Option<u32>,
}

#[derive(Deserialize)]
struct EmbedResult {
    embedding: Vec<f32>,
}

impl WatsonxEmbedder {
    /// Build from config; returns `None` when no embedding model is configured.
    pub fn from_config(
        config: &WatsonxConfig,
        tokens: Arc<TokenCache>,
    ) -> Result<Option<Self>, ProviderError> {
        let Some(model_id) = config.embed_model_id.clone() else {
            return Ok(None);
        };
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Some(Self {
            client,
            url: format!(
                "{}/ml/v1/text/embeddings?version={}",
                config.base_url.trim_end_matches('/'),
                config.api_version
            ),
            model_id,
            project_id: config.project_id.clone(),
            tokens,
        }))
    }

    /// Reuse an adapter's HTTP client and token cache.
    pub fn from_adapter(adapter: &WatsonxAdapter) -> Result<Option<Self>, ProviderError> {
        let mut embedder = Self::from_config(adapter.config(), adapter.tokens().clone())?;
        if let Some(e) = embedder.as_mut() {
            e.client = adapter.client().clone();
        }
        Ok(embedder)
    }
}

#[async_trait]
impl EmbeddingProvider for WatsonxEmbedder {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if req.texts.is_empty() {
            return Ok(EmbedResponse {
                embeddings: Vec::new(),
                tokens: 0,
                latency: Duration::from_millis(0),
            });
        }

        let token = self.tokens.bearer().await?;
        let start = Instant::now();

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&token)
            .json(&EmbedApiRequest {
                inputs: &req.texts,
                model_id: &self.model_id,
                project_id: &self.project_id,
            })
            .send()
            .await?;

        let status = response.status();
        let request_id = WatsonxAdapter::extract_request_id(response.headers());
        let body = response.text().await?;

        if !status.is_success() {
            let ctx = ErrorContext::new().with_status(status.as_u16());
            let ctx = match request_id {
                Some(id) => ctx.with_request_id(id),
                None => ctx,
            };
            let err = classify_http_error(status.as_u16(), &body, ctx);
            if err.is_auth() {
                self.tokens.invalidate(&token).await;
            }
            return Err(err);
        }

        let parsed: EmbedApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("watsonx", format!("Invalid JSON: {e}"), false)
        })?;
        let embeddings: Vec<Vec<f32>> = parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.embedding)
            .collect();

        if embeddings.len() != req.texts.len() {
            return Err(ProviderError::provider(
                "watsonx",
                format!(
                    "Expected {} embeddings, got {}",
                    req.texts.len(),
                    embeddings.len()
                ),
                false,
            ));
        }

        Ok(EmbedResponse {
            embeddings,
            tokens: parsed.input_token_count.unwrap_or(0),
            latency: start.elapsed(),
        })
    }
}
