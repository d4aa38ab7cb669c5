//! Provider gateway for text generation, credentials and embeddings.

pub mod credentials;
pub mod embeddings;
pub mod error;
pub mod types;
pub mod usage;
pub mod watsonx;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};
use watsonx::{TextGenerationProvider, WatsonxAdapter};

pub use credentials::{CredentialIssuer, IamTokenIssuer, IssuedToken, TokenCache};
pub use embeddings::{EmbeddingProvider, WatsonxEmbedder};
pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};
pub use watsonx::WatsonxConfig;

/// What the engine needs from a generation backend.
#[async_trait::async_trait]
pub trait GenerationGateway: Send + Sync {
    async fn generate(&self, call: GenerationCall) -> Result<GenerationOutput, ProviderError>;

    /// Identifier of the model producing candidates.
    fn model_id(&self) -> &str;

    /// Fail fast if required configuration is missing. Called once per
    /// request before any call is dispatched.
    fn ensure_configured(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deadline for a single generation call, credential lookup included.
    pub call_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout: watsonx::DEFAULT_TIMEOUT,
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    watsonx: WatsonxAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> GenerationGateway for ProviderGateway<U> {
    async fn generate(&self, call: GenerationCall) -> Result<GenerationOutput, ProviderError> {
        ProviderGateway::generate(self, call).await
    }

    fn model_id(&self) -> &str {
        self.watsonx.model().model_id()
    }

    fn ensure_configured(&self) -> Result<(), ProviderError> {
        self.watsonx.ensure_configured()
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let watsonx = WatsonxAdapter::from_env()?;
        let config = GatewayConfig {
            call_timeout: watsonx.config().timeout,
        };
        Ok(Self {
            watsonx,
            usage_sink,
            config,
        })
    }

    pub fn with_config(watsonx: WatsonxAdapter, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            watsonx,
            usage_sink,
            config,
        }
    }

    pub fn adapter(&self) -> &WatsonxAdapter {
        &self.watsonx
    }

    /// Run one generation call under the configured deadline.
    ///
    /// Failed calls are not retried here: the engine treats each call as a
    /// single attempt and accounts for failures itself.
    pub async fn generate(&self, call: GenerationCall) -> Result<GenerationOutput, ProviderError> {
        let start = Instant::now();
        let result = match timeout(self.config.call_timeout, self.watsonx.generate(&call)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(self.config.call_timeout)),
        };

        match &result {
            Ok(out) => {
                self.record_usage(&call, Some(out), CallStatus::Success, None, start)
                    .await
            }
            Err(err) => {
                self.record_usage(
                    &call,
                    None,
                    CallStatus::Error,
                    Some(err.code().to_string()),
                    start,
                )
                .await
            }
        }

        result
    }

    async fn record_usage(
        &self,
        call: &GenerationCall,
        out: Option<&GenerationOutput>,
        status: CallStatus,
        error_code: Option<String>,
        start: Instant,
    ) {
        let model = self.watsonx.model();
        let record = ProviderCallRecord::new(
            model.provider(),
            "text/generation",
            model.model_id(),
            call.attribution.caller,
        )
        .tokens(
            out.and_then(|o| o.input_tokens).unwrap_or(0),
            out.and_then(|o| o.output_tokens).unwrap_or(0),
        )
        .run(call.attribution.run_id)
        .call_index(call.attribution.call_index)
        .request_id(out.and_then(|o| o.request_id.clone()))
        .latency(start.elapsed().as_millis() as u64);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}
