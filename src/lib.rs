#![forbid(unsafe_code)]

//! # replyflow
//!
//! Ranked reply suggestions for a conversation.
//!
//! Given a prompt and recent conversation lines, replyflow issues several
//! generation calls with deliberately varied decoding settings, cleans the
//! raw outputs, scores each one for how well it follows the conversation,
//! and returns a short, diverse shortlist with a probability per candidate.
//!
//! The pipeline lives in [`engine`]; the text-generation backend, credential
//! cache and optional embeddings live in [`gateway`].

pub mod engine;
pub mod gateway;
pub mod tokens;

pub use engine::plan::{DecodingPlan, EntropySource, FixedSeed, RandomSource};
pub use engine::similarity::Similarity;
pub use engine::trace::{CallTrace, JsonlTraceSink, TraceError, TraceSink, TraceWorker};
pub use engine::{
    rank_generations, Candidate, CandidateEngine, EngineError, FlowSignals, FlowWeights,
    GenerationRequest, GenerationResponse, RankRequest,
};
pub use gateway::{
    Attribution, GenerationGateway, ProviderError, ProviderGateway, TokenCache, UsageSink,
    WatsonxConfig,
};
