//! Minimal end-to-end example for `replyflow`.
//!
//! Generates reply suggestions for a short conversation and prints the
//! ranked shortlist with each candidate's probability and flow signals.
//!
//! To run:
//! - Set `WATSONX_API_KEY` and `WATSONX_PROJECT_ID`
//! - Optionally set `WATSONX_EMBED_MODEL_ID` for embedding similarity
//! - `cargo run --example quickstart`

use std::sync::Arc;

use replyflow::gateway::{TracingUsageSink, WatsonxEmbedder};
use replyflow::{CandidateEngine, GenerationRequest, ProviderGateway, Similarity};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    // -- Infrastructure setup ------------------------------------------------

    // Reads WATSONX_* from the environment and fails fast if anything
    // required is missing. Usage records are logged as tracing events.
    let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink))?;

    // Embedding similarity shares the gateway's HTTP client and token cache.
    let similarity = match WatsonxEmbedder::from_adapter(gateway.adapter())? {
        Some(embedder) => Similarity::Semantic(Arc::new(embedder)),
        None => Similarity::Lexical,
    };

    let engine = CandidateEngine::new(Arc::new(gateway)).with_similarity(similarity);

    // -- The actual request --------------------------------------------------

    let req = GenerationRequest::new("Any plans for the weekend?")
        .persona("You are a friendly, upbeat friend. Keep replies short.")
        .context(vec![
            "User: Finally Friday!".to_string(),
            "Assistant: Right? This week dragged on.".to_string(),
        ])
        .call_count(6)
        .shortlist(3, 6, 4)
        .seed(42); // drop this for a different plan every run

    let resp = engine.generate(&req).await?;

    // -- Results ---------------------------------------------------------------

    println!(
        "{} candidates from {} ({} dropped)\n",
        resp.meta.used_k, resp.meta.model_id, resp.meta.dropped
    );
    for (rank, c) in resp.candidates.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}  (utility {:.3}, sim {:.2}, {})",
            rank + 1,
            c.probability,
            c.text,
            c.flow.utility,
            c.flow.sim_to_last_user,
            c.variant_tag.as_str()
        );
    }
    Ok(())
}
