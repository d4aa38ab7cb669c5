#![forbid(unsafe_code)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use replyflow::engine::plan::{build_plan, EntropySource};
use replyflow::engine::{rank_generations, CandidateEngine, FlowWeights, GenerationRequest, RankRequest};
use replyflow::gateway::{
    NoopUsageSink, ProviderGateway, TracingUsageSink, UsageSink, WatsonxEmbedder,
};
use replyflow::{JsonlTraceSink, Similarity, TraceSink};

#[derive(Parser)]
#[command(name = "replyflow", version, about = "Ranked reply suggestions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and rank candidates for a request (reads WATSONX_* env vars)
    Generate {
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Overrides the request's samplingSeed
        #[arg(long)]
        seed: Option<u64>,
        /// Write one JSONL record per generation call
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Log a usage record per backend call
        #[arg(long)]
        usage: bool,
    },
    /// Rank pre-generated texts without calling a backend
    Rank {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the decoding plan for a request as JSON
    Plan {
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("replyflow=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            request,
            out,
            seed,
            trace,
            usage,
        } => {
            let mut req: GenerationRequest = read_json(&request)?;
            if seed.is_some() {
                req.sampling_seed = seed;
            }

            let mut engine = if usage {
                build_engine(Arc::new(TracingUsageSink))?
            } else {
                build_engine(Arc::new(NoopUsageSink))?
            };

            let worker = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    let sink: Arc<dyn TraceSink> = Arc::new(sink);
                    engine = engine.with_trace(sink);
                    Some(worker)
                }
                None => None,
            };

            let result = engine.generate(&req).await;
            drop(engine);
            if let Some(worker) = worker {
                worker.join()?;
            }
            let response = result?;
            write_json(&out, &response)?;
            eprintln!(
                "wrote {} candidates ({} dropped) to {}",
                response.meta.used_k,
                response.meta.dropped,
                out.display()
            );
        }
        Commands::Rank { input, out } => {
            let req: RankRequest = read_json(&input)?;
            let response =
                rank_generations(&req, &Similarity::Lexical, FlowWeights::default()).await;
            write_json(&out, &response)?;
        }
        Commands::Plan { request, seed } => {
            let mut req: GenerationRequest = read_json(&request)?;
            if seed.is_some() {
                req.sampling_seed = seed;
            }
            let plan = build_plan(&req, &EntropySource);
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }

    Ok(())
}

fn build_engine<U: UsageSink + 'static>(
    usage_sink: Arc<U>,
) -> Result<CandidateEngine, Box<dyn std::error::Error>> {
    let gateway = ProviderGateway::from_env(usage_sink)?;
    let similarity = match WatsonxEmbedder::from_adapter(gateway.adapter())? {
        Some(embedder) => Similarity::Semantic(Arc::new(embedder)),
        None => Similarity::Lexical,
    };
    Ok(CandidateEngine::new(Arc::new(gateway)).with_similarity(similarity))
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &PathBuf,
) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
