//! Grounded API server
//!
//! Run with: grounded-server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grounded::chat::ChatOrchestrator;
use grounded::config::Settings;
use grounded::embedding::{Embedder, HttpEmbedder};
use grounded::http::{build_router, AppState, RateLimiter};
use grounded::ingest::extract::AudioExtractor;
use grounded::ingest::{ExtractorRegistry, IngestPipeline, WebFetcher};
use grounded::jobs::JobStore;
use grounded::llm::LlmRouter;
use grounded::retrieval::{CrossEncoder, Retriever};
use grounded::store::Storage;
use grounded::vector::{SqliteVectorStore, VectorStore};

#[derive(Parser, Debug)]
#[command(name = "grounded-server")]
#[command(about = "Retrieval-augmented question answering service")]
#[command(version = grounded::VERSION)]
struct Args {
    /// Bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Data directory (databases + upload staging)
    #[arg(long, env = "GROUNDED_DATA_DIR")]
    data_dir: Option<String>,

    /// Log filter (e.g. "info,grounded=debug")
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut settings = Settings::from_env();
    settings.bind_addr = args.bind.clone();
    if let Some(data_dir) = &args.data_dir {
        let expanded = shellexpand::tilde(data_dir).into_owned();
        settings.data_dir = expanded.into();
        settings.upload_dir = settings.data_dir.join("uploads");
    }

    info!("Starting Grounded v{}...", grounded::VERSION);

    // Auth safety: refuse to start unprotected
    if settings.auth_enabled && settings.auth_token.is_empty() {
        bail!(
            "Refusing to start: AUTH_ENABLED=true but AUTH_TOKEN is not set. \
             Set AUTH_TOKEN or disable auth with AUTH_ENABLED=false."
        );
    }
    info!(
        "Authentication: {}",
        if settings.auth_enabled { "enabled" } else { "disabled" }
    );

    std::fs::create_dir_all(&settings.data_dir).context("creating data directory")?;
    std::fs::create_dir_all(&settings.upload_dir).context("creating upload directory")?;

    let storage = Storage::open(&settings.db_path()).context("opening metadata database")?;
    info!("Metadata database ready at {}", settings.db_path().display());

    let vectors: Arc<dyn VectorStore> = Arc::new(
        SqliteVectorStore::open(&settings.vector_db_path()).context("opening vector store")?,
    );
    info!("Vector store ready at {}", settings.vector_db_path().display());

    let embedder: Arc<dyn Embedder> =
        Arc::new(HttpEmbedder::new(&settings).context("building embedding client")?);
    if embedder.probe().await {
        info!(
            "Embeddings ready ({}, {} dims)",
            embedder.model_name(),
            embedder.dimensions()
        );
    } else {
        warn!(
            "Embedding model '{}' not reachable - ingestion and retrieval will fail until it is",
            embedder.model_name()
        );
    }

    let llm = Arc::new(
        LlmRouter::from_settings(&settings, Some(storage.clone()))
            .context("building provider router")?,
    );
    if !llm.has_providers() {
        warn!("No LLM provider credentials set - chat and query endpoints will return 503");
    }
    llm.probe_all().await;
    info!("Active LLM provider: {}", llm.active_provider_label());

    let mut registry = ExtractorRegistry::new();
    if settings.groq_api_key.is_some() {
        registry.register(Arc::new(AudioExtractor::new(llm.clone())));
        info!("Audio transcription enabled");
    }

    let pipeline = Arc::new(IngestPipeline::new(
        vectors.clone(),
        embedder.clone(),
        registry,
        settings.chunk_size,
        settings.chunk_overlap,
    ));

    let cross_encoder = match &settings.rerank_base_url {
        Some(base_url) => {
            info!("Cross-encoder reranking enabled ({})", settings.rerank_model);
            Some(CrossEncoder::new(base_url, &settings.rerank_model)?)
        }
        None => None,
    };

    let retriever = Arc::new(Retriever::new(
        vectors.clone(),
        embedder.clone(),
        llm.clone(),
        cross_encoder,
        settings.top_k,
        settings.max_context_chunks,
        settings.similarity_threshold,
    ));

    let orchestrator = ChatOrchestrator::new(
        storage.clone(),
        retriever.clone(),
        llm.clone(),
        settings.top_k,
        settings.summarize_after_messages,
    );

    let state = Arc::new(AppState {
        storage,
        vectors,
        embedder,
        llm,
        retriever,
        orchestrator,
        pipeline,
        fetcher: WebFetcher::new()?,
        jobs: Arc::new(JobStore::new()),
        rate_limiter: RateLimiter::new(),
        settings: settings.clone(),
    });

    let app = build_router(state);
    let addr: SocketAddr = settings.bind_addr.parse().context("parsing bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
