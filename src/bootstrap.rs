//! Startup wiring shared by the binaries

use crate::audit::RunTracer;
use crate::config::{ChatbotConfig, IndexBuildPolicy};
use crate::conversational::{ConversationOrchestrator, ConversationSettings};
use crate::llm::GroqClient;
use crate::memory::FileSessionStore;
use crate::retrieval::{
    embedder_from_config, HttpDocumentLoader, IndexBuilder, IndexHandle, RetrievalAugmenter,
};
use crate::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. `RUST_LOG` overrides the `info` default.
/// A no-op when a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}

/// `.env` first (it may set `RUST_LOG`), then logging, then configuration,
/// so warnings raised while resolving configuration reach the subscriber.
pub fn load_config() -> Result<ChatbotConfig> {
    dotenv::dotenv().ok();
    init_tracing();
    ChatbotConfig::from_env()
}

/// Index handle and augmenter for the configured seed URLs.
pub fn build_augmenter(config: &ChatbotConfig) -> Result<RetrievalAugmenter> {
    let retrieval = &config.retrieval;
    let embedder = embedder_from_config(&retrieval.embedding, config.completion.timeout)?;
    let loader = Arc::new(HttpDocumentLoader::new(config.completion.timeout)?);

    let builder = IndexBuilder::new(
        loader,
        Arc::clone(&embedder),
        retrieval.chunk_size,
        retrieval.chunk_overlap,
    );
    let handle = IndexHandle::new(
        retrieval.index_dir.clone(),
        retrieval.seed_urls.clone(),
        builder,
    );

    Ok(RetrievalAugmenter::new(Arc::new(handle), embedder))
}

/// Fully wired orchestrator over the file store and the Groq provider.
///
/// With eager index builds, a cold build that produces nothing aborts startup.
pub async fn build_orchestrator(config: &ChatbotConfig) -> Result<ConversationOrchestrator> {
    let store = Arc::new(FileSessionStore::open(config.history_dir.clone()).await?);
    let provider = Arc::new(GroqClient::new(&config.completion)?);
    let tracer = Arc::new(RunTracer::new(config.tracing.clone()));

    info!(
        history_dir = %store.dir().display(),
        model = %config.completion.model,
        tracing = tracer.exporting(),
        "Session store and provider ready"
    );

    let mut orchestrator =
        ConversationOrchestrator::new(store, provider, ConversationSettings::from(config))
            .with_tracer(tracer);

    if config.retrieval.enabled {
        let augmenter = Arc::new(build_augmenter(config)?);

        if config.retrieval.build_policy == IndexBuildPolicy::Eager {
            let index = augmenter.index().get().await?;
            info!(entries = index.len(), "Retrieval index ready");
        } else {
            info!("Retrieval index will be loaded on first query");
        }

        orchestrator = orchestrator.with_augmenter(augmenter);
    }

    Ok(orchestrator)
}
