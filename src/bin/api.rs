use session_chatbot::{
    api::start_server,
    bootstrap::{build_orchestrator, load_config},
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    info!("🚀 Session Chatbot - API Server");
    info!("📍 Port: {}", config.port);
    info!("📚 Retrieval: {}", if config.retrieval.enabled { "on" } else { "off" });

    let orchestrator = Arc::new(build_orchestrator(&config).await?);

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    start_server(orchestrator, config.port).await?;

    Ok(())
}
