use session_chatbot::{
    bootstrap::{build_augmenter, load_config},
    ChatbotError,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    if config.retrieval.seed_urls.is_empty() {
        return Err(Box::new(ChatbotError::Config(
            "SEED_URLS is empty; nothing to index".into(),
        )) as Box<dyn std::error::Error>);
    }

    info!(
        urls = config.retrieval.seed_urls.len(),
        index_dir = %config.retrieval.index_dir.display(),
        "Rebuilding retrieval index"
    );

    let augmenter = build_augmenter(&config)?;
    let index = augmenter.index().rebuild().await?;

    println!(
        "Indexed {} snippet(s) from {} source(s) into {}",
        index.len(),
        index.source_urls.len(),
        config.retrieval.index_dir.display()
    );

    Ok(())
}
