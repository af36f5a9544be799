use session_chatbot::bootstrap::{build_orchestrator, load_config};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;

    // Resume a session by passing its id; otherwise start a fresh one
    let session_id = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let orchestrator = build_orchestrator(&config).await?;
    info!(session_id = %session_id, "Chat session started");

    let history = orchestrator.transcript(&session_id).await;
    println!("Session: {} ({} earlier messages)", session_id, history.len());
    if !history.is_empty() {
        print!("{}", history.get_formatted_context());
    }
    println!("Say 'bye' to end the conversation.\n");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(b"You: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        match orchestrator.handle_turn(&session_id, message).await {
            Ok(reply) => {
                println!("Bot: {}", reply.response);
                if let Some(urls) = reply.source_urls.filter(|urls| !urls.is_empty()) {
                    println!("     sources: {}", urls.join(", "));
                }
                if !reply.persisted {
                    eprintln!("(warning: this exchange could not be saved)");
                }
            }
            Err(e) => eprintln!("Error: {}", e),
        }

        if message.to_lowercase().contains("bye") {
            break;
        }
    }

    info!(session_id = %session_id, "Chat session ended");
    Ok(())
}
