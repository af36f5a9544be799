//! Web page loading for the retrieval index

use crate::error::ChatbotError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Fetches the readable text of a source URL
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<String>;
}

/// Loads pages over HTTP and strips the markup
pub struct HttpDocumentLoader {
    client: Client,
}

impl HttpDocumentLoader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(4)
            .timeout(timeout)
            .user_agent(concat!("session-chatbot/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentLoader for HttpDocumentLoader {
    async fn load(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatbotError::IndexBuild(format!("{} returned {}", url, status)));
        }

        let html = response.text().await?;
        let text = extract_text_from_html(&html);
        debug!(url, chars = text.len(), "Loaded page text");

        Ok(text)
    }
}

const CONTENT_SELECTOR: &str = "h1, h2, h3, h4, h5, h6, p, li, pre, td, th, blockquote";

/// Pull readable text out of an HTML document.
///
/// Prefers content elements; falls back to every text node outside
/// `script`/`style`/`noscript` when none are present.
pub fn extract_text_from_html(html: &str) -> String {
    let document = scraper::Html::parse_document(html);

    let content = match scraper::Selector::parse(CONTENT_SELECTOR) {
        Ok(selector) => document
            .select(&selector)
            .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Err(_) => String::new(),
    };

    if !content.is_empty() {
        return content;
    }

    let text: Vec<&str> = document
        .root_element()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let inside_code = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| matches!(el.name(), "script" | "style" | "noscript"))
            });
            (!inside_code).then_some(&**text)
        })
        .collect();

    collapse_whitespace(&text.join(" "))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
