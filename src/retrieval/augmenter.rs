//! Retrieval augmentation
//!
//! Turns a user query into an outgoing prompt that carries the most similar
//! snippets from the index. Any retrieval problem degrades to the bare query.

use crate::retrieval::embedder::Embedder;
use crate::retrieval::index::{IndexHandle, Snippet};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_PERSONA: &str = "You are a friendly, concise assistant for this website. \
Use the context passages below when they are relevant to the question and mention which source you relied on. \
If the context does not contain the answer, say so briefly and answer from general knowledge.";

/// Prompt plus the snippets folded into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Augmentation {
    pub prompt: String,
    pub snippets: Vec<Snippet>,
}

impl Augmentation {
    /// The unaugmented query
    pub fn passthrough(query: &str) -> Self {
        Self {
            prompt: query.to_string(),
            snippets: Vec::new(),
        }
    }
}

pub struct RetrievalAugmenter {
    index: Arc<IndexHandle>,
    embedder: Arc<dyn Embedder>,
}

impl RetrievalAugmenter {
    pub fn new(index: Arc<IndexHandle>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            index,
            embedder,
        }
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    pub async fn augment(&self, query: &str, k: usize) -> Augmentation {
        let index = match self.index.get().await {
            Ok(index) => index,
            Err(error) => {
                warn!("Retrieval index unavailable, answering without context: {}", error);
                return Augmentation::passthrough(query);
            }
        };

        if index.is_empty() || k == 0 {
            return Augmentation::passthrough(query);
        }

        let query_vector = match self.embedder.embed_one(query).await {
            Ok(vector) => vector,
            Err(error) => {
                warn!("Query embedding failed, answering without context: {}", error);
                return Augmentation::passthrough(query);
            }
        };

        if query_vector.len() != index.dimensions {
            warn!(
                query = query_vector.len(),
                index = index.dimensions,
                "Query embedding does not match the index, answering without context"
            );
            return Augmentation::passthrough(query);
        }

        let hits = index.search(&query_vector, k);
        debug!(
            hits = hits.len(),
            top_score = hits.first().map(|h| h.score).unwrap_or_default(),
            "Retrieved context snippets"
        );

        let snippets: Vec<Snippet> = hits.into_iter().map(|hit| hit.snippet).collect();
        Augmentation {
            prompt: compose_prompt(DEFAULT_PERSONA, &snippets, query),
            snippets,
        }
    }
}

/// Persona, tagged context passages, then the user's question.
pub fn compose_prompt(persona: &str, snippets: &[Snippet], query: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(persona);
    prompt.push_str("\n\nContext:\n");

    for (i, snippet) in snippets.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] (source: {})\n{}\n\n",
            i + 1,
            snippet.source_url,
            snippet.text
        ));
    }

    prompt.push_str("Question: ");
    prompt.push_str(query);
    prompt
}
