//! Retrieval index: build, persist, load, search
//!
//! The index is built once from the seed URLs, written as a single JSON file,
//! and shared read-only behind an `Arc` while serving. A readable file built
//! with the current embedding model is reused; anything else triggers a rebuild.

use crate::error::ChatbotError;
use crate::memory::session_store::write_atomic;
use crate::retrieval::chunker::split_into_chunks;
use crate::retrieval::embedder::{cosine_similarity, Embedder};
use crate::retrieval::loader::DocumentLoader;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;
/// Chunks per embedding request during a build
const EMBED_BATCH: usize = 32;

/// A chunk of source text plus where it came from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snippet {
    pub text: String,
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub embedding: Vec<f32>,
    pub snippet: Snippet,
}

#[derive(Debug, Clone)]
pub struct ScoredSnippet {
    pub snippet: Snippet,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalIndex {
    pub version: u32,
    pub embedding_model: String,
    pub dimensions: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub source_urls: Vec<String>,
    pub built_at: DateTime<Utc>,
    entries: Vec<IndexEntry>,
}

impl RetrievalIndex {
    pub fn empty(embedding_model: impl Into<String>) -> Self {
        Self {
            version: INDEX_VERSION,
            embedding_model: embedding_model.into(),
            dimensions: 0,
            chunk_size: 0,
            chunk_overlap: 0,
            source_urls: Vec::new(),
            built_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Append an entry; all embeddings must share one dimension.
    pub fn push(&mut self, embedding: Vec<f32>, snippet: Snippet) -> Result<()> {
        if self.entries.is_empty() {
            self.dimensions = embedding.len();
        } else if embedding.len() != self.dimensions {
            return Err(ChatbotError::IndexBuild(format!(
                "embedding has {} dimensions, index has {}",
                embedding.len(),
                self.dimensions
            )));
        }
        self.entries.push(IndexEntry { embedding, snippet });
        Ok(())
    }

    /// Top-`k` entries by descending cosine similarity. Ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredSnippet> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, cosine_similarity(query, &entry.embedding)))
            .collect();

        // Stable sort: equal scores stay in insertion order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredSnippet {
                snippet: self.entries[i].snippet.clone(),
                score,
            })
            .collect()
    }

    pub fn file_path(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE)
    }

    /// `Ok(None)` when no index has been persisted yet.
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::file_path(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ChatbotError::StorageRead(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let index: RetrievalIndex = serde_json::from_slice(&bytes).map_err(|e| {
            ChatbotError::StorageRead(format!("cannot parse {}: {}", path.display(), e))
        })?;
        index.validate()?;

        Ok(Some(index))
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self)?;
        write_atomic(&Self::file_path(dir), &bytes)
            .await
            .map_err(|e| ChatbotError::StorageWrite(format!("retrieval index: {}", e)))
    }

    fn validate(&self) -> Result<()> {
        if self.version != INDEX_VERSION {
            return Err(ChatbotError::StorageRead(format!(
                "unsupported index version {}",
                self.version
            )));
        }
        let bad_entry = self.entries.iter().position(|e| {
            e.embedding.len() != self.dimensions
                || e.embedding.iter().any(|x| !x.is_finite())
                || e.snippet.text.is_empty()
        });
        if let Some(position) = bad_entry {
            return Err(ChatbotError::StorageRead(format!(
                "index entry {} is malformed",
                position
            )));
        }
        Ok(())
    }
}

/// Builds an index from seed URLs
pub struct IndexBuilder {
    loader: Arc<dyn DocumentLoader>,
    embedder: Arc<dyn Embedder>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl IndexBuilder {
    pub fn new(
        loader: Arc<dyn DocumentLoader>,
        embedder: Arc<dyn Embedder>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            loader,
            embedder,
            chunk_size,
            chunk_overlap,
        }
    }

    /// Fetch, chunk and embed every URL. A failing URL is logged and skipped.
    pub async fn build(&self, urls: &[String]) -> Result<RetrievalIndex> {
        let mut index = RetrievalIndex::empty(self.embedder.model_id());
        index.chunk_size = self.chunk_size;
        index.chunk_overlap = self.chunk_overlap;

        for url in urls {
            let text = match self.loader.load(url).await {
                Ok(text) => text,
                Err(error) => {
                    warn!(url = %url, "Skipping source that failed to load: {}", error);
                    continue;
                }
            };

            let chunks = split_into_chunks(&text, self.chunk_size, self.chunk_overlap);
            if chunks.is_empty() {
                warn!(url = %url, "Source produced no text; skipping");
                continue;
            }

            let mut embedded = 0;
            for batch in chunks.chunks(EMBED_BATCH) {
                let vectors = match self.embedder.embed(batch).await {
                    Ok(vectors) => vectors,
                    Err(error) => {
                        warn!(url = %url, "Embedding failed, dropping rest of source: {}", error);
                        break;
                    }
                };
                for (vector, chunk) in vectors.into_iter().zip(batch) {
                    index.push(
                        vector,
                        Snippet {
                            text: chunk.clone(),
                            source_url: url.clone(),
                        },
                    )?;
                    embedded += 1;
                }
            }

            if embedded > 0 {
                index.source_urls.push(url.clone());
            }
            info!(url = %url, chunks = embedded, "Indexed source");
        }

        index.built_at = Utc::now();
        info!(
            entries = index.len(),
            sources = index.source_urls.len(),
            "Retrieval index built"
        );
        Ok(index)
    }
}

/// How long a failed load-or-build is remembered before queries try again
const BUILD_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Slot {
    index: Option<Arc<RetrievalIndex>>,
    failed_at: Option<Instant>,
}

/// Shared, lazily-populated handle to the persisted index
pub struct IndexHandle {
    dir: PathBuf,
    seed_urls: Vec<String>,
    builder: IndexBuilder,
    current: RwLock<Slot>,
    rebuilding: Mutex<()>,
}

impl IndexHandle {
    pub fn new(dir: impl Into<PathBuf>, seed_urls: Vec<String>, builder: IndexBuilder) -> Self {
        Self {
            dir: dir.into(),
            seed_urls,
            builder,
            current: RwLock::new(Slot::default()),
            rebuilding: Mutex::new(()),
        }
    }

    /// Handle over an index that is already in memory (nothing is persisted).
    pub fn preloaded(dir: impl Into<PathBuf>, builder: IndexBuilder, index: RetrievalIndex) -> Self {
        Self {
            dir: dir.into(),
            seed_urls: index.source_urls.clone(),
            builder,
            current: RwLock::new(Slot {
                index: Some(Arc::new(index)),
                failed_at: None,
            }),
            rebuilding: Mutex::new(()),
        }
    }

    /// Current index, loading or building it on first use.
    ///
    /// A failed load-or-build is remembered for `BUILD_RETRY_AFTER`; until
    /// then callers get an error straight away instead of refetching.
    pub async fn get(&self) -> Result<Arc<RetrievalIndex>> {
        {
            let slot = self.current.read().await;
            if let Some(index) = slot.index.as_ref() {
                return Ok(Arc::clone(index));
            }
            if let Some(failed_at) = recent_failure(&slot) {
                return Err(backing_off(failed_at));
            }
        }

        let mut slot = self.current.write().await;
        if let Some(index) = slot.index.as_ref() {
            return Ok(Arc::clone(index));
        }
        if let Some(failed_at) = recent_failure(&slot) {
            return Err(backing_off(failed_at));
        }

        match self.load_or_build().await {
            Ok(index) => {
                let index = Arc::new(index);
                slot.index = Some(Arc::clone(&index));
                slot.failed_at = None;
                Ok(index)
            }
            Err(error) => {
                slot.failed_at = Some(Instant::now());
                Err(error)
            }
        }
    }

    /// Rebuild from the seed URLs and swap the result in.
    ///
    /// The build runs without blocking queries. If it fails, the index being
    /// served and the persisted file are both left untouched.
    pub async fn rebuild(&self) -> Result<Arc<RetrievalIndex>> {
        let _rebuilding = self.rebuilding.lock().await;

        let index = Arc::new(self.build_and_persist().await?);

        let mut slot = self.current.write().await;
        slot.index = Some(Arc::clone(&index));
        slot.failed_at = None;
        info!(entries = index.len(), "Swapped in rebuilt retrieval index");
        Ok(index)
    }

    async fn load_or_build(&self) -> Result<RetrievalIndex> {
        let model = self.builder.embedder.model_id();

        match RetrievalIndex::load(&self.dir).await {
            Ok(Some(index)) if index.embedding_model == model => {
                info!(entries = index.len(), "Loaded persisted retrieval index");
                return Ok(index);
            }
            Ok(Some(index)) => warn!(
                persisted = %index.embedding_model,
                current = %model,
                "Persisted retrieval index uses another embedding model, rebuilding"
            ),
            Ok(None) => info!("No persisted retrieval index; building"),
            Err(error) => warn!("Persisted retrieval index unreadable, rebuilding: {}", error),
        }

        self.build_and_persist().await
    }

    async fn build_and_persist(&self) -> Result<RetrievalIndex> {
        let index = self.builder.build(&self.seed_urls).await?;

        if index.is_empty() {
            return Err(ChatbotError::IndexBuild(format!(
                "no content indexed from {} seed URL(s)",
                self.seed_urls.len()
            )));
        }

        if let Err(error) = index.save(&self.dir).await {
            warn!("Retrieval index built but not persisted: {}", error);
        }

        Ok(index)
    }
}

fn recent_failure(slot: &Slot) -> Option<Instant> {
    slot.failed_at
        .filter(|failed_at| failed_at.elapsed() < BUILD_RETRY_AFTER)
}

fn backing_off(failed_at: Instant) -> ChatbotError {
    ChatbotError::IndexBuild(format!(
        "last build failed {}s ago; retrying after {}s",
        failed_at.elapsed().as_secs(),
        BUILD_RETRY_AFTER.as_secs()
    ))
}
