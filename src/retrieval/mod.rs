//! Retrieval-augmented prompting
//!
//! Seed URLs are fetched, chunked and embedded into a persisted index once;
//! queries pull the top-K most similar snippets into the outgoing prompt.

pub mod augmenter;
pub mod chunker;
pub mod embedder;
pub mod index;
pub mod loader;

pub use augmenter::{Augmentation, RetrievalAugmenter};
pub use embedder::{embedder_from_config, Embedder, HashingEmbedder, OpenAiEmbedder};
pub use index::{IndexBuilder, IndexHandle, RetrievalIndex, Snippet};
pub use loader::{DocumentLoader, HttpDocumentLoader};
