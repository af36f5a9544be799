//! Conversation orchestration
//!
//! One turn: validate → lock session → load transcript → append user message
//! → (augment) → trim → complete → append reply → persist → respond.
//! The session lock is held from load to save so concurrent turns on one
//! session apply one after the other.

use crate::audit::{compute_prompt_hash, RunOutcome, RunRecord, RunTracer};
use crate::config::ChatbotConfig;
use crate::error::ChatbotError;
use crate::llm::{ChatTurn, CompletionProvider};
use crate::memory::store::estimate_tokens;
use crate::memory::{Message, MessageRole, SessionLocks, SessionStore, Transcript, TranscriptTrimmer};
use crate::retrieval::{Augmentation, RetrievalAugmenter};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shown to the user whenever the completion provider fails.
pub const FALLBACK_REPLY: &str = "Sorry, I encountered an error. Please try again later.";

pub const MISSING_FIELDS: &str = "Session ID and message are required";

/// Result of one conversation turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnReply {
    pub response: String,
    /// Retrieved snippet texts (retrieval mode only)
    pub sources: Option<Vec<String>>,
    /// Distinct source URLs of `sources`, in rank order
    pub source_urls: Option<Vec<String>>,
    /// The provider failed and `response` is the fallback text
    pub degraded: bool,
    /// The updated transcript reached durable storage
    pub persisted: bool,
}

/// Per-turn tunables resolved from configuration
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub system_prompt: String,
    pub token_budget: usize,
    pub max_tokens: u32,
    pub top_k: usize,
    pub provider_timeout: Duration,
}

impl From<&ChatbotConfig> for ConversationSettings {
    fn from(config: &ChatbotConfig) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            token_budget: config.token_budget,
            max_tokens: config.completion.max_tokens,
            top_k: config.retrieval.top_k,
            provider_timeout: config.completion.timeout,
        }
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            system_prompt: crate::config::DEFAULT_SYSTEM_PROMPT.to_string(),
            token_budget: 5000,
            max_tokens: 1024,
            top_k: 4,
            provider_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ConversationOrchestrator {
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    trimmer: TranscriptTrimmer,
    provider: Arc<dyn CompletionProvider>,
    augmenter: Option<Arc<RetrievalAugmenter>>,
    tracer: Arc<RunTracer>,
    settings: ConversationSettings,
}

impl ConversationOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn CompletionProvider>,
        settings: ConversationSettings,
    ) -> Self {
        Self {
            store,
            locks: SessionLocks::new(),
            // The preamble is sent on every turn, so it comes out of the budget.
            trimmer: TranscriptTrimmer::new(
                settings
                    .token_budget
                    .saturating_sub(estimate_tokens(&settings.system_prompt)),
            ),
            provider,
            augmenter: None,
            tracer: Arc::new(RunTracer::disabled()),
            settings,
        }
    }

    /// Enable retrieval-augmented mode
    pub fn with_augmenter(mut self, augmenter: Arc<RetrievalAugmenter>) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<RunTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn retrieval_enabled(&self) -> bool {
        self.augmenter.is_some()
    }

    pub fn augmenter(&self) -> Option<&Arc<RetrievalAugmenter>> {
        self.augmenter.as_ref()
    }

    pub fn tracer(&self) -> &Arc<RunTracer> {
        &self.tracer
    }

    /// Current stored transcript for a session
    pub async fn transcript(&self, session_id: &str) -> Transcript {
        self.store.load(session_id).await
    }

    pub async fn handle_turn(&self, session_id: &str, user_text: &str) -> Result<TurnReply> {
        if session_id.trim().is_empty() || user_text.trim().is_empty() {
            return Err(ChatbotError::InvalidRequest(MISSING_FIELDS.to_string()));
        }

        let _guard = self.locks.acquire(session_id).await;
        let started_at = Utc::now();

        let mut transcript = self.store.load(session_id).await;
        transcript.push(Message::user(user_text));

        let augmentation = match &self.augmenter {
            Some(augmenter) => Some(augmenter.augment(user_text, self.settings.top_k).await),
            None => None,
        };
        let prompt_text = augmentation
            .as_ref()
            .map_or(user_text, |a| a.prompt.as_str());

        // Trim what is actually sent: the prompt stands in for the new user message.
        let mut outgoing = transcript.messages().to_vec();
        if let Some(latest) = outgoing.last_mut() {
            latest.content = prompt_text.to_string();
        }
        let bounded = self.trimmer.trim(&outgoing);
        let request = self.build_request(&bounded);

        debug!(
            session_id,
            history = transcript.len(),
            sent = request.len(),
            "Calling completion provider"
        );

        let outcome = match tokio::time::timeout(
            self.settings.provider_timeout,
            self.provider.complete(&request, self.settings.max_tokens),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChatbotError::ProviderUnavailable(format!(
                "no response within {:?}",
                self.settings.provider_timeout
            ))),
        };

        let (response, degraded, error_text) = match outcome {
            Ok(reply) => {
                transcript.push(Message::assistant(reply.clone()));
                (reply, false, None)
            }
            Err(error) => {
                warn!(session_id, "Completion failed, returning fallback reply: {}", error);
                (FALLBACK_REPLY.to_string(), true, Some(error.to_string()))
            }
        };

        let persisted = match self.store.save(session_id, &transcript).await {
            Ok(()) => true,
            Err(error) => {
                error!(
                    session_id,
                    "Failed to persist transcript, history may be lost: {}", error
                );
                false
            }
        };

        self.tracer
            .record(RunRecord {
                run_id: Uuid::new_v4(),
                session_id: session_id.to_string(),
                project: self.tracer.project(),
                prompt_hash: compute_prompt_hash(&request),
                prompt_messages: request.len(),
                snippets: augmentation.as_ref().map_or(0, |a| a.snippets.len()),
                outcome: if degraded {
                    RunOutcome::ProviderFailed
                } else {
                    RunOutcome::Completed
                },
                error: error_text,
                started_at,
                finished_at: Utc::now(),
            })
            .await;

        info!(
            session_id,
            messages = transcript.len(),
            degraded,
            persisted,
            "Turn complete"
        );

        let (sources, source_urls) = match augmentation {
            Some(augmentation) => {
                let (texts, urls) = citations(augmentation);
                (Some(texts), Some(urls))
            }
            None => (None, None),
        };

        Ok(TurnReply {
            response,
            sources,
            source_urls,
            degraded,
            persisted,
        })
    }

    /// System preamble followed by the bounded history, which already ends
    /// with the (possibly augmented) prompt.
    fn build_request(&self, bounded: &[Message]) -> Vec<ChatTurn> {
        let mut request = Vec::with_capacity(bounded.len() + 1);
        request.push(ChatTurn::new(MessageRole::System, self.settings.system_prompt.clone()));
        request.extend(bounded.iter().map(ChatTurn::from));
        request
    }
}

/// Snippet texts, plus their distinct URLs in rank order
fn citations(augmentation: Augmentation) -> (Vec<String>, Vec<String>) {
    let mut urls: Vec<String> = Vec::new();
    let mut texts = Vec::with_capacity(augmentation.snippets.len());

    for snippet in augmentation.snippets {
        if !urls.contains(&snippet.source_url) {
            urls.push(snippet.source_url);
        }
        texts.push(snippet.text);
    }

    (texts, urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompletionProvider;
    use crate::memory::{FileSessionStore, InMemorySessionStore};
    use crate::retrieval::embedder::HashingEmbedder;
    use crate::retrieval::index::{IndexBuilder, IndexHandle};
    use crate::retrieval::test_support::StaticLoader;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn orchestrator(provider: MockCompletionProvider) -> (Arc<InMemorySessionStore>, Arc<MockCompletionProvider>, ConversationOrchestrator) {
        let store = Arc::new(InMemorySessionStore::new());
        let provider = Arc::new(provider);
        let orchestrator = ConversationOrchestrator::new(
            store.clone(),
            provider.clone(),
            ConversationSettings::default(),
        );
        (store, provider, orchestrator)
    }

    /// Accepts loads, refuses every save.
    struct ReadOnlyStore;

    #[async_trait]
    impl SessionStore for ReadOnlyStore {
        async fn load(&self, session_id: &str) -> Transcript {
            Transcript::new(session_id)
        }

        async fn save(&self, _session_id: &str, _transcript: &Transcript) -> Result<()> {
            Err(ChatbotError::StorageWrite("read-only filesystem".into()))
        }
    }

    /// Never answers.
    struct HangingProvider;

    #[async_trait]
    impl CompletionProvider for HangingProvider {
        async fn complete(&self, _messages: &[ChatTurn], _max_tokens: u32) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("too late".into())
        }
    }

    #[tokio::test]
    async fn test_empty_inputs_are_rejected() {
        let (store, provider, orchestrator) = orchestrator(MockCompletionProvider::new());

        for (id, text) in [("", "Hi"), ("s1", ""), ("   ", "Hi"), ("s1", "  \n")] {
            let err = orchestrator.handle_turn(id, text).await.unwrap_err();
            assert!(matches!(err, ChatbotError::InvalidRequest(_)));
            assert_eq!(err.to_string(), MISSING_FIELDS);
        }
        assert_eq!(store.session_count().await, 0);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_successful_turn_appends_two_messages() {
        let (_store, _provider, orchestrator) =
            orchestrator(MockCompletionProvider::new().reply("Hi! How can I help?"));

        let reply = orchestrator.handle_turn("s1", "Hello").await.unwrap();
        assert_eq!(reply.response, "Hi! How can I help?");
        assert!(!reply.degraded);
        assert!(reply.persisted);
        assert!(reply.sources.is_none());

        let transcript = orchestrator.transcript("s1").await;
        let pairs: Vec<_> = transcript
            .messages()
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (MessageRole::User, "Hello"),
                (MessageRole::Assistant, "Hi! How can I help?")
            ]
        );
    }

    #[tokio::test]
    async fn test_provider_failure_persists_user_turn_only() {
        let (_store, _provider, orchestrator) = orchestrator(
            MockCompletionProvider::new()
                .reply("first answer")
                .fail(ChatbotError::ProviderUnavailable("503".into())),
        );

        orchestrator.handle_turn("s1", "one").await.unwrap();
        assert_eq!(orchestrator.transcript("s1").await.len(), 2);

        let reply = orchestrator.handle_turn("s1", "two").await.unwrap();
        assert!(reply.degraded);
        assert_eq!(reply.response, FALLBACK_REPLY);

        let transcript = orchestrator.transcript("s1").await;
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript.last().map(|m| m.content.as_str()), Some("two"));
    }

    #[tokio::test]
    async fn test_request_carries_preamble_history_and_prompt() {
        let (_store, provider, orchestrator) = orchestrator(MockCompletionProvider::new());

        orchestrator.handle_turn("s1", "My name is Ada.").await.unwrap();
        orchestrator.handle_turn("s1", "What is my name?").await.unwrap();

        let calls = provider.calls();
        let second = &calls[1];
        assert_eq!(second[0].role, MessageRole::System);
        assert_eq!(second[1].content, "My name is Ada.");
        assert_eq!(second[2].role, MessageRole::Assistant);
        assert_eq!(second.last().map(|t| t.content.as_str()), Some("What is my name?"));
        assert_eq!(second.len(), 4);
    }

    fn sent_tokens(request: &[ChatTurn]) -> usize {
        request.iter().map(|turn| estimate_tokens(&turn.content)).sum()
    }

    #[tokio::test]
    async fn test_history_is_trimmed_to_budget() {
        let store = Arc::new(InMemorySessionStore::new());
        let provider = Arc::new(MockCompletionProvider::new());
        let orchestrator = ConversationOrchestrator::new(
            store,
            provider.clone(),
            ConversationSettings {
                system_prompt: "Be brief.".into(),
                token_budget: 30,
                ..ConversationSettings::default()
            },
        );

        for i in 0..10 {
            orchestrator
                .handle_turn("s1", &format!("message number {}", i))
                .await
                .unwrap();
        }

        let last_call = provider.calls().pop().unwrap();
        assert!(sent_tokens(&last_call) <= 30);
        assert_eq!(last_call[0].content, "Be brief.");
        assert_eq!(last_call[1].role, MessageRole::User);
        assert_eq!(last_call.last().map(|t| t.content.as_str()), Some("message number 9"));
        assert!(last_call.len() < 21);
        assert_eq!(orchestrator.transcript("s1").await.len(), 20);
    }

    #[tokio::test]
    async fn test_augmented_prompt_counts_against_budget() {
        let dir = TempDir::new().unwrap();
        let loader = StaticLoader::new(&[(
            "https://docs.example/cargo",
            "Cargo is the package manager that downloads crates and builds your project.",
        )]);
        let embedder = Arc::new(HashingEmbedder::new(256));
        let handle = IndexHandle::new(
            dir.path(),
            vec!["https://docs.example/cargo".to_string()],
            IndexBuilder::new(Arc::new(loader), embedder.clone(), 500, 50),
        );
        let augmenter = Arc::new(RetrievalAugmenter::new(Arc::new(handle), embedder));

        let mut script = MockCompletionProvider::new();
        for _ in 0..13 {
            script = script.reply("ok");
        }
        let provider = Arc::new(script);
        let orchestrator = ConversationOrchestrator::new(
            Arc::new(InMemorySessionStore::new()),
            provider.clone(),
            ConversationSettings {
                system_prompt: "Be brief.".into(),
                token_budget: 150,
                ..ConversationSettings::default()
            },
        )
        .with_augmenter(augmenter);

        for i in 0..12 {
            orchestrator
                .handle_turn("s1", &format!("message number {}", i))
                .await
                .unwrap();
        }
        orchestrator.handle_turn("s1", "What builds crates?").await.unwrap();

        let last_call = provider.calls().pop().unwrap();
        assert!(sent_tokens(&last_call) <= 150, "sent {}", sent_tokens(&last_call));
        assert_eq!(last_call[1].role, MessageRole::User);
        assert!(last_call
            .last()
            .unwrap()
            .content
            .ends_with("Question: What builds crates?"));
        assert_eq!(orchestrator.transcript("s1").await.len(), 26);
    }

    #[tokio::test]
    async fn test_timeout_is_a_provider_failure() {
        let store = Arc::new(InMemorySessionStore::new());
        let orchestrator = ConversationOrchestrator::new(
            store,
            Arc::new(HangingProvider),
            ConversationSettings {
                provider_timeout: Duration::from_millis(20),
                ..ConversationSettings::default()
            },
        );

        let reply = orchestrator.handle_turn("s1", "Hello").await.unwrap();
        assert!(reply.degraded);
        assert_eq!(orchestrator.transcript("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_save_failure_still_returns_reply() {
        let orchestrator = ConversationOrchestrator::new(
            Arc::new(ReadOnlyStore),
            Arc::new(MockCompletionProvider::new().reply("still here")),
            ConversationSettings::default(),
        );

        let reply = orchestrator.handle_turn("s1", "Hello").await.unwrap();
        assert_eq!(reply.response, "still here");
        assert!(!reply.persisted);
    }

    #[tokio::test]
    async fn test_concurrent_turns_on_one_session_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileSessionStore::open(dir.path()).await.unwrap());
        let orchestrator = Arc::new(ConversationOrchestrator::new(
            store,
            Arc::new(MockCompletionProvider::new()),
            ConversationSettings::default(),
        ));

        let turns: Vec<_> = (0..16)
            .map(|i| {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    orchestrator
                        .handle_turn("shared", &format!("message {}", i))
                        .await
                })
            })
            .collect();

        for turn in turns {
            assert!(turn.await.unwrap().unwrap().persisted);
        }

        let transcript = orchestrator.transcript("shared").await;
        assert_eq!(transcript.len(), 32);
        for pair in transcript.messages().chunks(2) {
            assert_eq!(pair[0].role, MessageRole::User);
            assert_eq!(pair[1].role, MessageRole::Assistant);
            assert_eq!(pair[1].content, format!("You said: {}", pair[0].content));
        }
    }

    #[tokio::test]
    async fn test_retrieval_mode_returns_sources() {
        let dir = TempDir::new().unwrap();
        let loader = StaticLoader::new(&[(
            "https://docs.example/cargo",
            "Cargo is the package manager that downloads crates and builds your project.",
        )]);
        let embedder = Arc::new(HashingEmbedder::new(256));
        let handle = IndexHandle::new(
            dir.path(),
            vec!["https://docs.example/cargo".to_string()],
            IndexBuilder::new(Arc::new(loader), embedder.clone(), 500, 50),
        );
        let augmenter = Arc::new(RetrievalAugmenter::new(Arc::new(handle), embedder));

        let (_store, provider, orchestrator) = orchestrator(MockCompletionProvider::new().reply("Use cargo."));
        let orchestrator = orchestrator.with_augmenter(augmenter);

        let reply = orchestrator.handle_turn("s1", "What builds crates?").await.unwrap();
        assert_eq!(
            reply.sources,
            Some(vec![
                "Cargo is the package manager that downloads crates and builds your project."
                    .to_string()
            ])
        );
        assert_eq!(reply.source_urls, Some(vec!["https://docs.example/cargo".to_string()]));

        let sent = provider.calls().pop().unwrap();
        assert!(sent.last().unwrap().content.contains("(source: https://docs.example/cargo)"));

        // The transcript keeps what the user typed, not the augmented prompt.
        let transcript = orchestrator.transcript("s1").await;
        assert_eq!(transcript.messages()[0].content, "What builds crates?");
    }

    #[tokio::test]
    async fn test_turns_are_traced() {
        let (_store, _provider, orchestrator) = orchestrator(
            MockCompletionProvider::new().fail(ChatbotError::ProviderAuth("401".into())),
        );

        orchestrator.handle_turn("s1", "Hello").await.unwrap();
        let records = orchestrator.tracer().list_for_session("s1").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, RunOutcome::ProviderFailed);
        assert_eq!(records[0].prompt_messages, 2);
    }

    #[test]
    fn test_citations_dedupe_urls_in_rank_order() {
        use crate::retrieval::Snippet;
        let snippet = |text: &str, url: &str| Snippet {
            text: text.into(),
            source_url: url.into(),
        };
        let (texts, urls) = citations(Augmentation {
            prompt: String::new(),
            snippets: vec![snippet("a", "u1"), snippet("b", "u2"), snippet("c", "u1")],
        });
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(urls, vec!["u1", "u2"]);
    }
}
