//! Run tracing
//!
//! Every turn leaves a `RunRecord`. Records are kept in a bounded in-memory
//! log and, when tracing is configured, exported to the tracing service
//! from a background task. Export never affects the turn.

use crate::config::TracingConfig;
use crate::llm::ChatTurn;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_RECORDS: usize = 512;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    ProviderFailed,
}

/// One traced conversation turn
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub session_id: String,
    pub project: Option<String>,
    pub prompt_hash: String,
    pub prompt_messages: usize,
    pub snippets: usize,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Remote run exporter
struct RunExporter {
    client: Client,
    config: TracingConfig,
}

impl RunExporter {
    fn new(config: TracingConfig) -> Option<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| warn!("Run tracing disabled, HTTP client unavailable: {}", e))
            .ok()?;
        Some(Self { client, config })
    }

    async fn export(&self, record: &RunRecord) {
        let body = serde_json::json!({
            "id": record.run_id,
            "name": "chat_turn",
            "run_type": "llm",
            "session_name": self.config.project,
            "start_time": record.started_at.to_rfc3339(),
            "end_time": record.finished_at.to_rfc3339(),
            "inputs": {
                "session_id": record.session_id,
                "prompt_hash": record.prompt_hash,
                "prompt_messages": record.prompt_messages,
                "snippets": record.snippets,
            },
            "outputs": { "outcome": record.outcome },
            "error": record.error,
        });

        let result = self
            .client
            .post(format!("{}/runs", self.config.endpoint))
            .header("x-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(run_id = %record.run_id, "Exported run record");
            }
            Ok(response) => warn!(run_id = %record.run_id, "Run export rejected: {}", response.status()),
            Err(e) => warn!(run_id = %record.run_id, "Run export failed: {}", e),
        }
    }
}

/// Run trail storage
pub struct RunTracer {
    records: Arc<RwLock<VecDeque<RunRecord>>>,
    exporter: Option<Arc<RunExporter>>,
}

impl RunTracer {
    pub fn new(config: Option<TracingConfig>) -> Self {
        Self {
            records: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_RECORDS))),
            exporter: config.and_then(RunExporter::new).map(Arc::new),
        }
    }

    /// Local log only
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn exporting(&self) -> bool {
        self.exporter.is_some()
    }

    pub fn project(&self) -> Option<String> {
        self.exporter.as_ref().map(|e| e.config.project.clone())
    }

    /// Store a record and hand it to the exporter
    pub async fn record(&self, record: RunRecord) {
        {
            let mut records = self.records.write().await;
            if records.len() == MAX_RECORDS {
                records.pop_front();
            }
            records.push_back(record.clone());
        }

        if let Some(exporter) = &self.exporter {
            let exporter = Arc::clone(exporter);
            tokio::spawn(async move {
                exporter.export(&record).await;
            });
        }
    }

    /// Records for a session, oldest first
    pub async fn list_for_session(&self, session_id: &str) -> Vec<RunRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }
}

impl Default for RunTracer {
    fn default() -> Self {
        Self::disabled()
    }
}

/// SHA-256 fingerprint of the messages sent to the provider.
/// Streams JSON straight into the hasher.
pub fn compute_prompt_hash(messages: &[ChatTurn]) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), messages).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MessageRole;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(session_id: &str) -> RunRecord {
        RunRecord {
            run_id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            project: None,
            prompt_hash: "abc".into(),
            prompt_messages: 2,
            snippets: 0,
            outcome: RunOutcome::Completed,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_hash_is_stable_and_content_sensitive() {
        let a = vec![ChatTurn::new(MessageRole::User, "Hello")];
        let b = vec![ChatTurn::new(MessageRole::User, "Hello!")];

        assert_eq!(compute_prompt_hash(&a), compute_prompt_hash(&a));
        assert_ne!(compute_prompt_hash(&a), compute_prompt_hash(&b));
        assert_eq!(compute_prompt_hash(&a).len(), 64);
    }

    #[tokio::test]
    async fn test_records_are_bounded_and_filtered_by_session() {
        let tracer = RunTracer::disabled();
        assert!(!tracer.exporting());

        for _ in 0..MAX_RECORDS {
            tracer.record(record("busy")).await;
        }
        tracer.record(record("quiet")).await;

        assert_eq!(tracer.list_for_session("quiet").await.len(), 1);
        assert_eq!(tracer.list_for_session("busy").await.len(), MAX_RECORDS - 1);
    }

    #[tokio::test]
    async fn test_exporter_posts_runs_with_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/runs"))
            .and(header("x-api-key", "ls-key"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let tracer = RunTracer::new(Some(TracingConfig {
            api_key: "ls-key".into(),
            project: "chatbot_with_langchain".into(),
            endpoint: server.uri(),
        }));
        assert_eq!(tracer.project().as_deref(), Some("chatbot_with_langchain"));

        tracer.record(record("s1")).await;

        for _ in 0..50 {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        server.verify().await;
    }
}
