//! Workflow State (components C/D): the mutable record nodes thread through
//! one run of the orchestration graph.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::trace::{GraphState, TraceEntry};

/// A caller-supplied sink for tokens emitted by a streaming answer.
/// Wrapped rather than a bare `Arc<dyn Fn>` so `WorkflowState` can still
/// derive `Debug`.
#[derive(Clone)]
pub struct StreamTokenSink(pub Arc<dyn Fn(&str) + Send + Sync>);

impl std::fmt::Debug for StreamTokenSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamTokenSink(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    #[serde(rename = "type")]
    pub kind: String,
    pub confidence: f32,
    pub entities: Vec<String>,
    pub requires_memory: bool,
    pub suggested_response: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunContext {
    pub session_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub conversation_history: Option<Vec<String>>,
    pub use_online_mode: bool,
    pub has_selection: bool,
    pub selection_context: Option<String>,
    pub highlighted_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    pub similarity: f32,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDocument {
    pub title: String,
    pub snippet: String,
    pub url: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnswerMetadata {
    pub model: String,
    pub tokens: u32,
    pub duration_ms: u64,
}

/// The mutable record threaded through one run of the orchestration graph.
/// Collections are always `Vec` (possibly empty), never `Option<Vec<_>>` —
/// "empty" and "absent" are distinct only for scalar fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub request_id: String,
    pub message: String,
    pub resolved_message: Option<String>,
    pub context: RunContext,

    pub intent: Option<Intent>,
    pub target_entity: Option<String>,

    pub conversation_history: Vec<String>,
    pub session_facts: Vec<String>,
    pub session_entities: Vec<String>,
    pub memories: Vec<MemoryRecord>,
    pub filtered_memories: Vec<MemoryRecord>,
    pub memories_filtered: usize,

    pub context_docs: Vec<WebDocument>,

    pub answer: Option<String>,
    pub answer_metadata: Option<AnswerMetadata>,
    pub retry_count: u32,
    pub needs_retry: bool,
    pub should_perform_web_search: bool,
    pub validation_issues: Vec<String>,
    pub streaming: bool,
    /// Set from `Orchestrator::process`'s `on_stream_token` argument; its
    /// presence is what derives `streaming`. Never persisted or traced.
    #[serde(skip)]
    pub on_stream_token: Option<StreamTokenSink>,
    /// Cancellation observed between streamed tokens and propagated into
    /// every outstanding service call a node makes for this run.
    #[serde(skip)]
    pub cancellation: CancellationToken,
    pub coreference_resolved_early: bool,
    pub retrieval_added_context: bool,

    pub conversation_stored: bool,
    pub memory_stored: bool,
    pub memory_id: Option<String>,

    pub start_time: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub iterations: u32,
    pub trace: Vec<TraceEntry>,
    pub success: bool,
    pub error: Option<String>,
    pub failed_node: Option<String>,
}

impl WorkflowState {
    pub fn new(message: impl Into<String>, context: RunContext) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            resolved_message: None,
            context,
            intent: None,
            target_entity: None,
            conversation_history: Vec::new(),
            session_facts: Vec::new(),
            session_entities: Vec::new(),
            memories: Vec::new(),
            filtered_memories: Vec::new(),
            memories_filtered: 0,
            context_docs: Vec::new(),
            answer: None,
            answer_metadata: None,
            retry_count: 0,
            needs_retry: false,
            should_perform_web_search: false,
            validation_issues: Vec::new(),
            streaming: false,
            on_stream_token: None,
            cancellation: CancellationToken::new(),
            coreference_resolved_early: false,
            retrieval_added_context: false,
            conversation_stored: false,
            memory_stored: false,
            memory_id: None,
            start_time: Utc::now(),
            elapsed_ms: 0,
            iterations: 0,
            trace: Vec::new(),
            success: false,
            error: None,
            failed_node: None,
        }
    }

    /// The message downstream of intent parsing: resolved if coreference
    /// produced one, otherwise the original. Intent parsing itself must
    /// never call this — it always uses `message` directly (§4.D).
    pub fn query_message(&self) -> &str {
        self.resolved_message.as_deref().unwrap_or(&self.message)
    }
}

impl GraphState for WorkflowState {
    fn push_trace(&mut self, entry: TraceEntry) {
        self.trace.push(entry);
    }

    fn iterations(&self) -> u32 {
        self.iterations
    }

    fn set_iterations(&mut self, n: u32) {
        self.iterations = n;
    }

    fn set_elapsed_ms(&mut self, ms: u64) {
        self.elapsed_ms = ms;
    }

    fn set_failure(&mut self, node: &str, error: String) {
        self.success = false;
        self.error = Some(error);
        self.failed_node = Some(node.to_string());
    }

    fn mark_success(&mut self) {
        self.success = true;
        self.error = None;
        self.failed_node = None;
    }

    fn snapshot(&self) -> Value {
        json!({
            "intent_type": self.intent.as_ref().map(|i| i.kind.clone()),
            "memories": self.memories.len(),
            "filtered_memories": self.filtered_memories.len(),
            "context_docs": self.context_docs.len(),
            "has_answer": self.answer.is_some(),
            "needs_retry": self.needs_retry,
            "should_perform_web_search": self.should_perform_web_search,
            "retry_count": self.retry_count,
        })
    }

    fn apply_writes(&mut self, other: &Self, fields: &[&'static str]) {
        for field in fields {
            match *field {
                "context_docs" => self.context_docs = other.context_docs.clone(),
                "memories" => self.memories = other.memories.clone(),
                "filtered_memories" => self.filtered_memories = other.filtered_memories.clone(),
                "memories_filtered" => self.memories_filtered = other.memories_filtered,
                "conversation_history" => self.conversation_history = other.conversation_history.clone(),
                "session_facts" => self.session_facts = other.session_facts.clone(),
                "session_entities" => self.session_entities = other.session_entities.clone(),
                "resolved_message" => self.resolved_message = other.resolved_message.clone(),
                _ => {}
            }
        }
    }
}

/// Produced at graph exit by `storeConversation`; `{user_message,
/// assistant_answer, ...}` from §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationExchange {
    pub user_message: String,
    pub assistant_answer: String,
    pub session_id: String,
    pub user_id: String,
    pub intent_type: String,
    pub confidence: f32,
    pub entities: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
