//! Orchestrator (component E): binds the node library onto a declared
//! graph topology and exposes the top-level entry points a caller uses.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use orchestrator_core::client::ClientError;
use orchestrator_core::graph::{Edge, GraphError, NodeError, StateGraph, END};
use orchestrator_core::nodes::{
    answer, filter_memory, parse_intent, resolve_references, retrieve_memory, sanitize_web, store_conversation,
    store_memory, validate_answer, web_search, NodeConfig, NodeCtx, Phase,
};
use orchestrator_core::registry::{RegistryError, ServiceRegistry};
use orchestrator_core::state::{RunContext, StreamTokenSink, WorkflowState};
use orchestrator_core::trace::{GraphState, ProgressSink, TraceEntry};
use orchestrator_core::ServiceClient;

use crate::config::OrchestratorConfig;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// One finished run, kept in the bounded trace ring for post-hoc
/// inspection (§6's "recent traces: in memory only").
#[derive(Debug, Clone, Serialize)]
pub struct RunTrace {
    pub request_id: String,
    pub session_id: String,
    pub success: bool,
    pub elapsed_ms: u64,
    pub entries: Vec<TraceEntry>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub limit: Option<usize>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub success: bool,
    pub action: String,
    pub data: Value,
    pub response: Option<String>,
    pub elapsed_ms: u64,
    pub trace: Vec<TraceEntry>,
    pub debug: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub orchestrator: &'static str,
    pub registered_services: usize,
    pub services: std::collections::HashMap<String, orchestrator_core::registry::Health>,
}

/// Builds the `parallelWebAndMemory` / `parallelSanitizeAndFilter` legs as
/// their own tiny graphs so the main graph's composite node can call
/// `execute_parallel` on them without a self-referential `Arc`.
fn build_parallel_web_and_memory(ctx: NodeCtx) -> Arc<StateGraph<WorkflowState>> {
    let web_ctx = ctx.clone();
    let mem_ctx = ctx;
    Arc::new(
        StateGraph::builder()
            .start("webSearch")
            .node_with_writes("webSearch", vec!["context_docs"], move |s| {
                let ctx = web_ctx.clone();
                Box::pin(web_search(ctx, s))
            })
            .node_with_writes(
                "retrieveMemory",
                vec![
                    "conversation_history",
                    "session_facts",
                    "session_entities",
                    "memories",
                ],
                move |s| {
                    let ctx = mem_ctx.clone();
                    Box::pin(retrieve_memory(ctx, s))
                },
            )
            .build()
            .expect("parallel web/memory graph has a start edge"),
    )
}

fn build_parallel_sanitize_and_filter(ctx: NodeCtx) -> Arc<StateGraph<WorkflowState>> {
    let sanitize_ctx = ctx.clone();
    let filter_ctx = ctx;
    Arc::new(
        StateGraph::builder()
            .start("sanitizeWeb")
            .node_with_writes("sanitizeWeb", vec!["context_docs"], move |s| {
                let ctx = sanitize_ctx.clone();
                Box::pin(sanitize_web(ctx, s))
            })
            .node_with_writes(
                "filterMemory",
                vec!["filtered_memories", "memories_filtered"],
                move |s| {
                    let ctx = filter_ctx.clone();
                    Box::pin(filter_memory(ctx, s))
                },
            )
            .build()
            .expect("parallel sanitize/filter graph has a start edge"),
    )
}

fn route_after_intent(state: &WorkflowState) -> Option<String> {
    let kind = state.intent.as_ref().map(|i| i.kind.as_str()).unwrap_or("general_query");
    let next = match kind {
        "memory_store" | "remember" => "storeMemory",
        "web_search" | "search" | "question" => "parallelWebAndMemory",
        "greeting" => "answer",
        "command_execute" | "command" => "answer",
        _ => "retrieveMemory",
    };
    Some(next.to_string())
}

fn route_after_validate(state: &WorkflowState) -> Option<String> {
    if state.should_perform_web_search {
        Some("webSearch".to_string())
    } else if state.needs_retry {
        Some("answer".to_string())
    } else {
        Some("storeConversation".to_string())
    }
}

fn build_graph(ctx: NodeCtx, iteration_cap: u32) -> StateGraph<WorkflowState> {
    let parallel_web_memory = build_parallel_web_and_memory(ctx.clone());
    let parallel_sanitize_filter = build_parallel_sanitize_and_filter(ctx.clone());

    let early_ctx = ctx.clone();
    let late_ctx = ctx.clone();
    let intent_ctx = ctx.clone();
    let store_memory_ctx = ctx.clone();
    let retrieve_ctx = ctx.clone();
    let filter_ctx = ctx.clone();
    let answer_ctx = ctx.clone();
    let validate_ctx = ctx.clone();
    let web_ctx = ctx.clone();
    let sanitize_ctx = ctx.clone();
    let store_conv_ctx = ctx;

    StateGraph::builder()
        .iteration_cap(iteration_cap)
        .start("earlyResolveReferences")
        .node("earlyResolveReferences", move |s| {
            let ctx = early_ctx.clone();
            Box::pin(resolve_references(ctx, s, Phase::Early))
        })
        .edge("earlyResolveReferences", Edge::Static("parseIntent".to_string()))
        .node("parseIntent", move |s| {
            let ctx = intent_ctx.clone();
            Box::pin(parse_intent(ctx, s))
        })
        .edge("parseIntent", Edge::Conditional(Arc::new(route_after_intent)))
        .node("storeMemory", move |s| {
            let ctx = store_memory_ctx.clone();
            Box::pin(store_memory(ctx, s))
        })
        .edge("storeMemory", Edge::Static(END.to_string()))
        .node("parallelWebAndMemory", move |s| {
            let graph = parallel_web_memory.clone();
            Box::pin(async move {
                graph
                    .execute_parallel(&["webSearch".to_string(), "retrieveMemory".to_string()], s)
                    .await
                    .map_err(|e| NodeError::new(e.to_string()))
            })
        })
        .edge(
            "parallelWebAndMemory",
            Edge::Static("parallelSanitizeAndFilter".to_string()),
        )
        .node("parallelSanitizeAndFilter", move |s| {
            let graph = parallel_sanitize_filter.clone();
            Box::pin(async move {
                graph
                    .execute_parallel(&["sanitizeWeb".to_string(), "filterMemory".to_string()], s)
                    .await
                    .map_err(|e| NodeError::new(e.to_string()))
            })
        })
        .edge(
            "parallelSanitizeAndFilter",
            Edge::Static("resolveReferences".to_string()),
        )
        .node("retrieveMemory", move |s| {
            let ctx = retrieve_ctx.clone();
            Box::pin(retrieve_memory(ctx, s))
        })
        .edge("retrieveMemory", Edge::Static("filterMemory".to_string()))
        .node("filterMemory", move |s| {
            let ctx = filter_ctx.clone();
            Box::pin(filter_memory(ctx, s))
        })
        .edge("filterMemory", Edge::Static("resolveReferences".to_string()))
        .node("resolveReferences", move |s| {
            let ctx = late_ctx.clone();
            Box::pin(resolve_references(ctx, s, Phase::Late))
        })
        .edge("resolveReferences", Edge::Static("answer".to_string()))
        .node("answer", move |s| {
            let ctx = answer_ctx.clone();
            Box::pin(answer(ctx, s))
        })
        .edge("answer", Edge::Static("validateAnswer".to_string()))
        .node("validateAnswer", move |s| {
            let ctx = validate_ctx.clone();
            Box::pin(validate_answer(ctx, s))
        })
        .edge("validateAnswer", Edge::Conditional(Arc::new(route_after_validate)))
        .node("webSearch", move |s| {
            let ctx = web_ctx.clone();
            Box::pin(web_search(ctx, s))
        })
        .edge("webSearch", Edge::Static("sanitizeWeb".to_string()))
        .node("sanitizeWeb", move |s| {
            let ctx = sanitize_ctx.clone();
            Box::pin(sanitize_web(ctx, s))
        })
        .edge("sanitizeWeb", Edge::Static("answer".to_string()))
        .node("storeConversation", move |s| {
            let ctx = store_conv_ctx.clone();
            Box::pin(store_conversation(ctx, s))
        })
        .edge("storeConversation", Edge::Static(END.to_string()))
        .build()
        .expect("the orchestration graph declares a start edge")
}

pub struct Orchestrator {
    client: Arc<ServiceClient>,
    registry: Arc<ServiceRegistry>,
    graph: OnceCell<Arc<StateGraph<WorkflowState>>>,
    node_config: NodeConfig,
    iteration_cap: u32,
    traces: Mutex<VecDeque<RunTrace>>,
    trace_ring_capacity: usize,
}

impl Orchestrator {
    pub fn new(registry: Arc<ServiceRegistry>, config: &OrchestratorConfig) -> Self {
        let client = Arc::new(ServiceClient::new(registry.clone()));
        Self {
            client,
            registry,
            graph: OnceCell::new(),
            node_config: NodeConfig::default(),
            iteration_cap: config.iteration_cap,
            traces: Mutex::new(VecDeque::with_capacity(config.trace_ring_capacity)),
            trace_ring_capacity: config.trace_ring_capacity,
        }
    }

    fn graph(&self) -> Arc<StateGraph<WorkflowState>> {
        self.graph
            .get_or_init(|| {
                let ctx = NodeCtx::new(self.client.clone()).with_config(self.node_config.clone());
                Arc::new(build_graph(ctx, self.iteration_cap))
            })
            .clone()
    }

    pub async fn process(
        &self,
        message: impl Into<String>,
        context: RunContext,
        progress: Option<ProgressSink>,
        on_stream_token: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    ) -> ProcessResult {
        let mut initial = WorkflowState::new(message, context);
        initial.streaming = on_stream_token.is_some();
        initial.on_stream_token = on_stream_token.map(StreamTokenSink);
        let request_id = initial.request_id.clone();
        let session_id = initial.context.session_id.clone();

        let final_state = self.graph().execute(initial, progress).await;

        let action = final_state
            .intent
            .as_ref()
            .map(|i| i.kind.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let result = ProcessResult {
            success: final_state.success,
            action,
            data: serde_json::json!({
                "memory_id": final_state.memory_id,
                "memory_stored": final_state.memory_stored,
                "conversation_stored": final_state.conversation_stored,
            }),
            response: final_state.answer.clone(),
            elapsed_ms: final_state.elapsed_ms,
            trace: final_state.trace.clone(),
            debug: None,
        };

        self.record_trace(RunTrace {
            request_id,
            session_id,
            success: final_state.success,
            elapsed_ms: final_state.elapsed_ms,
            entries: final_state.trace,
            recorded_at: Utc::now(),
        })
        .await;

        result
    }

    /// Direct escape hatch to the Service Client, bypassing the graph
    /// entirely (§4.E `execute_action`).
    pub async fn execute_action(
        &self,
        service: &str,
        action: &str,
        payload: Value,
    ) -> Result<ActionResult, OrchestratorError> {
        let data = self
            .client
            .call::<Value>(service, action, payload, orchestrator_core::client::CallOptions::once())
            .await?;
        Ok(ActionResult {
            success: true,
            data: Some(data),
        })
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            orchestrator: "healthy",
            registered_services: self.registry.list().await.len(),
            services: self.client.health_check_all().await,
        }
    }

    pub async fn traces(&self, query: TraceQuery) -> Vec<RunTrace> {
        let traces = self.traces.lock().await;
        let filtered: Vec<RunTrace> = traces
            .iter()
            .rev()
            .filter(|t| query.session_id.as_deref().map(|s| s == t.session_id).unwrap_or(true))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        filtered
    }

    async fn record_trace(&self, entry: RunTrace) {
        let mut traces = self.traces.lock().await;
        if traces.len() >= self.trace_ring_capacity {
            traces.pop_front();
        }
        traces.push_back(entry);
    }
}

/// Re-exported for callers that want the lower-level streaming primitive
/// without going through `process`.
pub use orchestrator_core::client::StreamEvent as OrchestratorStreamEvent;
