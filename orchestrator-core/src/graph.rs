//! Generic node/edge executor ("StateGraph engine", component C).
//!
//! This module knows nothing about intents, memories, or microservices — it
//! only drives a declared topology of named nodes over a state type that
//! implements [`GraphState`], recording a trace as it goes. The concrete
//! orchestration graph (nodes, edges, routing rules) lives in the
//! `agent_orchestrator` crate.

use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::trace::{GraphState, ProgressEvent, ProgressSink, TraceEntry};

pub const END: &str = "end";
pub const START: &str = "start";
const DEFAULT_ITERATION_CAP: u32 = 50;

/// An error raised while building or driving a graph. Node-level failures
/// are *not* represented here — those are folded into the state itself
/// (`set_failure`) per the engine's "always deliver a structured result"
/// contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("iteration cap exceeded")]
    IterationCapExceeded,
    #[error("conflicting write to field '{0}' during parallel fan-out")]
    ConflictingWrite(String),
    #[error("no 'start' edge declared")]
    MissingStart,
    #[error("cancelled")]
    Cancelled,
}

/// The error a node function returns. Carries only a display message —
/// the engine has no business inspecting domain-specific error variants.
#[derive(Debug, Clone)]
pub struct NodeError(pub String);

impl NodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NodeError {}

pub type NodeFn<S> = Arc<dyn Fn(S) -> BoxFuture<'static, Result<S, NodeError>> + Send + Sync>;

/// A declared edge out of a node.
#[derive(Clone)]
pub enum Edge<S> {
    /// Always go to this successor (or `"end"`).
    Static(String),
    /// Total predicate over the state; `None` is treated as `"end"`.
    Conditional(Arc<dyn Fn(&S) -> Option<String> + Send + Sync>),
}

impl<S> Edge<S> {
    fn resolve(&self, state: &S) -> String {
        match self {
            Edge::Static(name) => name.clone(),
            Edge::Conditional(f) => f(state).unwrap_or_else(|| END.to_string()),
        }
    }
}

struct NodeEntry<S> {
    func: NodeFn<S>,
    /// Field names this node writes when run inside `execute_parallel`.
    /// Unused for purely sequential nodes.
    writes: Vec<&'static str>,
}

pub struct StateGraph<S: GraphState> {
    nodes: HashMap<String, NodeEntry<S>>,
    edges: HashMap<String, Edge<S>>,
    iteration_cap: u32,
}

pub struct StateGraphBuilder<S: GraphState> {
    nodes: HashMap<String, NodeEntry<S>>,
    edges: HashMap<String, Edge<S>>,
    iteration_cap: u32,
}

impl<S: GraphState> Default for StateGraphBuilder<S> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            iteration_cap: DEFAULT_ITERATION_CAP,
        }
    }
}

impl<S: GraphState> StateGraphBuilder<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iteration_cap(mut self, cap: u32) -> Self {
        self.iteration_cap = cap;
        self
    }

    /// Register a node with no declared write-set (fine for any node that
    /// never participates in `execute_parallel`).
    pub fn node<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(S) -> BoxFuture<'static, Result<S, NodeError>> + Send + Sync + 'static,
    {
        self.nodes.insert(
            name.into(),
            NodeEntry {
                func: Arc::new(func),
                writes: Vec::new(),
            },
        );
        self
    }

    /// Register a node that declares the state fields it writes, so that
    /// `execute_parallel` can detect conflicting fan-out writes up front.
    pub fn node_with_writes<F>(
        mut self,
        name: impl Into<String>,
        writes: Vec<&'static str>,
        func: F,
    ) -> Self
    where
        F: Fn(S) -> BoxFuture<'static, Result<S, NodeError>> + Send + Sync + 'static,
    {
        self.nodes.insert(
            name.into(),
            NodeEntry {
                func: Arc::new(func),
                writes,
            },
        );
        self
    }

    pub fn edge(mut self, from: impl Into<String>, edge: Edge<S>) -> Self {
        self.edges.insert(from.into(), edge);
        self
    }

    pub fn start(self, first_node: impl Into<String>) -> Self {
        self.edge(START, Edge::Static(first_node.into()))
    }

    pub fn build(self) -> Result<StateGraph<S>, GraphError> {
        if !self.edges.contains_key(START) {
            return Err(GraphError::MissingStart);
        }
        Ok(StateGraph {
            nodes: self.nodes,
            edges: self.edges,
            iteration_cap: self.iteration_cap,
        })
    }
}

impl<S: GraphState> StateGraph<S> {
    pub fn builder() -> StateGraphBuilder<S> {
        StateGraphBuilder::new()
    }

    /// Drive `state` through the graph until `end` or the iteration cap.
    /// Never returns `Err` at this level — failure is recorded inside the
    /// returned state (`error`, `failed_node`) per the engine's contract.
    pub async fn execute(&self, mut state: S, progress: Option<ProgressSink>) -> S {
        let run_start = Instant::now();
        let mut current = match self.edges.get(START) {
            Some(edge) => edge.resolve(&state),
            None => {
                state.set_failure("start", GraphError::MissingStart.to_string());
                state.set_elapsed_ms(run_start.elapsed().as_millis() as u64);
                return state;
            }
        };

        let mut iterations: u32 = 0;
        let mut failed = false;

        loop {
            if current == END {
                break;
            }
            if iterations >= self.iteration_cap {
                warn!(iterations, "StateGraph iteration cap exceeded");
                state.set_failure(&current, GraphError::IterationCapExceeded.to_string());
                failed = true;
                break;
            }

            let entry = match self.nodes.get(&current) {
                Some(e) => e,
                None => {
                    state.set_failure(&current, GraphError::UnknownNode(current.clone()).to_string());
                    failed = true;
                    break;
                }
            };

            let input_snapshot = state.snapshot();
            // Kept so a hard node failure (which consumes `state` by value)
            // still leaves us something to attach the failure trace to.
            let pre_call_state = state.clone();
            let node_started = Utc::now();
            let node_timer = Instant::now();

            if let Some(sink) = &progress {
                sink(ProgressEvent::Start {
                    node: current.clone(),
                });
            }

            debug!(node = %current, "executing node");
            let result = (entry.func)(state).await;
            iterations += 1;
            let duration_ms = node_timer.elapsed().as_millis() as u64;

            match result {
                Ok(mut next_state) => {
                    let output_snapshot = next_state.snapshot();
                    next_state.push_trace(TraceEntry::success(
                        current.clone(),
                        node_started,
                        duration_ms,
                        input_snapshot,
                        output_snapshot,
                    ));
                    if let Some(sink) = &progress {
                        sink(ProgressEvent::Done {
                            node: current.clone(),
                        });
                    }
                    let edge = self.edges.get(&current);
                    let next = match edge {
                        Some(e) => e.resolve(&next_state),
                        None => END.to_string(),
                    };
                    state = next_state;
                    current = next;
                }
                Err(node_err) => {
                    if let Some(sink) = &progress {
                        sink(ProgressEvent::Error {
                            node: current.clone(),
                            message: node_err.0.clone(),
                        });
                    }
                    warn!(node = %current, error = %node_err, "node failed");
                    let mut failed_state = pre_call_state;
                    failed_state.push_trace(TraceEntry::failure(
                        current.clone(),
                        node_started,
                        duration_ms,
                        input_snapshot,
                        node_err.0.clone(),
                    ));
                    failed_state.set_failure(&current, node_err.0);
                    state = failed_state;
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            state.mark_success();
        }
        state.set_iterations(iterations);
        state.set_elapsed_ms(run_start.elapsed().as_millis() as u64);
        state
    }

    /// Run `node_names` concurrently over clones of `state`, merge their
    /// declared writes back into one state. Aborts with the first observed
    /// error; a declared write-set conflict fails fast before any node
    /// runs.
    pub async fn execute_parallel(
        &self,
        node_names: &[String],
        state: S,
    ) -> Result<S, GraphError> {
        // Conflict check up front.
        let mut seen: HashMap<&'static str, &str> = HashMap::new();
        let mut entries = Vec::with_capacity(node_names.len());
        for name in node_names {
            let entry = self
                .nodes
                .get(name)
                .ok_or_else(|| GraphError::UnknownNode(name.clone()))?;
            for field in &entry.writes {
                if let Some(existing) = seen.insert(field, name.as_str()) {
                    if existing != name.as_str() {
                        return Err(GraphError::ConflictingWrite((*field).to_string()));
                    }
                }
            }
            entries.push((name.clone(), entry));
        }

        let input_snapshot = state.snapshot();
        let mut handles = Vec::with_capacity(entries.len());
        for (name, entry) in &entries {
            let func = entry.func.clone();
            let branch_state = state.clone();
            let name = name.clone();
            let started = Instant::now();
            handles.push((
                name,
                started,
                tokio::spawn(async move { (func)(branch_state).await }),
            ));
        }

        let mut merged = state.clone();
        let mut first_error: Option<GraphError> = None;

        for ((name, started, handle), (_, entry)) in handles.into_iter().zip(entries.iter()) {
            if first_error.is_some() {
                // A sibling already failed; the rest of the fan-out is
                // cancelled rather than awaited to completion.
                handle.abort();
                continue;
            }
            let node_started = Utc::now();
            match handle.await {
                Ok(Ok(branch_result)) => {
                    let output_snapshot = branch_result.snapshot();
                    merged.apply_writes(&branch_result, &entry.writes);
                    merged.push_trace(TraceEntry::success(
                        name.clone(),
                        node_started,
                        started.elapsed().as_millis() as u64,
                        input_snapshot.clone(),
                        output_snapshot,
                    ));
                }
                Ok(Err(node_err)) => {
                    warn!(node = %name, error = %node_err, "parallel node failed");
                    merged.push_trace(TraceEntry::failure(
                        name.clone(),
                        node_started,
                        started.elapsed().as_millis() as u64,
                        input_snapshot.clone(),
                        node_err.0.clone(),
                    ));
                    if first_error.is_none() {
                        first_error = Some(GraphError::UnknownNode(format!(
                            "{name}: {node_err}"
                        )));
                    }
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        if first_error.is_none() {
                            first_error = Some(GraphError::Cancelled);
                        }
                    } else if first_error.is_none() {
                        first_error = Some(GraphError::UnknownNode(format!(
                            "{name}: task panicked"
                        )));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Clone, Default)]
    struct MockState {
        counter: u32,
        a: u32,
        b: u32,
        trace: Vec<TraceEntry>,
        iterations: u32,
        elapsed_ms: u64,
        success: bool,
        error: Option<String>,
        failed_node: Option<String>,
    }

    impl GraphState for MockState {
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
        }
        fn snapshot(&self) -> serde_json::Value {
            json!({ "counter": self.counter })
        }
        fn apply_writes(&mut self, other: &Self, fields: &[&'static str]) {
            for field in fields {
                match *field {
                    "a" => self.a = other.a,
                    "b" => self.b = other.b,
                    _ => {}
                }
            }
        }
    }

    fn bump(delta: u32) -> impl Fn(MockState) -> BoxFuture<'static, Result<MockState, NodeError>> + Send + Sync {
        move |mut s: MockState| {
            Box::pin(async move {
                s.counter += delta;
                Ok(s)
            })
        }
    }

    #[tokio::test]
    async fn runs_a_linear_graph_to_completion() {
        let graph = StateGraph::<MockState>::builder()
            .start("inc")
            .node("inc", bump(1))
            .edge("inc", Edge::Static(END.to_string()))
            .build()
            .unwrap();

        let result = graph.execute(MockState::default(), None).await;
        assert_eq!(result.counter, 1);
        assert_eq!(result.trace.len(), 1);
        assert_eq!(result.iterations, 1);
        assert!(result.error.is_none());
        assert!(result.success);
    }

    #[tokio::test]
    async fn conditional_edge_routes_on_state() {
        let graph = StateGraph::<MockState>::builder()
            .start("inc")
            .node("inc", bump(5))
            .edge(
                "inc",
                Edge::Conditional(Arc::new(|s: &MockState| {
                    if s.counter > 3 {
                        Some("high".to_string())
                    } else {
                        Some("low".to_string())
                    }
                })),
            )
            .node("high", bump(100))
            .edge("high", Edge::Static(END.to_string()))
            .node("low", bump(1))
            .edge("low", Edge::Static(END.to_string()))
            .build()
            .unwrap();

        let result = graph.execute(MockState::default(), None).await;
        assert_eq!(result.counter, 105);
    }

    #[tokio::test]
    async fn cyclic_graph_stops_at_iteration_cap() {
        let graph = StateGraph::<MockState>::builder()
            .iteration_cap(5)
            .start("loop")
            .node("loop", bump(1))
            .edge("loop", Edge::Static("loop".to_string()))
            .build()
            .unwrap();

        let result = graph.execute(MockState::default(), None).await;
        assert_eq!(result.iterations, 5);
        assert_eq!(result.counter, 5);
        assert_eq!(result.error.as_deref(), Some(GraphError::IterationCapExceeded.to_string().as_str()));
        assert!(!result.success);
    }

    #[tokio::test]
    async fn unknown_successor_node_fails_the_run() {
        let graph = StateGraph::<MockState>::builder()
            .start("inc")
            .node("inc", bump(1))
            .edge("inc", Edge::Static("does_not_exist".to_string()))
            .build()
            .unwrap();

        let result = graph.execute(MockState::default(), None).await;
        assert!(result.error.is_some());
        assert_eq!(result.failed_node.as_deref(), Some("does_not_exist"));
    }

    #[tokio::test]
    async fn node_failure_halts_the_run_and_keeps_partial_trace() {
        let graph = StateGraph::<MockState>::builder()
            .start("first")
            .node("first", bump(1))
            .edge("first", Edge::Static("boom".to_string()))
            .node("boom", |s: MockState| {
                Box::pin(async move {
                    let _ = s;
                    Err(NodeError::new("service unavailable"))
                })
            })
            .edge("boom", Edge::Static(END.to_string()))
            .build()
            .unwrap();

        let result = graph.execute(MockState::default(), None).await;
        assert_eq!(result.trace.len(), 2);
        assert!(!result.trace[1].success);
        assert_eq!(result.failed_node.as_deref(), Some("boom"));
        assert_eq!(result.error.as_deref(), Some("service unavailable"));
    }

    #[tokio::test]
    async fn parallel_fan_out_merges_disjoint_writes() {
        let graph = StateGraph::<MockState>::builder()
            .start("noop")
            .node("noop", |s: MockState| Box::pin(async move { Ok(s) }))
            .node_with_writes("write_a", vec!["a"], |mut s: MockState| {
                Box::pin(async move {
                    s.a = 7;
                    Ok(s)
                })
            })
            .node_with_writes("write_b", vec!["b"], |mut s: MockState| {
                Box::pin(async move {
                    s.b = 9;
                    Ok(s)
                })
            })
            .build()
            .unwrap();

        let merged = graph
            .execute_parallel(&["write_a".to_string(), "write_b".to_string()], MockState::default())
            .await
            .unwrap();
        assert_eq!(merged.a, 7);
        assert_eq!(merged.b, 9);
        assert_eq!(merged.trace.len(), 2);
    }

    #[tokio::test]
    async fn parallel_fan_out_rejects_conflicting_write_sets() {
        let graph = StateGraph::<MockState>::builder()
            .start("noop")
            .node("noop", |s: MockState| Box::pin(async move { Ok(s) }))
            .node_with_writes("write_a1", vec!["a"], |mut s: MockState| {
                Box::pin(async move {
                    s.a = 1;
                    Ok(s)
                })
            })
            .node_with_writes("write_a2", vec!["a"], |mut s: MockState| {
                Box::pin(async move {
                    s.a = 2;
                    Ok(s)
                })
            })
            .build()
            .unwrap();

        let err = graph
            .execute_parallel(&["write_a1".to_string(), "write_a2".to_string()], MockState::default())
            .await
            .unwrap_err();
        assert_eq!(err, GraphError::ConflictingWrite("a".to_string()));
    }

    #[test]
    fn builder_requires_a_start_edge() {
        let result = StateGraph::<MockState>::builder()
            .node("inc", bump(1))
            .build();
        assert!(matches!(result, Err(GraphError::MissingStart)));
    }
}
