//! Trace and generic state bookkeeping for the StateGraph engine.
//!
//! The engine itself is domain-agnostic: it only needs enough of a state
//! type to append trace entries and record run-level bookkeeping. Concrete
//! orchestration graphs (the intent-routed graph in `agent_orchestrator`)
//! supply the rest of the fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node invocation recorded during a run.
///
/// Snapshots are deliberately summary-level (counts, booleans, short tags)
/// and are built by the node itself — never a blanket dump of the state —
/// so that raw prompts or credentials can never end up in a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub input_snapshot: Value,
    pub output_snapshot: Value,
    pub success: bool,
    pub error: Option<String>,
    pub from_cache: bool,
}

impl TraceEntry {
    pub fn success(
        node: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        input_snapshot: Value,
        output_snapshot: Value,
    ) -> Self {
        Self {
            node: node.into(),
            started_at,
            duration_ms,
            input_snapshot,
            output_snapshot,
            success: true,
            error: None,
            from_cache: false,
        }
    }

    pub fn failure(
        node: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        input_snapshot: Value,
        error: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            started_at,
            duration_ms,
            input_snapshot,
            output_snapshot: Value::Null,
            success: false,
            error: Some(error.into()),
            from_cache: false,
        }
    }
}

/// Minimal contract the engine needs from a workflow state type.
///
/// Implemented once by the concrete `WorkflowState` in `agent_orchestrator`;
/// the engine never reaches into domain fields (intent, memories, ...)
/// directly.
pub trait GraphState: Clone + Send + Sync + 'static {
    /// Append one trace entry. Must never reorder or drop entries.
    fn push_trace(&mut self, entry: TraceEntry);

    /// Number of node transitions made so far this run.
    fn iterations(&self) -> u32;
    fn set_iterations(&mut self, n: u32);

    fn set_elapsed_ms(&mut self, ms: u64);

    /// Mark the run as failed at `node` with `error`, leaving all other
    /// already-accumulated fields intact (partial results are kept).
    fn set_failure(&mut self, node: &str, error: String);

    /// Mark the run as successfully completed.
    fn mark_success(&mut self);

    /// Summarize this state for a trace entry's input/output snapshot.
    /// Called by the engine immediately before and after a node runs.
    fn snapshot(&self) -> Value;

    /// Copy only the named fields from `other` into `self`. Used by
    /// `execute_parallel` to merge disjoint writes from concurrently run
    /// nodes back into one state. Unknown field names are a no-op.
    fn apply_writes(&mut self, other: &Self, fields: &[&'static str]);
}

/// Lifecycle events surfaced during `call_stream`-backed nodes and exposed
/// to callers of `Orchestrator::process`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Start { node: String },
    Done { node: String },
    Error { node: String, message: String },
}

/// A progress sink the engine (or a node) can push lifecycle events to.
/// Delivery is serialized per run and never reordered.
pub type ProgressSink = std::sync::Arc<dyn Fn(ProgressEvent) + Send + Sync>;
