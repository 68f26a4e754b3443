//! Node Library (component D): the concrete nodes that make up the
//! orchestration graph. Each is a free `async fn(NodeCtx, WorkflowState) ->
//! Result<WorkflowState, NodeError>`, matching the `type NodeFn` signature
//! the engine drives.

mod answer;
mod coref;
mod intent;
mod memory;
mod web;

pub use answer::{answer, validate_answer};
pub use coref::resolve_references;
pub use intent::parse_intent;
pub use memory::{filter_memory, retrieve_memory, store_conversation, store_memory};
pub use web::{sanitize_web, web_search};

use std::sync::Arc;

use crate::client::ServiceClient;

/// Which of the two `resolveReferences` invocations this call represents
/// (§4.D: early improves downstream quality, late reacts to fresh context).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Early,
    Late,
}

/// Thresholds and caps a node reads from `OrchestratorConfig`, passed down
/// rather than read from global state.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub min_memory_similarity: f32,
    pub memory_search_limit: u32,
    pub memory_dedup_ratio: f32,
    pub memory_filter_threshold: f32,
    pub max_web_doc_chars: usize,
    pub max_answer_retries: u32,
    pub recent_history_limit: usize,
    pub context_switch_keep_last: usize,
    pub context_switch_relevance_threshold: f32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            min_memory_similarity: 0.35,
            memory_search_limit: 10,
            memory_dedup_ratio: 0.85,
            memory_filter_threshold: 0.70,
            max_web_doc_chars: 1000,
            max_answer_retries: 2,
            recent_history_limit: 5,
            context_switch_keep_last: 4,
            context_switch_relevance_threshold: 0.30,
        }
    }
}

/// Bundles what every node needs to reach the service layer, matching the
/// engine's `NodeFn` closure capture pattern.
#[derive(Clone)]
pub struct NodeCtx {
    pub client: Arc<ServiceClient>,
    pub config: NodeConfig,
}

impl NodeCtx {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self {
            client,
            config: NodeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }
}
