//! Generic StateGraph runtime (component C of the agent orchestrator).
//!
//! This crate is deliberately domain-free: it drives any state type that
//! implements [`GraphState`] through a declared node/edge topology. The
//! concrete orchestration graph — intent parsing, memory retrieval, answer
//! generation, and so on — is assembled on top of this engine in the
//! `agent_orchestrator` crate.

pub mod client;
pub mod graph;
pub mod nodes;
pub mod registry;
pub mod state;
pub mod trace;

pub use client::{CallOptions, ClientError, ServiceClient, StreamEvent};
pub use graph::{Edge, GraphError, NodeError, NodeFn, StateGraph, StateGraphBuilder, END, START};
pub use registry::{
    Health, RegistryError, ServiceConfig, ServiceRecord, ServiceRegistry, ServiceUpdate, TrustLevel,
};
pub use state::{ConversationExchange, Intent, RunContext, WorkflowState};
pub use trace::{GraphState, ProgressEvent, ProgressSink, TraceEntry};
