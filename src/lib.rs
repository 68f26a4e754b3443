//! Agent Orchestrator: wires the generic StateGraph engine and node
//! library from `orchestrator-core` into the concrete orchestration graph
//! (component E), plus process-level configuration.

pub mod config;
pub mod orchestrator;

pub use config::OrchestratorConfig;
pub use orchestrator::{
    ActionResult, HealthReport, Orchestrator, OrchestratorError, ProcessResult, RunTrace, TraceQuery,
};

pub use orchestrator_core::registry::{ServiceConfig, ServiceRegistry, TrustLevel};
pub use orchestrator_core::state::RunContext;
