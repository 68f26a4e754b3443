//! resolveReferences: pronoun/demonstrative resolution, invoked twice per
//! run (early, before intent parsing; late, after retrieval).

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::client::CallOptions;
use crate::graph::NodeError;
use crate::state::WorkflowState;

use super::{NodeCtx, Phase};

#[derive(Deserialize)]
struct ResolveResponse {
    resolved_message: String,
    #[serde(default)]
    #[allow(dead_code)]
    replacements: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    method: Option<String>,
}

pub async fn resolve_references(
    ctx: NodeCtx,
    mut state: WorkflowState,
    phase: Phase,
) -> Result<WorkflowState, NodeError> {
    // Late resolution is skipped when the early call already produced a
    // resolution and no new retrieval context was added (§4.D).
    if phase == Phase::Late && state.coreference_resolved_early && !state.retrieval_added_context {
        debug!(node = "resolveReferences", phase = ?phase, "skipped: no new context since early resolution");
        return Ok(state);
    }

    let history = if let Some(highlight) = &state.context.highlighted_text {
        // A synthetic one-message history wrapping the highlight, not the
        // real conversation history.
        vec![highlight.clone()]
    } else {
        state.conversation_history.clone()
    };

    let payload = json!({
        "message": state.message,
        "conversation_history": history,
        "options": { "phase": if phase == Phase::Early { "early" } else { "late" } },
    });

    match ctx
        .client
        .call::<ResolveResponse>("coreference_resolver", "resolve", payload, CallOptions::once())
        .await
    {
        Ok(response) => {
            state.resolved_message = Some(response.resolved_message);
            if phase == Phase::Early {
                state.coreference_resolved_early = true;
            }
        }
        Err(e) => {
            warn!(node = "resolveReferences", phase = ?phase, error = %e, "falling back to original message");
            if state.resolved_message.is_none() {
                state.resolved_message = Some(state.message.clone());
            }
        }
    }

    Ok(state)
}
