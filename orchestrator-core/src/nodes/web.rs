//! webSearch / sanitizeWeb: the online-mode research leg (§4.D).

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::client::CallOptions;
use crate::graph::NodeError;
use crate::state::{WebDocument, WorkflowState};

use super::NodeCtx;

#[derive(Deserialize, Default)]
struct WebSearchResponse {
    #[serde(default)]
    results: Vec<WebDocument>,
}

pub async fn web_search(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    let query = state.query_message().to_string();

    let result = ctx
        .client
        .call::<WebSearchResponse>(
            "web_search",
            "search",
            json!({ "query": query }),
            CallOptions::once(),
        )
        .await;

    state.context_docs = match result {
        Ok(response) => response.results,
        Err(e) => {
            warn!(node = "webSearch", error = %e, "web search unavailable, continuing without it");
            Vec::new()
        }
    };
    if !state.context_docs.is_empty() {
        state.retrieval_added_context = true;
    }

    Ok(state)
}

/// Drops empty results and truncates each document's body to
/// `max_web_doc_chars` so a single oversized page can't blow the answer
/// node's context budget.
pub async fn sanitize_web(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    let limit = ctx.config.max_web_doc_chars;
    state.context_docs.retain(|doc| !doc.text.trim().is_empty());
    for doc in state.context_docs.iter_mut() {
        if doc.text.chars().count() > limit {
            doc.text = doc.text.chars().take(limit).collect();
        }
    }
    Ok(state)
}
