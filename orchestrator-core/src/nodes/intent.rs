//! parseIntent: classifies the original `message` (never `resolvedMessage`
//! — coreference can corrupt demonstratives pointing at screen content).

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::client::CallOptions;
use crate::graph::NodeError;
use crate::state::{Intent, WorkflowState};

use super::NodeCtx;

#[derive(Deserialize)]
struct ClassifierResponse {
    intent: String,
    confidence: f32,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    requires_memory: bool,
    suggested_response: Option<String>,
}

/// High-confidence patterns the classifier is known to miss. Checked before
/// delegating, unless a highlighted-text marker is present.
fn pre_check(message: &str) -> Option<Intent> {
    let lower = message.to_lowercase();
    let trimmed = lower.trim();

    let imperative_open_close = ["open ", "close "]
        .iter()
        .any(|verb| trimmed.starts_with(verb));
    if imperative_open_close {
        return Some(Intent {
            kind: "command_execute".to_string(),
            confidence: 0.95,
            entities: Vec::new(),
            requires_memory: false,
            suggested_response: None,
        });
    }

    if trimmed.starts_with("goto ") && trimmed.contains(" and ") {
        return Some(Intent {
            kind: "command_execute".to_string(),
            confidence: 0.9,
            entities: Vec::new(),
            requires_memory: false,
            suggested_response: None,
        });
    }

    let screen_phrasings = [
        "what's on my screen",
        "what is on my screen",
        "what do you see",
        "analyze my screen",
        "analyze the screen",
    ];
    if screen_phrasings.iter().any(|p| trimmed.contains(p)) {
        return Some(Intent {
            kind: "screen_intelligence".to_string(),
            confidence: 0.9,
            entities: Vec::new(),
            requires_memory: false,
            suggested_response: None,
        });
    }

    None
}

fn is_follow_up_to_screen_intelligence(recent_history: &[String]) -> bool {
    recent_history
        .last()
        .map(|last| last.to_lowercase().contains("screen_intelligence"))
        .unwrap_or(false)
}

pub async fn parse_intent(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    let recent: Vec<String> = state
        .conversation_history
        .iter()
        .rev()
        .take(ctx.config.recent_history_limit)
        .rev()
        .cloned()
        .collect();

    debug!(node = "parseIntent", session_id = %state.context.session_id, "classifying message");

    let highlighted = state.context.highlighted_text.is_some();

    if !highlighted {
        if let Some(intent) = pre_check(&state.message) {
            state.intent = Some(intent);
            return Ok(state);
        }
        if is_follow_up_to_screen_intelligence(&recent) {
            state.intent = Some(Intent {
                kind: "screen_intelligence".to_string(),
                confidence: 0.8,
                entities: Vec::new(),
                requires_memory: false,
                suggested_response: None,
            });
            return Ok(state);
        }
    }

    let payload = json!({
        "message": state.message,
        "session_id": state.context.session_id,
        "user_id": state.context.user_id,
        "conversation_history": recent,
    });

    match ctx
        .client
        .call::<ClassifierResponse>("intent_classifier", "intent.parse", payload, CallOptions::once())
        .await
    {
        Ok(response) => {
            state.intent = Some(Intent {
                kind: response.intent,
                confidence: response.confidence,
                entities: response.entities,
                requires_memory: response.requires_memory,
                suggested_response: response.suggested_response,
            });
        }
        Err(e) => {
            warn!(node = "parseIntent", error = %e, "classifier unavailable, defaulting to general_query");
            state.intent = Some(Intent {
                kind: "general_query".to_string(),
                confidence: 0.0,
                entities: Vec::new(),
                requires_memory: true,
                suggested_response: None,
            });
        }
    }

    Ok(state)
}
