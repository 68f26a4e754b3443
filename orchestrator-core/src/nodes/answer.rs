//! answer / validateAnswer: final response generation and its one
//! conditional retry loop (§4.D, §4.E).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::client::CallOptions;
use crate::graph::NodeError;
use crate::state::{AnswerMetadata, WorkflowState};

use super::NodeCtx;

#[derive(Deserialize, Default)]
struct AnswerResponse {
    answer: String,
    #[serde(default)]
    should_search_web: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    tokens: u32,
    #[serde(default)]
    duration_ms: u64,
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn bigrams(text: &str) -> HashSet<String> {
    let tokens: Vec<String> = text
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect();
    tokens.windows(2).map(|pair| pair.join(" ")).collect()
}

/// Word-overlap Jaccard similarity, boosted when the two texts also share a
/// two-word phrase — a plain word overlap undercounts an exact quoted term.
fn relevance(a: &str, b: &str) -> f32 {
    let wa = words(a);
    let wb = words(b);
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count() as f32;
    let union = wa.union(&wb).count() as f32;
    let jaccard = intersection / union;

    let shared_phrase = !bigrams(a).intersection(&bigrams(b)).collect::<HashSet<_>>().is_empty();
    if shared_phrase {
        (jaccard + 0.2).min(1.0)
    } else {
        jaccard
    }
}

/// Keeps the last `keep_last` turns unconditionally; older turns survive
/// only if they're still relevant to the current query (§4.D context-switch
/// handling — a topic change shouldn't drag stale history into the prompt).
fn filter_context_for_switch(history: &[String], query: &str, keep_last: usize, threshold: f32) -> Vec<String> {
    let split_at = history.len().saturating_sub(keep_last);
    let (older, recent) = history.split_at(split_at);
    let mut kept: Vec<String> = older
        .iter()
        .filter(|turn| relevance(turn, query) >= threshold)
        .cloned()
        .collect();
    kept.extend(recent.iter().cloned());
    kept
}

fn token_budget_for_intent(kind: &str) -> u32 {
    match kind {
        "command_execute" => 128,
        "screen_intelligence" => 512,
        "general_query" => 768,
        _ => 512,
    }
}

pub async fn answer(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    let query = state.query_message().to_string();
    let intent_kind = state
        .intent
        .as_ref()
        .map(|i| i.kind.clone())
        .unwrap_or_else(|| "general_query".to_string());

    let history = filter_context_for_switch(
        &state.conversation_history,
        &query,
        ctx.config.context_switch_keep_last,
        ctx.config.context_switch_relevance_threshold,
    );

    let memory_text: Vec<String> = state.filtered_memories.iter().map(|m| m.text.clone()).collect();
    let web_text: Vec<String> = state
        .context_docs
        .iter()
        .map(|d| format!("{}: {}", d.title, d.text))
        .collect();

    let payload = json!({
        "query": query,
        "history": history,
        "memories": memory_text,
        "web_context": web_text,
        "max_tokens": token_budget_for_intent(&intent_kind),
        "online": state.context.use_online_mode,
        "session_id": state.context.session_id,
    });

    let response = if state.streaming {
        generate_streaming(&ctx, &state, payload).await
    } else if state.context.use_online_mode {
        generate_blocking_online_then_local(&ctx, payload).await
    } else {
        ctx.client
            .call::<AnswerResponse>("intent_classifier", "general.answer", payload, CallOptions::once())
            .await
    };

    match response {
        Ok(response) => {
            state.answer = Some(response.answer);
            state.should_perform_web_search = response.should_search_web;
            state.validation_issues = response.issues;
            state.answer_metadata = Some(AnswerMetadata {
                model: response.model,
                tokens: response.tokens,
                duration_ms: response.duration_ms,
            });
        }
        Err(e) => {
            warn!(node = "answer", error = %e, "answer generation failed");
            state.answer = Some(
                "I ran into a problem generating a response just now. Could you try again?".to_string(),
            );
            state.validation_issues = vec!["generation_failed".to_string()];
        }
    }

    Ok(state)
}

/// Online mode: try the online LLM transport first, fall back to the local
/// one on any failure (§4.D).
async fn generate_blocking_online_then_local(
    ctx: &NodeCtx,
    payload: serde_json::Value,
) -> Result<AnswerResponse, crate::client::ClientError> {
    match ctx
        .client
        .call::<AnswerResponse>("online_llm", "generate", payload.clone(), CallOptions::once())
        .await
    {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(node = "answer", error = %e, "online LLM unavailable, falling back to local model");
            ctx.client
                .call::<AnswerResponse>("intent_classifier", "general.answer", payload, CallOptions::once())
                .await
        }
    }
}

async fn stream_once(
    ctx: &NodeCtx,
    state: &WorkflowState,
    service: &str,
    action: &str,
    payload: serde_json::Value,
) -> Result<String, crate::client::ClientError> {
    let buffer = Arc::new(Mutex::new(String::new()));
    let write_buffer = buffer.clone();
    let sink = state.on_stream_token.clone();

    ctx.client
        .call_stream(
            service,
            action,
            payload,
            move |token| {
                write_buffer.lock().unwrap().push_str(token);
                if let Some(sink) = &sink {
                    (sink.0)(token);
                }
            },
            |_event| {},
            std::time::Duration::from_secs(30),
            Some(state.cancellation.clone()),
        )
        .await?;

    Ok(buffer.lock().unwrap().clone())
}

/// Streams from the online transport first when `use_online_mode` is set,
/// falling back to the local stream on any failure (§4.D), then falls back
/// further to a blocking local call if the stream produced zero tokens.
async fn generate_streaming(
    ctx: &NodeCtx,
    state: &WorkflowState,
    payload: serde_json::Value,
) -> Result<AnswerResponse, crate::client::ClientError> {
    let streamed = if state.context.use_online_mode {
        match stream_once(ctx, state, "online_llm", "generate.stream", payload.clone()).await {
            Ok(text) => text,
            Err(e) => {
                warn!(node = "answer", error = %e, "online LLM stream unavailable, falling back to local model");
                stream_once(ctx, state, "intent_classifier", "general.answer.stream", payload.clone()).await?
            }
        }
    } else {
        stream_once(ctx, state, "intent_classifier", "general.answer.stream", payload.clone()).await?
    };

    if streamed.trim().is_empty() {
        warn!(node = "answer", "stream produced no tokens, falling back to a blocking call");
        return ctx
            .client
            .call::<AnswerResponse>("intent_classifier", "general.answer", payload, CallOptions::once())
            .await;
    }

    Ok(AnswerResponse {
        answer: streamed,
        ..Default::default()
    })
}

/// Distinguishes "the answer says it needs a web search" from any other
/// validation failure. The former always sets `should_perform_web_search`;
/// the latter only triggers a retry outside of streaming mode, since a
/// stream already delivered to the caller cannot be taken back.
pub async fn validate_answer(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    if state.should_perform_web_search {
        return Ok(state);
    }

    if state.answer.is_none() {
        state.validation_issues.push("missing_answer".to_string());
    }

    if !state.validation_issues.is_empty() && !state.streaming && state.retry_count < ctx.config.max_answer_retries {
        state.needs_retry = true;
        state.retry_count += 1;
    } else {
        state.needs_retry = false;
    }

    Ok(state)
}
