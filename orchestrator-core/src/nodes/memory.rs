//! retrieveMemory / filterMemory / storeMemory / storeConversation: the
//! long-term and session-scoped memory surface (§4.D).

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::client::CallOptions;
use crate::graph::NodeError;
use crate::state::{MemoryRecord, WorkflowState};

use super::NodeCtx;

#[derive(Deserialize, Default)]
struct MemorySearchResponse {
    #[serde(default)]
    results: Vec<MemoryRecord>,
}

#[derive(Deserialize, Default)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<String>,
}

#[derive(Deserialize, Default)]
struct SessionContextResponse {
    #[serde(default)]
    facts: Vec<String>,
}

#[derive(Deserialize, Default)]
struct EntityListResponse {
    #[serde(default)]
    entities: Vec<String>,
}

#[derive(Deserialize)]
struct StoreMemoryResponse {
    memory_id: String,
}

/// Questions about the assistant itself, or about the current conversation
/// rather than anything a user would have told it in the past; searching
/// long-term memory for these only wastes a round trip since the answer
/// lives in the session's own history, not the memory store.
fn is_meta_question(message: &str) -> bool {
    let lower = message.to_lowercase();
    let patterns = [
        "what can you do",
        "who are you",
        "what are you",
        "what is your name",
        "how do you work",
        "what model are you",
        "what did i just say",
        "what did i say",
        "what did i just ask",
        "repeat what i said",
        "what was i just talking about",
    ];
    patterns.iter().any(|p| lower.contains(p))
}

/// Two memories are the same fact phrased differently when their normalized
/// Levenshtein similarity clears `dedup_ratio`; the higher-similarity copy
/// survives.
fn dedup_memories(mut memories: Vec<MemoryRecord>, dedup_ratio: f32) -> Vec<MemoryRecord> {
    memories.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
    let mut kept: Vec<MemoryRecord> = Vec::new();
    for candidate in memories {
        let is_duplicate = kept
            .iter()
            .any(|existing| strsim::normalized_levenshtein(&existing.text, &candidate.text) as f32 >= dedup_ratio);
        if !is_duplicate {
            kept.push(candidate);
        }
    }
    kept
}

pub async fn retrieve_memory(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    let query = state.query_message().to_string();
    let session_id = state.context.session_id.clone();

    let history_call = ctx.client.call::<MessageListResponse>(
        "conversation_store",
        "message.list",
        json!({ "session_id": session_id }),
        CallOptions::once(),
    );
    let facts_call = ctx.client.call::<SessionContextResponse>(
        "conversation_store",
        "context.get",
        json!({ "session_id": session_id }),
        CallOptions::once(),
    );
    let entities_call = ctx.client.call::<EntityListResponse>(
        "conversation_store",
        "entity.list",
        json!({ "session_id": session_id }),
        CallOptions::once(),
    );

    let (history, facts, entities) = tokio::join!(history_call, facts_call, entities_call);

    state.conversation_history = history
        .map(|r| {
            // `message.list` returns newest-first; downstream consumers
            // (parseIntent's follow-up check, answer.rs's context-switch
            // filter) expect chronological order.
            let mut messages = r.messages;
            messages.reverse();
            messages
        })
        .unwrap_or_else(|e| {
            warn!(node = "retrieveMemory", error = %e, "conversation history unavailable");
            Vec::new()
        });
    state.session_facts = facts.map(|r| r.facts).unwrap_or_else(|e| {
        warn!(node = "retrieveMemory", error = %e, "session facts unavailable");
        Vec::new()
    });
    state.session_entities = entities.map(|r| r.entities).unwrap_or_else(|e| {
        warn!(node = "retrieveMemory", error = %e, "session entities unavailable");
        Vec::new()
    });

    if is_meta_question(&query) {
        state.memories = Vec::new();
        return Ok(state);
    }

    let search = ctx
        .client
        .call::<MemorySearchResponse>(
            "long_term_memory",
            "memory.search",
            json!({
                "query": query,
                "user_id": state.context.user_id,
                "limit": ctx.config.memory_search_limit,
                "min_similarity": ctx.config.min_memory_similarity,
            }),
            CallOptions::once(),
        )
        .await;

    let memories = match search {
        Ok(response) => response.results,
        Err(e) => {
            warn!(node = "retrieveMemory", error = %e, "long-term memory unavailable");
            Vec::new()
        }
    };

    let floored: Vec<MemoryRecord> = memories
        .into_iter()
        .filter(|m| m.similarity >= ctx.config.min_memory_similarity)
        .collect();

    state.memories = dedup_memories(floored, ctx.config.memory_dedup_ratio);
    if !state.memories.is_empty() {
        state.retrieval_added_context = true;
    }
    Ok(state)
}

pub async fn filter_memory(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    let before = state.memories.len();
    state.filtered_memories = state
        .memories
        .iter()
        .filter(|m| m.similarity >= ctx.config.memory_filter_threshold)
        .cloned()
        .collect();
    state.memories_filtered = before - state.filtered_memories.len();
    Ok(state)
}

/// Only reachable from the `memory_store` subgraph entry point, not the
/// conversational path.
pub async fn store_memory(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    let text = state.query_message().to_string();
    let entities = state
        .intent
        .as_ref()
        .map(|i| i.entities.clone())
        .unwrap_or_default();
    let tags = vec![state
        .intent
        .as_ref()
        .map(|i| i.kind.clone())
        .unwrap_or_else(|| "memory_store".to_string())];

    let result = ctx
        .client
        .call::<StoreMemoryResponse>(
            "long_term_memory",
            "memory.store",
            json!({
                "text": text,
                "tags": tags,
                "entities": entities,
                "metadata": {
                    "session_id": state.context.session_id,
                    "user_id": state.context.user_id,
                },
            }),
            CallOptions::once(),
        )
        .await;

    match result {
        Ok(response) => {
            state.memory_id = Some(response.memory_id);
            state.memory_stored = true;
            state.answer = Some("Got it, I'll remember that.".to_string());
        }
        Err(e) => {
            warn!(node = "storeMemory", error = %e, "failed to persist memory");
            state.answer = Some("I couldn't save that just now.".to_string());
        }
    }

    Ok(state)
}

/// Records the (user, assistant) exchange. A storage failure here is logged
/// and swallowed — it must never fail a run that already produced an
/// answer.
pub async fn store_conversation(ctx: NodeCtx, mut state: WorkflowState) -> Result<WorkflowState, NodeError> {
    let Some(answer) = state.answer.clone() else {
        return Ok(state);
    };

    let mut entities: Vec<String> = state
        .session_entities
        .iter()
        .chain(state.intent.as_ref().map(|i| i.entities.iter()).into_iter().flatten())
        .map(|e| e.to_lowercase())
        .collect();
    entities.sort();
    entities.dedup();

    let result = ctx
        .client
        .call::<serde_json::Value>(
            "conversation_store",
            "message.add",
            json!({
                "session_id": state.context.session_id,
                "user_message": state.message,
                "assistant_answer": answer,
                "entities": entities,
            }),
            CallOptions::once(),
        )
        .await;

    match result {
        Ok(_) => state.conversation_stored = true,
        Err(e) => warn!(node = "storeConversation", error = %e, "failed to persist exchange"),
    }

    Ok(state)
}
