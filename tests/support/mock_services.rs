//! A tiny axum stand-in for the five core microservices, used to exercise
//! the orchestrator over real HTTP rather than in-process mocks (the
//! `ServiceClient` speaks HTTP, so nothing short of that proves the wire
//! contract). One `Router` per test, one route per declared action,
//! matching `server.rs`'s `Router::new().route(path, post(handler))` shape
//! upstream.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use orchestrator_core::registry::{ServiceRegistry, ServiceUpdate};

/// Binds `router` to an ephemeral local port and returns the base URL a
/// `ServiceRecord::endpoint` can point at, plus the server task's handle so
/// the caller can let it run for the test's lifetime (dropping the handle
/// aborts it).
pub async fn spawn(router: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), handle)
}

/// Points an already-registered core service at `router`'s fresh endpoint.
pub async fn mount(registry: &Arc<ServiceRegistry>, service: &str, router: Router) -> tokio::task::JoinHandle<()> {
    let (endpoint, handle) = spawn(router).await;
    registry
        .update(
            service,
            ServiceUpdate {
                endpoint: Some(endpoint),
                ..Default::default()
            },
        )
        .await
        .expect("service is a seeded core service");
    handle
}

/// A route whose handler always returns the same canned JSON body,
/// regardless of the request payload.
pub fn canned(path: &str, body: Value) -> (String, axum::routing::MethodRouter) {
    let route = post(move || {
        let body = body.clone();
        async move { Json(body) }
    });
    (path.to_string(), route)
}

pub fn router_from(routes: Vec<(String, axum::routing::MethodRouter)>) -> Router {
    let mut router = Router::new();
    for (path, method_router) in routes {
        router = router.route(&path, method_router);
    }
    router
}

/// A handler that records every request body it sees into `sink`, then
/// replies with `body`.
pub fn recording(
    path: &str,
    sink: Arc<tokio::sync::Mutex<Vec<Value>>>,
    body: Value,
) -> (String, axum::routing::MethodRouter) {
    let route = post(move |Json(payload): Json<Value>| {
        let sink = sink.clone();
        let body = body.clone();
        async move {
            sink.lock().await.push(payload);
            Json(body)
        }
    });
    (path.to_string(), route)
}

/// A handler that computes its reply from the request payload — for tests
/// where the response has to reflect something the caller sent (e.g.
/// echoing back a piece of conversation history).
pub fn custom<F>(path: &str, handler: F) -> (String, axum::routing::MethodRouter)
where
    F: Fn(Value) -> Value + Clone + Send + Sync + 'static,
{
    let route = post(move |Json(payload): Json<Value>| {
        let handler = handler.clone();
        async move { Json(handler(payload)) }
    });
    (path.to_string(), route)
}

/// A handler that replies with a `text/event-stream` body emitting one
/// `data: {"token": ...}` frame per entry in `tokens`, terminated with
/// `data: [DONE]`, for exercising `ServiceClient::call_stream`.
pub fn sse(path: &str, tokens: Vec<&'static str>) -> (String, axum::routing::MethodRouter) {
    let tokens: Vec<String> = tokens.into_iter().map(|t| t.to_string()).collect();
    let route = post(move || {
        let tokens = tokens.clone();
        async move {
            let mut body = String::new();
            for t in &tokens {
                body.push_str(&format!("data: {}\n\n", serde_json::json!({ "token": t })));
            }
            body.push_str("data: [DONE]\n\n");
            Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(Body::from(body))
                .unwrap()
        }
    });
    (path.to_string(), route)
}

/// A handler whose reply depends on how many times it has already been
/// called (scenario 4's "answer once, then answer again after web search").
pub fn sequenced(
    path: &str,
    counter: Arc<std::sync::atomic::AtomicU32>,
    replies: Vec<Value>,
) -> (String, axum::routing::MethodRouter) {
    let replies = Arc::new(replies);
    let route = post(move || {
        let counter = counter.clone();
        let replies = replies.clone();
        async move {
            let call = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) as usize;
            let reply = replies.get(call).or_else(|| replies.last()).cloned().unwrap_or(Value::Null);
            Json(reply)
        }
    });
    (path.to_string(), route)
}
