//! Service Client (component B): the uniform invocation primitive nodes use
//! to reach microservices resolved through the [`ServiceRegistry`].

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::registry::{Health, RegistryError, ServiceRegistry};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unknown service '{0}'")]
    ServiceUnknown(String),
    #[error("service '{0}' is disabled")]
    ServiceDisabled(String),
    #[error("action '{action}' not allowed on service '{service}'")]
    ActionNotAllowed { service: String, action: String },
    #[error("action '{action}' on untrusted service '{service}' is sensitive and requires caller opt-in")]
    SensitiveActionNotOptedIn { service: String, action: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("call to {service}::{action} failed: {cause}")]
    ServiceCallFailed {
        service: String,
        action: String,
        cause: String,
    },
    #[error("call timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Default, Clone, Copy)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub attempts: u32,
    pub idempotent: bool,
    /// Explicit caller opt-in to invoke a sensitive action (§3's
    /// `SENSITIVE_ACTIONS`) on an untrusted service. Defaults to `false`.
    pub allow_sensitive: bool,
}

impl CallOptions {
    pub fn once() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            attempts: 1,
            idempotent: false,
            allow_sensitive: false,
        }
    }

    /// Same as [`Self::once`] but with sensitive-action opt-in set.
    pub fn once_allow_sensitive() -> Self {
        Self {
            allow_sensitive: true,
            ..Self::once()
        }
    }
}

pub struct ServiceClient {
    registry: Arc<ServiceRegistry>,
    http: reqwest::Client,
}

impl ServiceClient {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
        }
    }

    async fn resolve(&self, service: &str, action: &str, allow_sensitive: bool) -> Result<String, ClientError> {
        let record = self
            .registry
            .get(service)
            .await
            .ok_or_else(|| ClientError::ServiceUnknown(service.to_string()))?;

        if !record.enabled {
            return Err(ClientError::ServiceDisabled(service.to_string()));
        }
        if !self.registry.is_action_allowed(service, action, allow_sensitive).await? {
            if ServiceRegistry::is_sensitive(action) && !record.trusted && !allow_sensitive {
                return Err(ClientError::SensitiveActionNotOptedIn {
                    service: service.to_string(),
                    action: action.to_string(),
                });
            }
            return Err(ClientError::ActionNotAllowed {
                service: service.to_string(),
                action: action.to_string(),
            });
        }
        Ok(record.endpoint)
    }

    /// Invoke `action` on `service` with `payload`, retrying with
    /// exponential backoff up to `options.attempts` times. Never retries an
    /// `ActionNotAllowed`/`InvalidPayload` failure, matching §4.B.
    pub async fn call<T: DeserializeOwned>(
        &self,
        service: &str,
        action: &str,
        payload: Value,
        options: CallOptions,
    ) -> Result<T, ClientError> {
        let endpoint = self.resolve(service, action, options.allow_sensitive).await?;
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), action);
        let credential = self.registry.decrypt_credential(service).await?;

        let attempts = options.attempts.max(1);
        let timeout = options.timeout.unwrap_or(Duration::from_secs(30));
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let start = std::time::Instant::now();
            let mut request = self.http.post(&url).json(&payload).timeout(timeout);
            if let Some(token) = &credential {
                request = request.bearer_auth(token);
            }

            let outcome = request.send().await;
            let latency_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => match response.json::<Value>().await {
                        Ok(body) => {
                            let _ = self.registry.record_call(service, true, latency_ms).await;
                            let data = body.get("data").cloned().unwrap_or(body);
                            return serde_json::from_value(data)
                                .map_err(|e| ClientError::InvalidPayload(e.to_string()));
                        }
                        Err(e) => {
                            last_error = e.to_string();
                        }
                    },
                    Err(e) => {
                        last_error = e.to_string();
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            let _ = self.registry.record_call(service, false, latency_ms).await;

            let is_last_attempt = attempt + 1 >= attempts;
            if is_last_attempt || !options.idempotent {
                break;
            }
            let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
            tokio::time::sleep(backoff).await;
        }

        Err(ClientError::ServiceCallFailed {
            service: service.to_string(),
            action: action.to_string(),
            cause: last_error,
        })
    }

    /// Invoke a streaming action. Tokens are delivered through `on_token`,
    /// lifecycle events through `on_progress`; both are plain `Fn` callbacks
    /// invoked in order, matching `OpenAICompatibleProvider::generate_stream`'s
    /// `bytes_stream()`/SSE-frame idiom.
    pub async fn call_stream(
        &self,
        service: &str,
        action: &str,
        mut payload: Value,
        on_token: impl Fn(&str) + Send + Sync,
        on_progress: impl Fn(StreamEvent) + Send + Sync,
        timeout: Duration,
        cancellation: Option<CancellationToken>,
    ) -> Result<(), ClientError> {
        let endpoint = self.resolve(service, action, false).await?;
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), action);
        let credential = self.registry.decrypt_credential(service).await?;

        if let Some(obj) = payload.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(true));
        }

        on_progress(StreamEvent::Start);
        let start = std::time::Instant::now();

        let mut request = self.http.post(&url).json(&payload);
        if let Some(token) = &credential {
            request = request.bearer_auth(token);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::ServiceCallFailed {
                service: service.to_string(),
                action: action.to_string(),
                cause: e.to_string(),
            })?;

        let mut stream = response.bytes_stream();
        loop {
            if let Some(token) = &cancellation {
                if token.is_cancelled() {
                    on_progress(StreamEvent::Error("cancelled".to_string()));
                    return Err(ClientError::Cancelled);
                }
            }

            let next = tokio::time::timeout(timeout, stream.next()).await;
            let chunk = match next {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(e))) => {
                    on_progress(StreamEvent::Error(e.to_string()));
                    let _ = self
                        .registry
                        .record_call(service, false, start.elapsed().as_millis() as u64)
                        .await;
                    return Err(ClientError::ServiceCallFailed {
                        service: service.to_string(),
                        action: action.to_string(),
                        cause: e.to_string(),
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    on_progress(StreamEvent::Error("timeout".to_string()));
                    return Err(ClientError::Timeout);
                }
            };

            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                if let Some(data) = line.strip_prefix("data: ") {
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(json) = serde_json::from_str::<Value>(data) {
                        if let Some(token_text) = json
                            .get("token")
                            .or_else(|| json.pointer("/choices/0/delta/content"))
                            .and_then(|v| v.as_str())
                        {
                            on_token(token_text);
                        }
                    }
                }
            }
        }

        let _ = self
            .registry
            .record_call(service, true, start.elapsed().as_millis() as u64)
            .await;
        on_progress(StreamEvent::Done);
        Ok(())
    }

    /// Probe every enabled service; never propagates a transport error — a
    /// failed probe simply becomes `Health::Unhealthy` in the map.
    pub async fn health_check_all(&self) -> std::collections::HashMap<String, Health> {
        let services = self.registry.list_enabled().await;
        let checks = services.into_iter().map(|record| {
            let http = self.http.clone();
            let registry = self.registry.clone();
            async move {
                let url = format!("{}/health", record.endpoint.trim_end_matches('/'));
                let result = tokio::time::timeout(Duration::from_secs(5), http.get(&url).send()).await;
                let status = match result {
                    Ok(Ok(response)) if response.status().is_success() => Health::Healthy,
                    Ok(Ok(_)) => Health::Degraded,
                    Ok(Err(e)) => {
                        warn!(service = %record.name, error = %e, "health probe transport error");
                        Health::Unhealthy
                    }
                    Err(_) => Health::Unknown,
                };
                let _ = registry.record_health(&record.name, status, None, None).await;
                (record.name, status)
            }
        });

        futures::future::join_all(checks).await.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start,
    Done,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ServiceConfig, TrustLevel};
    use tempfile::tempdir;

    async fn registry_with_service(endpoint: String) -> (Arc<ServiceRegistry>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let catalog = dir.path().join("catalog.json");
        let registry = Arc::new(ServiceRegistry::new(catalog, [9u8; 32]).await.unwrap());
        registry
            .register(ServiceConfig {
                name: "echo".to_string(),
                display_name: "Echo".to_string(),
                endpoint,
                credential: None,
                declared_actions: vec!["ping".to_string()],
                version: "1.0.0".to_string(),
                trust_level: TrustLevel::Trusted,
                allowed_actions: None,
                rate_limit_per_minute: None,
                core: false,
            })
            .await
            .unwrap();
        (registry, dir)
    }

    #[tokio::test]
    async fn unknown_service_fails_fast() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(
            ServiceRegistry::new(dir.path().join("catalog.json"), [1u8; 32])
                .await
                .unwrap(),
        );
        let client = ServiceClient::new(registry);
        let err = client
            .call::<Value>("nope", "ping", serde_json::json!({}), CallOptions::once())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ServiceUnknown(_)));
    }

    #[tokio::test]
    async fn action_outside_declared_actions_is_rejected() {
        let (registry, _dir) = registry_with_service("http://127.0.0.1:1".to_string()).await;
        let client = ServiceClient::new(registry);
        let err = client
            .call::<Value>("echo", "not_declared", serde_json::json!({}), CallOptions::once())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ActionNotAllowed { .. }));
    }

    #[tokio::test]
    async fn sensitive_action_on_untrusted_service_is_rejected_by_the_client() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(ServiceRegistry::new(dir.path().join("catalog.json"), [5u8; 32]).await.unwrap());
        registry
            .register(ServiceConfig {
                name: "untrusted".to_string(),
                display_name: "Untrusted".to_string(),
                endpoint: "http://127.0.0.1:1".to_string(),
                credential: None,
                declared_actions: vec!["memory.delete".to_string()],
                version: "1.0.0".to_string(),
                trust_level: TrustLevel::AskOnce,
                allowed_actions: None,
                rate_limit_per_minute: None,
                core: false,
            })
            .await
            .unwrap();

        let client = ServiceClient::new(registry);
        let err = client
            .call::<Value>("untrusted", "memory.delete", serde_json::json!({}), CallOptions::once())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::SensitiveActionNotOptedIn { .. }));
    }

    #[tokio::test]
    async fn disabled_service_is_rejected() {
        let (registry, _dir) = registry_with_service("http://127.0.0.1:1".to_string()).await;
        registry
            .update(
                "echo",
                crate::registry::ServiceUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let client = ServiceClient::new(registry);
        let err = client
            .call::<Value>("echo", "ping", serde_json::json!({}), CallOptions::once())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ServiceDisabled(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_service_call_failed() {
        let (registry, _dir) = registry_with_service("http://127.0.0.1:1".to_string()).await;
        let client = ServiceClient::new(registry);
        let err = client
            .call::<Value>("echo", "ping", serde_json::json!({}), CallOptions::once())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ServiceCallFailed { .. }));
    }

    #[tokio::test]
    async fn health_check_all_never_panics_on_unreachable_services() {
        let (registry, _dir) = registry_with_service("http://127.0.0.1:1".to_string()).await;
        let client = ServiceClient::new(registry);
        let statuses = client.health_check_all().await;
        assert_eq!(statuses.get("echo"), Some(&Health::Unhealthy));
    }

    #[test]
    fn call_options_once_has_no_retry() {
        let options = CallOptions::once();
        assert_eq!(options.attempts, 1);
        assert!(!options.idempotent);
    }
}
