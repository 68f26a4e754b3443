//! Service Registry (component A): persistent catalog of microservices the
//! orchestrator can reach, their credentials, trust level, health and
//! rolling call statistics.
//!
//! Credentials are encrypted at rest with AES-256-GCM; the catalog itself is
//! a flat JSON file, loaded into an in-memory cache on construction and
//! rewritten on every mutation, mirroring `VectorMemory`'s cache-then-persist
//! approach.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter as GovernorLimiter};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const CORE_SERVICES: &[&str] = &[
    "intent_classifier",
    "coreference_resolver",
    "long_term_memory",
    "conversation_store",
    "web_search",
];

pub const SENSITIVE_ACTIONS: &[&str] = &[
    "memory.store",
    "memory.delete",
    "file.write",
    "system.execute",
];

type DirectLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service '{0}' already registered")]
    AlreadyExists(String),
    #[error("service '{0}' not found")]
    NotFound(String),
    #[error("'{0}' is a core service and cannot be modified this way")]
    ProtectedCore(String),
    #[error("credential encryption/decryption failed: {0}")]
    Crypto(String),
    #[error("persistence error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    AskOnce,
    AskAlways,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub at: DateTime<Utc>,
    pub status: Health,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Credential ciphertext, never the plaintext. A manual `Debug` impl on
/// `ServiceRecord` redacts this entirely.
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptedCredential {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub display_name: String,
    pub endpoint: String,
    pub credential: Option<EncryptedCredential>,
    pub declared_actions: Vec<String>,
    pub version: String,
    pub trusted: bool,
    pub trust_level: TrustLevel,
    pub allowed_actions: Option<Vec<String>>,
    pub rate_limit_per_minute: Option<u32>,
    pub enabled: bool,
    pub core: bool,
    pub health: Health,
    pub consecutive_failures: u32,
    pub stats: CallStats,
    #[serde(default)]
    pub health_history: Vec<HealthEvent>,
}

impl std::fmt::Debug for ServiceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRecord")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("trust_level", &self.trust_level)
            .field("enabled", &self.enabled)
            .field("core", &self.core)
            .field("health", &self.health)
            .finish()
    }
}

/// Fields a caller may update via `ServiceRegistry::update`. `None` leaves
/// the field untouched.
#[derive(Default)]
pub struct ServiceUpdate {
    pub display_name: Option<String>,
    pub endpoint: Option<String>,
    pub credential: Option<String>,
    pub declared_actions: Option<Vec<String>>,
    pub trust_level: Option<TrustLevel>,
    pub allowed_actions: Option<Vec<String>>,
    pub rate_limit_per_minute: Option<u32>,
    pub enabled: Option<bool>,
}

pub struct ServiceConfig {
    pub name: String,
    pub display_name: String,
    pub endpoint: String,
    pub credential: Option<String>,
    pub declared_actions: Vec<String>,
    pub version: String,
    pub trust_level: TrustLevel,
    pub allowed_actions: Option<Vec<String>>,
    pub rate_limit_per_minute: Option<u32>,
    pub core: bool,
}

struct Cipher {
    cipher: Aes256Gcm,
}

impl Cipher {
    fn new(key_bytes: [u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    fn encrypt(&self, plaintext: &str) -> Result<EncryptedCredential, RegistryError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| RegistryError::Crypto(e.to_string()))?;
        Ok(EncryptedCredential {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    fn decrypt(&self, encrypted: &EncryptedCredential) -> Result<String, RegistryError> {
        let nonce = Nonce::from_slice(&encrypted.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, encrypted.ciphertext.as_slice())
            .map_err(|e| RegistryError::Crypto(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| RegistryError::Crypto(e.to_string()))
    }
}

/// Loads an encryption key from `env_key` if present (hex-decoded), else
/// reads/generates a 0600 key file beside the catalog. Persisting the key
/// resolves the reference implementation's "key regenerates on every
/// restart" bug (see DESIGN.md).
pub fn load_or_generate_key(env_key: Option<&str>, key_file: &Path) -> std::io::Result<[u8; 32]> {
    if let Some(hex_key) = env_key {
        if let Ok(bytes) = hex::decode(hex_key) {
            if bytes.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                return Ok(key);
            }
            warn!("ORCH_ENCRYPTION_KEY is not 32 bytes after hex-decoding, ignoring");
        }
    }

    if key_file.exists() {
        let hex_contents = fs::read_to_string(key_file)?;
        let bytes = hex::decode(hex_contents.trim())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if bytes.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    if let Some(parent) = key_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(key_file, hex::encode(key))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(key_file)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(key_file, perms)?;
    }
    info!("generated new credential encryption key at {:?}", key_file);
    Ok(key)
}

pub struct ServiceRegistry {
    catalog_path: PathBuf,
    cipher: Cipher,
    records: RwLock<HashMap<String, ServiceRecord>>,
    limiters: RwLock<HashMap<String, Arc<DirectLimiter>>>,
}

impl ServiceRegistry {
    /// Load the catalog from `catalog_path` if present; otherwise seed it
    /// with the closed `CORE_SERVICES` list (first-run bootstrap is not a
    /// separate code path from loading).
    pub async fn new(catalog_path: PathBuf, encryption_key: [u8; 32]) -> Result<Self, RegistryError> {
        let cipher = Cipher::new(encryption_key);
        let records = if catalog_path.exists() {
            let content = fs::read_to_string(&catalog_path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)
                    .map_err(|e| RegistryError::Corrupt(e.to_string()))?
            }
        } else {
            HashMap::new()
        };

        let registry = Self {
            catalog_path,
            cipher,
            records: RwLock::new(records),
            limiters: RwLock::new(HashMap::new()),
        };

        registry.seed_core_services().await?;
        registry.rebuild_all_limiters().await;
        Ok(registry)
    }

    async fn seed_core_services(&self) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        for name in CORE_SERVICES {
            records.entry(name.to_string()).or_insert_with(|| ServiceRecord {
                name: name.to_string(),
                display_name: name.to_string(),
                endpoint: String::new(),
                credential: None,
                declared_actions: Vec::new(),
                version: "0.0.0".to_string(),
                trusted: true,
                trust_level: TrustLevel::Trusted,
                allowed_actions: None,
                rate_limit_per_minute: None,
                enabled: true,
                core: true,
                health: Health::Unknown,
                consecutive_failures: 0,
                stats: CallStats::default(),
                health_history: Vec::new(),
            });
        }
        drop(records);
        self.persist().await
    }

    async fn rebuild_all_limiters(&self) {
        let records = self.records.read().await;
        let mut limiters = self.limiters.write().await;
        for record in records.values() {
            if let Some(per_minute) = record.rate_limit_per_minute {
                limiters.insert(record.name.clone(), Self::build_limiter(per_minute));
            }
        }
    }

    fn build_limiter(per_minute: u32) -> Arc<DirectLimiter> {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute.max(1)).unwrap());
        Arc::new(GovernorLimiter::direct(quota))
    }

    async fn persist(&self) -> Result<(), RegistryError> {
        let records = self.records.read().await;
        let content = serde_json::to_string_pretty(&*records)
            .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
        if let Some(parent) = self.catalog_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.catalog_path, content)?;
        Ok(())
    }

    pub async fn register(&self, config: ServiceConfig) -> Result<ServiceRecord, RegistryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&config.name) {
            return Err(RegistryError::AlreadyExists(config.name));
        }

        let credential = match config.credential {
            Some(plaintext) => Some(self.cipher.encrypt(&plaintext)?),
            None => None,
        };

        let record = ServiceRecord {
            name: config.name.clone(),
            display_name: config.display_name,
            endpoint: config.endpoint,
            credential,
            declared_actions: config.declared_actions,
            version: config.version,
            trusted: matches!(config.trust_level, TrustLevel::Trusted),
            trust_level: config.trust_level,
            allowed_actions: config.allowed_actions,
            rate_limit_per_minute: config.rate_limit_per_minute,
            enabled: true,
            core: config.core,
            health: Health::Unknown,
            consecutive_failures: 0,
            stats: CallStats::default(),
            health_history: Vec::new(),
        };

        if let Some(per_minute) = record.rate_limit_per_minute {
            self.limiters
                .write()
                .await
                .insert(record.name.clone(), Self::build_limiter(per_minute));
        }

        records.insert(config.name, record.clone());
        drop(records);
        self.persist().await?;
        Ok(record)
    }

    pub async fn update(&self, name: &str, update: ServiceUpdate) -> Result<ServiceRecord, RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if record.core && update.enabled == Some(false) {
            return Err(RegistryError::ProtectedCore(name.to_string()));
        }

        if let Some(display_name) = update.display_name {
            record.display_name = display_name;
        }
        if let Some(endpoint) = update.endpoint {
            record.endpoint = endpoint;
        }
        if let Some(plaintext) = update.credential {
            record.credential = Some(self.cipher.encrypt(&plaintext)?);
        }
        if let Some(declared_actions) = update.declared_actions {
            record.declared_actions = declared_actions;
        }
        if let Some(trust_level) = update.trust_level {
            record.trusted = matches!(trust_level, TrustLevel::Trusted);
            record.trust_level = trust_level;
        }
        if let Some(allowed_actions) = update.allowed_actions {
            record.allowed_actions = Some(allowed_actions);
        }
        if let Some(rate_limit) = update.rate_limit_per_minute {
            record.rate_limit_per_minute = Some(rate_limit);
            self.limiters
                .write()
                .await
                .insert(name.to_string(), Self::build_limiter(rate_limit));
        }
        if let Some(enabled) = update.enabled {
            record.enabled = enabled;
        }

        let result = record.clone();
        drop(records);
        self.persist().await?;
        Ok(result)
    }

    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if record.core {
            return Err(RegistryError::ProtectedCore(name.to_string()));
        }
        records.remove(name);
        drop(records);
        self.limiters.write().await.remove(name);
        self.persist().await
    }

    pub async fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.records.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ServiceRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn list_enabled(&self) -> Vec<ServiceRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    pub async fn list_core(&self) -> Vec<ServiceRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.core)
            .cloned()
            .collect()
    }

    pub async fn list_external(&self) -> Vec<ServiceRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| !r.core)
            .cloned()
            .collect()
    }

    /// Decrypt a service's credential just-in-time. Never logged.
    pub async fn decrypt_credential(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let records = self.records.read().await;
        let record = records
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        match &record.credential {
            Some(encrypted) => Ok(Some(self.cipher.decrypt(encrypted)?)),
            None => Ok(None),
        }
    }

    pub async fn record_health(
        &self,
        name: &str,
        status: Health,
        latency_ms: Option<u64>,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        record.health = status;
        if matches!(status, Health::Healthy) {
            record.consecutive_failures = 0;
        } else {
            record.consecutive_failures += 1;
        }
        record.health_history.push(HealthEvent {
            at: Utc::now(),
            status,
            latency_ms,
            error,
        });
        if record.health_history.len() > 50 {
            let overflow = record.health_history.len() - 50;
            record.health_history.drain(0..overflow);
        }
        drop(records);
        self.persist().await
    }

    pub async fn record_call(&self, name: &str, success: bool, latency_ms: u64) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let n = record.stats.total_requests as f64;
        record.stats.avg_latency_ms = (record.stats.avg_latency_ms * n + latency_ms as f64) / (n + 1.0);
        record.stats.total_requests += 1;
        if !success {
            record.stats.total_errors += 1;
        }
        record.stats.last_request_at = Some(Utc::now());
        drop(records);
        self.persist().await
    }

    pub fn is_sensitive(action: &str) -> bool {
        SENSITIVE_ACTIONS.contains(&action)
    }

    /// `true` if the service is allowed to make another call right now.
    /// Services with no declared rate limit are never throttled here.
    pub async fn check_rate_limit(&self, name: &str) -> bool {
        let limiters = self.limiters.read().await;
        match limiters.get(name) {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    /// `allow_sensitive` is the caller's explicit opt-in (§4.B) for sensitive
    /// actions on an untrusted service; without it, such a call is rejected
    /// outright rather than merely logged.
    pub async fn is_action_allowed(&self, name: &str, action: &str, allow_sensitive: bool) -> Result<bool, RegistryError> {
        let record = self.get(name).await.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if !record.declared_actions.is_empty() && !record.declared_actions.iter().any(|a| a == action) {
            return Ok(false);
        }
        if let Some(allow_list) = &record.allowed_actions {
            if !allow_list.iter().any(|a| a == action) {
                return Ok(false);
            }
        }
        if Self::is_sensitive(action) && !record.trusted {
            if !allow_sensitive {
                debug!(service = name, action, "sensitive action on untrusted service rejected: no caller opt-in");
                return Ok(false);
            }
            debug!(service = name, action, "sensitive action on untrusted service allowed via caller opt-in");
        }
        Ok(true)
    }
}
