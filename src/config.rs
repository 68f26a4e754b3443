//! Process configuration: environment overlaid on code defaults, the same
//! pattern `src/main.rs`'s `AgencyConfig` uses upstream.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hex-decoded `ORCH_ENCRYPTION_KEY`, if set. Falls back to a persisted
    /// key file when absent.
    pub encryption_key: Option<[u8; 32]>,
    pub key_file: PathBuf,
    pub debug: bool,
    pub catalog_path: PathBuf,
    pub trace_ring_capacity: usize,
    pub iteration_cap: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            key_file: PathBuf::from("orchestrator_key.hex"),
            debug: false,
            catalog_path: PathBuf::from("service_catalog.json"),
            trace_ring_capacity: 200,
            iteration_cap: 50,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let encryption_key = std::env::var("ORCH_ENCRYPTION_KEY").ok().and_then(|hex_key| {
            let bytes = hex::decode(hex_key).ok()?;
            if bytes.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                Some(key)
            } else {
                None
            }
        });

        Self {
            encryption_key,
            key_file: std::env::var("ORCH_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.key_file),
            debug: std::env::var("ORCH_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            catalog_path: std::env::var("ORCH_CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            trace_ring_capacity: std::env::var("ORCH_TRACE_RING_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.trace_ring_capacity),
            iteration_cap: std::env::var("ORCH_ITERATION_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.iteration_cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.trace_ring_capacity, 200);
        assert_eq!(config.iteration_cap, 50);
        assert!(config.encryption_key.is_none());
    }
}
