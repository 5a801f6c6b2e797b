//! Environment configuration (the external interface's recognized options).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Named shared memory segment.
    pub shared_memory_name: String,
    /// Prefix for per-map sub-allocations.
    pub maps_basename: String,
    /// When false, the attach manager becomes a no-op.
    pub whether_enabled: bool,
    /// Selects from the registered JIT code-generator back-ends.
    pub jit_backend: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            shared_memory_name: "bpftime_maps_shm".to_string(),
            maps_basename: "bpftime_map_".to_string(),
            whether_enabled: true,
            jit_backend: "cranelift".to_string(),
        }
    }
}

impl EnvConfig {
    /// Load overrides from `BPFTIME_*` environment variables, falling back
    /// to [`EnvConfig::default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = EnvConfig::default();
        if let Ok(v) = std::env::var("BPFTIME_SHM_NAME") {
            cfg.shared_memory_name = v;
        }
        if let Ok(v) = std::env::var("BPFTIME_MAPS_BASENAME") {
            cfg.maps_basename = v;
        }
        if let Ok(v) = std::env::var("BPFTIME_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.whether_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("BPFTIME_JIT_BACKEND") {
            cfg.jit_backend = v;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EnvConfig::default();
        assert_eq!(cfg.shared_memory_name, "bpftime_maps_shm");
        assert!(cfg.whether_enabled);
        assert_eq!(cfg.jit_backend, "cranelift");
    }
}
