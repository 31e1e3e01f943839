//! Process-wide runtime configuration
//!
//! Evaluation reads one [`ConfigSnapshot`] at the start of every call. Writers bump a
//! version counter; a change made while another thread is mid-evaluation is only
//! observed by that thread's next call.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::jit::JitHost;
use crate::simd::{MathBackend, Precision};

/// Default cap on iterations of a single `while` loop execution
pub const DEFAULT_MAX_WHILE_ITERATIONS: u64 = 1_000_000;

/// Runtime knobs consulted by evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Run instantiated kernels instead of the interpreter
    pub jit_enabled: bool,
    /// Iterations allowed per `while` loop execution
    pub max_while_iterations: u64,
    /// Transcendental precision
    pub precision: Precision,
    /// Lane-mapped transcendental columns
    pub vectorized: bool,
}

impl RuntimeConfig {
    pub const DEFAULT: RuntimeConfig = RuntimeConfig {
        jit_enabled: true,
        max_while_iterations: DEFAULT_MAX_WHILE_ITERATIONS,
        precision: Precision::Ulp10,
        vectorized: true,
    };

    pub fn new() -> Self {
        Self::DEFAULT
    }

    pub fn with_jit(mut self, enabled: bool) -> Self {
        self.jit_enabled = enabled;
        self
    }

    pub fn with_max_while_iterations(mut self, limit: u64) -> Self {
        self.max_while_iterations = limit;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_vectorized(mut self, vectorized: bool) -> Self {
        self.vectorized = vectorized;
        self
    }

    pub fn math_backend(&self) -> MathBackend {
        MathBackend::new(self.precision, self.vectorized)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A configuration value together with the version it was read at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: RuntimeConfig,
}

static STATE: RwLock<ConfigSnapshot> = RwLock::new(ConfigSnapshot {
    version: 0,
    config: RuntimeConfig::DEFAULT,
});

static JIT_HOST: RwLock<Option<Arc<dyn JitHost>>> = RwLock::new(None);

/// Read the current configuration
pub fn snapshot() -> ConfigSnapshot {
    *STATE.read().unwrap_or_else(PoisonError::into_inner)
}

/// Modify the configuration; returns the new version
pub fn update(f: impl FnOnce(&mut RuntimeConfig)) -> u64 {
    let mut state = STATE.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut state.config);
    state.version += 1;
    debug!(version = state.version, config = ?state.config, "runtime configuration updated");
    state.version
}

pub fn set_jit_enabled(enabled: bool) -> u64 {
    update(|c| c.jit_enabled = enabled)
}

pub fn set_max_while_iterations(limit: u64) -> u64 {
    update(|c| c.max_while_iterations = limit)
}

pub fn set_precision(precision: Precision) -> u64 {
    update(|c| c.precision = precision)
}

pub fn set_vectorized(vectorized: bool) -> u64 {
    update(|c| c.vectorized = vectorized)
}

/// Install the capability used to instantiate and free JIT kernels.
/// Returns the previously registered host.
pub fn register_jit_host(host: Arc<dyn JitHost>) -> Option<Arc<dyn JitHost>> {
    debug!(host = host.name(), "JIT host registered");
    JIT_HOST
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(host)
}

pub fn unregister_jit_host() -> Option<Arc<dyn JitHost>> {
    let previous = JIT_HOST.write().unwrap_or_else(PoisonError::into_inner).take();
    if previous.is_some() {
        debug!("JIT host unregistered");
    }
    previous
}

/// The registered JIT host, if any
pub fn jit_host() -> Option<Arc<dyn JitHost>> {
    JIT_HOST.read().unwrap_or_else(PoisonError::into_inner).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder_and_backend() {
        let config = RuntimeConfig::new()
            .with_jit(false)
            .with_max_while_iterations(10)
            .with_precision(Precision::Ulp35)
            .with_vectorized(false);
        assert!(!config.jit_enabled);
        assert_eq!(config.max_while_iterations, 10);
        assert_eq!(config.math_backend().name(), "scalar-u35");
    }

    #[test]
    fn test_json_fills_missing_fields_with_defaults() {
        let config = RuntimeConfig::from_json(r#"{ "max_while_iterations": 42 }"#).unwrap();
        assert_eq!(config, RuntimeConfig::new().with_max_while_iterations(42));
        let round = RuntimeConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(round, config);
    }

    #[test]
    fn test_updates_bump_version() {
        let before = snapshot().version;
        let after = update(|_| {});
        assert!(after > before);
        assert!(snapshot().version >= after);
    }
}
