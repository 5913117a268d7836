/// Configuration management for the boardflow service
///
/// Handles server configuration and the default engine configuration applied to
/// instances started without an explicit one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{str::FromStr, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Engine defaults for new instances
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Per-instance engine options, supplied at start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Drive the instance forward without manual `step` calls
    pub auto_advance: bool,
    /// Pause between auto-advance iterations, in milliseconds
    #[serde(rename = "stepDelay")]
    pub step_delay_ms: u64,
    /// Initial instance variables
    pub variables: Map<String, Value>,
}

impl EngineConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn with_auto_advance(mut self, auto_advance: bool) -> Self {
        self.auto_advance = auto_advance;
        self
    }

    pub fn with_variable(mut self, key: &str, value: Value) -> Self {
        self.variables.insert(key.to_string(), value);
        self
    }
}

/// Read and parse an environment variable, falling back on absence or parse failure
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("BOARDFLOW_HOST", "0.0.0.0".to_string()),
                port: env_or("BOARDFLOW_PORT", 3004),
            },
            engine: EngineConfig {
                auto_advance: env_or("BOARDFLOW_AUTO_ADVANCE", false),
                step_delay_ms: env_or("BOARDFLOW_STEP_DELAY_MS", 0),
                variables: Map::new(),
            },
        }
    }
}
