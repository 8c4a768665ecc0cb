//! Configuration management for Turnstile.
//!
//! Settings are layered: compiled-in defaults, then an optional file
//! (YAML, TOML or JSON by extension), then `TURNSTILE_`-prefixed environment
//! variables using `__` for nesting, for example
//! `TURNSTILE_POLICIES__CONTACT_SUBMISSION__MAX_ATTEMPTS=10`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{PolicyCatalog, PolicyOverride, RouteClass};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-route-class policy overrides
    #[serde(default)]
    pub policies: HashMap<RouteClass, PolicyOverride>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between cleanup sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Delay before restarting a crashed sweep loop
    #[serde(default = "default_restart_delay")]
    pub sweep_restart_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            sweep_restart_delay_ms: default_restart_delay(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_restart_delay() -> u64 {
    1000
}

impl EngineConfig {
    /// Time between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Time to wait before restarting a crashed sweep loop.
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.sweep_restart_delay_ms)
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, env_source())
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        Self::finish(settings)
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder.add_source(env).build()?;
        Self::finish(settings)
    }

    fn finish(settings: config::Config) -> Result<Self> {
        let config: TurnstileConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "engine.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the policy catalog with configured overrides applied.
    pub fn catalog(&self) -> Result<PolicyCatalog> {
        PolicyCatalog::with_overrides(&self.policies)
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
