// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Runtime Configuration Types
//
// Defines the configuration schema for an enclave runtime process:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Context registry bounds (cache size, idle TTL, sweep cadence)
// - Event routing defaults (retry budget, per-attempt timeout, cancel grace)
// - Result retention and sandbox defaults
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::event::event_types;
use crate::domain::sandbox::{SandboxPolicy, SecurityLevel};

pub const API_VERSION: &str = "enclave.dev/v1";
pub const KIND: &str = "RuntimeConfig";

/// Top-level Kubernetes-style runtime configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfigManifest {
    /// API version (must be "enclave.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "RuntimeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: RuntimeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfigSpec {
    #[serde(default)]
    pub contexts: ContextsConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub results: ResultsConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextsConfig {
    /// Live contexts kept before LRU eviction kicks in
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,

    /// Idle time after which a context is reclaimable
    #[serde(default = "default_context_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Per-attempt deadline for envelopes that carry none
    #[serde(default = "default_handler_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// How long `cancel` waits before aborting handler tasks
    #[serde(default = "default_cancel_grace", with = "humantime_serde")]
    pub cancel_grace: Duration,

    /// Event types delivered across tenant boundaries
    #[serde(default = "default_cross_boundary_types")]
    pub cross_boundary_types: Vec<String>,

    /// Domain event bus buffer
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    #[serde(default = "default_max_results")]
    pub max_size: usize,

    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub default_level: SecurityLevel,

    /// Blocking plugin worker slots
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Monitor sampling cadence
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_violation_retention_days")]
    pub violation_retention_days: u32,

    /// Execution results kept for `execution_history`
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Named policies selectable next to the tier presets
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_policies: BTreeMap<String, SandboxPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port; no exporter when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

fn default_max_contexts() -> usize {
    1000
}

fn default_context_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    crate::domain::event::DEFAULT_MAX_ATTEMPTS
}

fn default_handler_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cancel_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_cross_boundary_types() -> Vec<String> {
    event_types::CROSS_BOUNDARY
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn default_bus_capacity() -> usize {
    1000
}

fn default_max_results() -> usize {
    10_000
}

fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_worker_threads() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_violation_retention_days() -> u32 {
    30
}

fn default_history_limit() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ContextsConfig {
    fn default() -> Self {
        Self {
            max_contexts: default_max_contexts(),
            ttl: default_context_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            default_timeout: default_handler_timeout(),
            cancel_grace: default_cancel_grace(),
            cross_boundary_types: default_cross_boundary_types(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_results(),
            retention: default_retention(),
            purge_interval: default_purge_interval(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_level: SecurityLevel::default(),
            worker_threads: default_worker_threads(),
            poll_interval: default_poll_interval(),
            violation_retention_days: default_violation_retention_days(),
            history_limit: default_history_limit(),
            custom_policies: BTreeMap::new(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for RuntimeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "enclave-runtime".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: RuntimeConfigSpec::default(),
        }
    }
}

impl RuntimeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. ENCLAVE_CONFIG_PATH environment variable
    /// 2. ./enclave-config.yaml (working directory)
    /// 3. ~/.enclave/config.yaml (user home)
    /// 4. /etc/enclave/config.yaml (system, Unix) or C:\ProgramData\Enclave\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ENCLAVE_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./enclave-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".enclave").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/enclave/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Enclave\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ENCLAVE_MAX_CONTEXTS") {
            match val.parse::<usize>() {
                Ok(max) => {
                    tracing::info!("Environment override: ENCLAVE_MAX_CONTEXTS={}", max);
                    self.spec.contexts.max_contexts = max;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for ENCLAVE_MAX_CONTEXTS: '{}'. Expected a count. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("ENCLAVE_CONTEXT_TTL") {
            match parse_duration(&val) {
                Some(ttl) => {
                    tracing::info!("Environment override: ENCLAVE_CONTEXT_TTL={}", val);
                    self.spec.contexts.ttl = ttl;
                }
                None => tracing::warn!(
                    "Invalid value for ENCLAVE_CONTEXT_TTL: '{}'. Expected a duration like '30m'. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("ENCLAVE_SANDBOX_LEVEL") {
            match val.parse::<SecurityLevel>() {
                Ok(level) => {
                    tracing::info!("Environment override: ENCLAVE_SANDBOX_LEVEL={}", level);
                    self.spec.sandbox.default_level = level;
                }
                Err(e) => tracing::warn!("Invalid value for ENCLAVE_SANDBOX_LEVEL: {}. Ignoring.", e),
            }
        }

        if let Ok(val) = std::env::var("ENCLAVE_WORKER_THREADS") {
            match val.parse::<usize>() {
                Ok(workers) => {
                    tracing::info!("Environment override: ENCLAVE_WORKER_THREADS={}", workers);
                    self.spec.sandbox.worker_threads = workers;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for ENCLAVE_WORKER_THREADS: '{}'. Expected a count. Ignoring.",
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.trim().is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        if spec.contexts.max_contexts == 0 {
            anyhow::bail!("spec.contexts.max_contexts must be at least 1");
        }
        if spec.contexts.ttl.is_zero() {
            anyhow::bail!("spec.contexts.ttl must be greater than zero");
        }
        if spec.events.default_max_attempts == 0 {
            anyhow::bail!("spec.events.default_max_attempts must be at least 1");
        }
        if spec.events.default_timeout.is_zero() {
            anyhow::bail!("spec.events.default_timeout must be greater than zero");
        }
        if spec.events.bus_capacity == 0 {
            anyhow::bail!("spec.events.bus_capacity must be at least 1");
        }
        if spec.results.max_size == 0 {
            anyhow::bail!("spec.results.max_size must be at least 1");
        }
        if spec.sandbox.worker_threads == 0 {
            anyhow::bail!("spec.sandbox.worker_threads must be at least 1");
        }
        if spec.sandbox.poll_interval.is_zero() {
            anyhow::bail!("spec.sandbox.poll_interval must be greater than zero");
        }
        for (name, policy) in &spec.sandbox.custom_policies {
            if name.trim().is_empty() {
                anyhow::bail!("Custom sandbox policy name cannot be empty");
            }
            if policy.max_wall_time.is_zero() {
                anyhow::bail!("Custom sandbox policy '{}' has a zero max_wall_time", name);
            }
        }
        match spec.observability.log_format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!(
                "Invalid spec.observability.log_format: '{}'. Must be 'text' or 'json'",
                other
            ),
        }

        Ok(())
    }
}

fn parse_duration(value: &str) -> Option<Duration> {
    serde_yaml::from_str::<humantime_serde::Serde<Duration>>(value)
        .ok()
        .map(|d| d.into_inner())
}
