// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Fleet Configuration Types
//
// Defines the YAML manifest that configures a shardmesh process:
// - Per-shard runtime tuning (capacity, heartbeat cadence, thresholds)
// - Coordinator tuning (coordination interval, replica bound)
// - The default fleet bootstrapped by `spawn_default_shards`
// - Event bus capacity

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::capability::Capability;
use crate::domain::scope::WorkloadType;
use crate::domain::state::MergeStrategy;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "FleetConfig";

/// Top-level fleet configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "FleetConfig")
    pub kind: String,

    pub spec: FleetSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetSpec {
    #[serde(default)]
    pub shard: ShardRuntimeConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub fleet: DefaultFleetConfig,

    #[serde(default)]
    pub bus: BusConfig,
}

/// Tuning shared by every shard the coordinator spawns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRuntimeConfig {
    /// Queue depth at which load_factor reaches 1.0
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// How long a loop blocks on an empty queue before re-checking for shutdown
    #[serde(default = "default_dequeue_timeout", with = "humantime_serde")]
    pub dequeue_timeout: Duration,

    /// load_factor at or above which the shard reports itself overloaded
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: f64,

    /// load_factor below which the shard answers NEED messages with an OFFER
    #[serde(default = "default_help_threshold")]
    pub help_threshold: f64,

    /// Items forwarded this many times are executed wherever they land
    #[serde(default = "default_max_offload_hops")]
    pub max_offload_hops: u32,

    #[serde(default = "default_message_ttl_seconds")]
    pub message_ttl_seconds: u64,

    /// How long stop() lets an in-flight task finish before handing it off.
    /// Zero hands off immediately
    #[serde(default, with = "humantime_serde")]
    pub stop_grace: Duration,

    #[serde(default = "default_trust_level")]
    pub trust_level: u8,

    #[serde(default)]
    pub merge_strategy: MergeStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_coordination_interval", with = "humantime_serde")]
    pub coordination_interval: Duration,

    /// Upper bound on live replicas spawned for any one overloaded shard
    #[serde(default = "default_max_replicas_per_shard")]
    pub max_replicas_per_shard: usize,
}

/// Baseline fleet spawned at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultFleetConfig {
    #[serde(default)]
    pub domains: Vec<DomainShardConfig>,

    #[serde(default)]
    pub workloads: Vec<WorkloadShardConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainShardConfig {
    pub domain: String,

    #[serde(default)]
    pub capabilities: Vec<Capability>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub geography: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadShardConfig {
    pub workload_type: WorkloadType,

    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Events buffered per subscriber before the slowest one starts lagging
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    100
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_dequeue_timeout() -> Duration {
    Duration::from_millis(250)
}

fn default_overload_threshold() -> f64 {
    0.8
}

fn default_help_threshold() -> f64 {
    0.7
}

fn default_max_offload_hops() -> u32 {
    3
}

fn default_message_ttl_seconds() -> u64 {
    300
}

fn default_trust_level() -> u8 {
    1
}

fn default_coordination_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_replicas_per_shard() -> usize {
    2
}

fn default_bus_capacity() -> usize {
    1000
}

impl Default for ShardRuntimeConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            heartbeat_interval: default_heartbeat_interval(),
            dequeue_timeout: default_dequeue_timeout(),
            overload_threshold: default_overload_threshold(),
            help_threshold: default_help_threshold(),
            max_offload_hops: default_max_offload_hops(),
            message_ttl_seconds: default_message_ttl_seconds(),
            stop_grace: Duration::ZERO,
            trust_level: default_trust_level(),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordination_interval: default_coordination_interval(),
            max_replicas_per_shard: default_max_replicas_per_shard(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

impl Default for DefaultFleetConfig {
    fn default() -> Self {
        let domain = |name: &str, capabilities: &[Capability]| DomainShardConfig {
            domain: name.to_string(),
            capabilities: capabilities.to_vec(),
            geography: None,
        };
        Self {
            domains: vec![
                domain(
                    "infra",
                    &[Capability::ResourceOptimizer, Capability::SelfHealing, Capability::Observability],
                ),
                domain("app", &[Capability::SelfHealing, Capability::Observability]),
                domain("security", &[Capability::SecuritySentinel]),
                domain("data", &[Capability::DataIngestion, Capability::MemorySteward]),
            ],
            workloads: vec![
                WorkloadShardConfig {
                    workload_type: WorkloadType::Preventive,
                    capabilities: vec![
                        Capability::ResourceOptimizer,
                        Capability::MemorySteward,
                        Capability::Scheduling,
                    ],
                },
                WorkloadShardConfig {
                    workload_type: WorkloadType::IncidentResponse,
                    capabilities: vec![Capability::SelfHealing, Capability::SecuritySentinel],
                },
            ],
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            spec: FleetSpec::default(),
        }
    }
}

impl FleetConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. SHARDMESH_CONFIG_PATH environment variable
    /// 2. ./shardmesh.yaml (working directory)
    /// 3. ~/.shardmesh/config.yaml (user home)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SHARDMESH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./shardmesh.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".shardmesh").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SHARDMESH_SHARD_CAPACITY") {
            match val.parse::<usize>() {
                Ok(capacity) => {
                    tracing::info!("Environment override: SHARDMESH_SHARD_CAPACITY={}", capacity);
                    self.spec.shard.capacity = capacity;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for SHARDMESH_SHARD_CAPACITY: '{}'. Expected an integer. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("SHARDMESH_HEARTBEAT_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => {
                    tracing::info!("Environment override: SHARDMESH_HEARTBEAT_INTERVAL_SECS={}", secs);
                    self.spec.shard.heartbeat_interval = Duration::from_secs(secs);
                }
                Err(_) => tracing::warn!(
                    "Invalid value for SHARDMESH_HEARTBEAT_INTERVAL_SECS: '{}'. Expected seconds. Ignoring.",
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        let shard = &self.spec.shard;
        if shard.capacity == 0 {
            anyhow::bail!("spec.shard.capacity must be greater than zero");
        }
        if shard.heartbeat_interval.is_zero() {
            anyhow::bail!("spec.shard.heartbeat_interval must be greater than zero");
        }
        if shard.dequeue_timeout.is_zero() {
            anyhow::bail!("spec.shard.dequeue_timeout must be greater than zero");
        }
        if !(shard.overload_threshold > 0.0) {
            anyhow::bail!("spec.shard.overload_threshold must be positive");
        }
        if shard.help_threshold >= shard.overload_threshold {
            anyhow::bail!(
                "spec.shard.help_threshold ({}) must be below overload_threshold ({})",
                shard.help_threshold,
                shard.overload_threshold
            );
        }

        if self.spec.coordinator.coordination_interval.is_zero() {
            anyhow::bail!("spec.coordinator.coordination_interval must be greater than zero");
        }

        if self.spec.bus.capacity == 0 {
            anyhow::bail!("spec.bus.capacity must be greater than zero");
        }

        let mut seen = std::collections::HashSet::new();
        for domain in &self.spec.fleet.domains {
            if domain.domain.is_empty() {
                anyhow::bail!("Domain shard name cannot be empty");
            }
            if domain.domain == "shard" || domain.domain.starts_with("shard.") {
                anyhow::bail!("Domain '{}' collides with the reserved shard namespace", domain.domain);
            }
            if !seen.insert(domain.domain.as_str()) {
                anyhow::bail!("Duplicate domain shard: {}", domain.domain);
            }
        }

        if self.spec.fleet.workloads.is_empty() {
            anyhow::bail!("spec.fleet.workloads must define at least one workload shard");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.spec.shard.capacity, 100);
        assert_eq!(config.spec.shard.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.spec.coordinator.coordination_interval, Duration::from_secs(60));
        assert_eq!(config.spec.fleet.domains.len(), 4);
    }

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: 100monkeys.ai/v1
kind: FleetConfig
spec:
  shard:
    capacity: 10
    heartbeat_interval: 5s
    merge_strategy: field
  fleet:
    domains:
      - domain: infra
        capabilities: [SELF_HEALING]
    workloads:
      - workload_type: preventive
"#;
        let config = FleetConfig::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.spec.shard.capacity, 10);
        assert_eq!(config.spec.shard.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.spec.shard.dequeue_timeout, Duration::from_millis(250));
        assert_eq!(config.spec.shard.merge_strategy, MergeStrategy::Field);
        assert_eq!(config.spec.fleet.domains[0].capabilities, vec![Capability::SelfHealing]);
        assert_eq!(config.spec.bus.capacity, 1000);
    }

    #[test]
    fn test_validation() {
        let mut config = FleetConfig::default();

        config.api_version = "wrong/v1".to_string();
        assert!(config.validate().is_err());
        config.api_version = API_VERSION.to_string();

        config.spec.shard.capacity = 0;
        assert!(config.validate().is_err());
        config.spec.shard.capacity = 100;

        config.spec.shard.help_threshold = 0.9;
        assert!(config.validate().is_err());
        config.spec.shard.help_threshold = 0.7;

        config.spec.fleet.domains.push(config.spec.fleet.domains[0].clone());
        assert!(config.validate().is_err());
        config.spec.fleet.domains.pop();

        config.spec.fleet.workloads.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(&path, FleetConfig::default().to_yaml_string().unwrap()).unwrap();

        let loaded = FleetConfig::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.kind, KIND);
        assert_eq!(loaded.spec.fleet.workloads.len(), 2);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = FleetConfig::load_or_default(Some(PathBuf::from("/nonexistent/fleet.yaml")));
        assert!(result.is_err());
    }
}
