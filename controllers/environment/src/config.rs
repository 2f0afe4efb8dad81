//! Controller configuration.
//!
//! Loaded from an optional YAML file named by `CONTROLLER_CONFIG`, then
//! overridden by individual environment variables.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;
use crate::translator::quantity;

/// Top-level controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Suffix for environment hostnames (`dev-env-<id8>.<suffix>`)
    pub domain_suffix: String,
    /// Storage class for workspace PVCs
    pub storage_class: String,
    /// Image pull secret added to every workload
    pub registry_secret: Option<String>,
    /// Ingress class for environment ingresses
    pub ingress_class: String,
    /// Namespace of the ingress controller, allowed through the network policy
    pub ingress_namespace: String,
    /// Service type for environment services
    pub service_type: String,
    /// Reconcile worker count
    pub workers: usize,
    pub resync_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub store_timeout_secs: u64,
    pub health_poll_interval_secs: u64,
    /// Idle timeout; idle detection is off when unset
    pub idle_timeout_hours: Option<u64>,
    pub min_ttl_hours: i64,
    pub max_ttl_hours: i64,
    pub retry: RetryConfig,
    /// Accepted base image aliases and the image each one resolves to
    pub base_images: BTreeMap<String, String>,
    pub placement: PlacementConfig,
    /// Listen address for /metrics, /healthz and /readyz
    pub metrics_addr: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            domain_suffix: "dev.company.com".to_string(),
            storage_class: "gp3".to_string(),
            registry_secret: None,
            ingress_class: "nginx".to_string(),
            ingress_namespace: "ingress-nginx".to_string(),
            service_type: "LoadBalancer".to_string(),
            workers: 4,
            resync_interval_secs: 300,
            sweep_interval_secs: 60,
            store_timeout_secs: 10,
            health_poll_interval_secs: 10,
            idle_timeout_hours: None,
            min_ttl_hours: 1,
            max_ttl_hours: 168,
            retry: RetryConfig::default(),
            base_images: default_base_images(),
            placement: PlacementConfig::default(),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

fn default_base_images() -> BTreeMap<String, String> {
    [
        "ubuntu:20.04",
        "ubuntu:22.04",
        "centos:8",
        "alpine:latest",
        "python:3.11",
        "jupyter/datascience-notebook",
    ]
    .into_iter()
    .map(|alias| (alias.to_string(), alias.to_string()))
    .collect()
}

/// Retry and backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    /// Transient failures tolerated before escalating
    pub max_attempts: u32,
    /// Minimum wait after a quota rejection
    pub quota_floor_secs: u64,
    /// How long quota rejections are retried before escalating
    pub quota_escalation_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_secs: 300,
            max_attempts: 8,
            quota_floor_secs: 120,
            quota_escalation_secs: 3_600,
        }
    }
}

/// Node pool placement policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlacementConfig {
    /// Node label and taint key used for pool selection
    pub selector_key: String,
    /// Pool for workloads that fit no other rule
    pub default_pool: String,
    /// Pool for GPU workloads; GPU requests are rejected when unset
    pub gpu_pool: Option<String>,
    /// Memory tiers, matched against `limits.memory`
    pub memory_tiers: Vec<MemoryTier>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            selector_key: "workload-type".to_string(),
            default_pool: "development".to_string(),
            gpu_pool: Some("gpu".to_string()),
            memory_tiers: vec![MemoryTier {
                pool: "high-memory".to_string(),
                min_memory: "100Gi".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTier {
    pub pool: String,
    /// Smallest `limits.memory` that lands in this pool
    pub min_memory: String,
}

impl ControllerConfig {
    /// Load configuration from `CONTROLLER_CONFIG` (if set) and the process
    /// environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::load(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` to read variables
    pub fn load<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("CONTROLLER_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ControllerError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ControllerError> {
        serde_yaml::from_str(raw)
            .map_err(|e| ControllerError::InvalidConfig(format!("failed to parse config file: {}", e)))
    }

    fn apply_overrides<F>(&mut self, lookup: &F) -> Result<(), ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DOMAIN_SUFFIX") {
            self.domain_suffix = v;
        }
        if let Some(v) = lookup("STORAGE_CLASS") {
            self.storage_class = v;
        }
        if let Some(v) = lookup("REGISTRY_SECRET") {
            self.registry_secret = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("INGRESS_CLASS") {
            self.ingress_class = v;
        }
        if let Some(v) = lookup("SERVICE_TYPE") {
            self.service_type = v;
        }
        if let Some(v) = lookup("METRICS_ADDR") {
            self.metrics_addr = v;
        }
        override_parsed(lookup, "WORKERS", &mut self.workers)?;
        override_parsed(lookup, "RESYNC_INTERVAL_SECS", &mut self.resync_interval_secs)?;
        override_parsed(lookup, "SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs)?;
        override_parsed(lookup, "STORE_TIMEOUT_SECS", &mut self.store_timeout_secs)?;
        override_parsed(lookup, "MIN_TTL_HOURS", &mut self.min_ttl_hours)?;
        override_parsed(lookup, "MAX_TTL_HOURS", &mut self.max_ttl_hours)?;
        override_parsed(lookup, "RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms)?;
        override_parsed(lookup, "RETRY_MULTIPLIER", &mut self.retry.multiplier)?;
        override_parsed(lookup, "RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        if let Some(v) = lookup("IDLE_TIMEOUT_HOURS") {
            self.idle_timeout_hours = if v.is_empty() || v == "0" {
                None
            } else {
                Some(parse_value("IDLE_TIMEOUT_HOURS", &v)?)
            };
        }
        Ok(())
    }

    /// Reject values the controller cannot run with
    pub fn validate(&self) -> Result<(), ControllerError> {
        let invalid = |msg: String| Err(ControllerError::InvalidConfig(msg));

        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }
        if self.min_ttl_hours < 1 || self.min_ttl_hours > self.max_ttl_hours {
            return invalid(format!(
                "TTL range [{}, {}] is empty or starts below 1h",
                self.min_ttl_hours, self.max_ttl_hours
            ));
        }
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return invalid(format!("retry multiplier must be >= 1, got {}", self.retry.multiplier));
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry max attempts must be at least 1".to_string());
        }
        if self.store_timeout_secs == 0 || self.sweep_interval_secs == 0 || self.resync_interval_secs == 0 {
            return invalid("intervals and timeouts must be non-zero".to_string());
        }
        if self.domain_suffix.is_empty() {
            return invalid("domain suffix must not be empty".to_string());
        }
        if self.metrics_addr.parse::<SocketAddr>().is_err() {
            return invalid(format!("metrics address {:?} is not a socket address", self.metrics_addr));
        }
        for tier in &self.placement.memory_tiers {
            if let Err(e) = quantity::parse_quantity(&tier.min_memory) {
                return invalid(format!("memory tier {}: {}", tier.pool, e));
            }
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_interval_secs)
    }

    pub fn idle_timeout(&self) -> Option<chrono::Duration> {
        self.idle_timeout_hours
            .and_then(|h| i64::try_from(h).ok())
            .map(chrono::Duration::hours)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = parse_value(key, &raw)?;
    }
    Ok(())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("{}={:?}: {}", key, raw, e)))
}
