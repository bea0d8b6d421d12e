//! Manager configuration
//!
//! Process-wide settings for the lifecycle manager, loaded from environment
//! variables. Per-challenge settings live in [`crate::challenges`].

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::runtime::{DockerRuntimeConfig, LABEL_MANAGED};

/// Lifecycle manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Label filter identifying resources owned by this manager ("key=value")
    pub managed_label: String,
    /// TTL for challenges that do not set their own (default: 1h)
    pub default_ttl: Duration,
    /// Pool size for challenges that do not set their own (default: 2)
    pub default_pool_size: usize,
    /// Global switch: when false every stop tears the resource down
    pub reuse_resources: bool,
    /// Orphan reconciliation settings
    pub reconcile: ReconcileConfig,
    /// Docker runtime settings
    pub docker: DockerRuntimeConfig,
}

/// Orphan reconciliation settings
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub enabled: bool,
    /// How often the reconciler lists runtime resources (default: 60s)
    pub interval: Duration,
    /// Minimum age before an unknown resource counts as orphaned (default: 120s)
    pub grace: Duration,
}

impl ReconcileConfig {
    /// Grace window actually applied: never shorter than one interval
    pub fn effective_grace(&self) -> Duration {
        self.grace.max(self.interval)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(120),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            managed_label: format!("{}=true", LABEL_MANAGED),
            default_ttl: Duration::from_secs(3600),
            default_pool_size: 2,
            reuse_resources: true,
            reconcile: ReconcileConfig::default(),
            docker: DockerRuntimeConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from `INSTANCER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let parse = |key: &str| -> Result<Option<u64>> { parse_var(&lookup, key) };
        let secs_or = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse(key)?.map(Duration::from_secs).unwrap_or(default))
        };

        let reconcile = ReconcileConfig {
            enabled: parse_bool(&lookup, "INSTANCER_RECONCILE_ENABLED")?
                .unwrap_or(defaults.reconcile.enabled),
            interval: secs_or(
                "INSTANCER_RECONCILE_INTERVAL_SECS",
                defaults.reconcile.interval,
            )?,
            grace: secs_or("INSTANCER_RECONCILE_GRACE_SECS", defaults.reconcile.grace)?,
        };
        if reconcile.enabled && reconcile.interval.is_zero() {
            anyhow::bail!("INSTANCER_RECONCILE_INTERVAL_SECS must be greater than 0");
        }

        let docker = DockerRuntimeConfig {
            docker_bin: lookup("INSTANCER_DOCKER_BIN").unwrap_or(defaults.docker.docker_bin),
            call_timeout: secs_or(
                "INSTANCER_DOCKER_TIMEOUT_SECS",
                defaults.docker.call_timeout,
            )?,
            stop_timeout_secs: parse_var::<u32>(&lookup, "INSTANCER_DOCKER_STOP_TIMEOUT_SECS")?
                .unwrap_or(defaults.docker.stop_timeout_secs),
        };

        let default_ttl = secs_or("INSTANCER_DEFAULT_TTL_SECS", defaults.default_ttl)?;
        if default_ttl.is_zero() {
            anyhow::bail!("INSTANCER_DEFAULT_TTL_SECS must be greater than 0");
        }

        Ok(Self {
            managed_label: lookup("INSTANCER_MANAGED_LABEL").unwrap_or(defaults.managed_label),
            default_ttl,
            default_pool_size: parse_var::<usize>(&lookup, "INSTANCER_DEFAULT_POOL_SIZE")?
                .unwrap_or(defaults.default_pool_size),
            reuse_resources: parse_bool(&lookup, "INSTANCER_REUSE_RESOURCES")?
                .unwrap_or(defaults.reuse_resources),
            reconcile,
            docker,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {}", key, raw))
        })
        .transpose()
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    lookup(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(anyhow::anyhow!("Invalid value for {}: {}", key, raw)),
        })
        .transpose()
}
