//! Runtime module - Container runtime abstraction layer
//!
//! This module defines the interface the lifecycle manager consumes:
//! - `ContainerRuntime`: create/start/stop/remove/list backing resources
//! - `DockerRuntime`: implementation driving the `docker` CLI
//!
//! The runtime module does NOT:
//! - Decide when a resource is reused or torn down
//! - Track deadlines or team ownership
//! - Know which resources are orphaned

pub mod docker;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label key marking a resource as managed by this process
pub const LABEL_MANAGED: &str = "instancer.managed";
/// Label key carrying the challenge id a resource was created for
pub const LABEL_CHALLENGE: &str = "instancer.challenge";
/// Label key carrying the unix timestamp the resource was created at
pub const LABEL_CREATED_AT: &str = "instancer.created_at";

/// Transport protocol of an exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A container port to publish (e.g. "80/tcp", or "1337" for tcp)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (port, protocol) = match s.trim().split_once('/') {
            Some((port, proto)) => (port, proto),
            None => (s.trim(), "tcp"),
        };
        let port = port
            .parse::<u16>()
            .map_err(|e| anyhow::anyhow!("Invalid port '{}': {}", s, e))?;
        if port == 0 {
            anyhow::bail!("Invalid port '{}': port 0 cannot be published", s);
        }
        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => anyhow::bail!("Invalid protocol '{}' in port '{}'", other, s),
        };
        Ok(Self { port, protocol })
    }
}

/// A published port as seen from outside the resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_port: u16,
}

/// What to launch when no pooled resource is available
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Image to run
    pub image: String,
    /// Ports to publish on random host ports
    pub ports: Vec<PortSpec>,
    /// Labels to attach (key, value)
    pub labels: Vec<(String, String)>,
}

/// Opaque handle to a backing resource owned by the runtime.
///
/// Not `Clone`: a handle lives in exactly one place (a pool free list, an
/// active sandbox, or an in-flight runtime call) and is moved between them.
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceRef {
    /// Runtime identifier (container id)
    pub id: String,
    /// Image the resource runs
    pub image: String,
    /// When the runtime created the resource
    pub created_at: DateTime<Utc>,
    /// Current host port mappings (refreshed on every start)
    pub ports: Vec<PortMapping>,
}

impl ResourceRef {
    /// Age of the resource relative to `now` (zero if created in the future)
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Container runtime collaborator.
///
/// Implementations bound every call with their own timeout.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a new resource from `spec` and start it
    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<ResourceRef>;

    /// Start a previously stopped resource, refreshing its port mappings
    async fn start(&self, resource: ResourceRef) -> Result<ResourceRef>;

    /// Stop a running resource, keeping it around for reuse
    async fn stop(&self, resource: &ResourceRef) -> Result<()>;

    /// Remove a resource (stopping it first if still running)
    async fn remove(&self, resource: &ResourceRef) -> Result<()>;

    /// List every resource carrying `label` ("key=value")
    async fn list(&self, label: &str) -> Result<Vec<ResourceRef>>;

    /// Liveness check
    async fn ping(&self) -> Result<()>;
}

// Re-exports
pub use docker::{DockerRuntime, DockerRuntimeConfig};
