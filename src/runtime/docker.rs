//! Docker runtime
//!
//! Drives the `docker` CLI to create, start, stop, remove and list
//! challenge containers. Every call is bounded by `call_timeout`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    ContainerRuntime, LaunchSpec, PortMapping, Protocol, ResourceRef, LABEL_CREATED_AT,
};

/// Docker runtime configuration
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Path or name of the docker binary
    pub docker_bin: String,
    /// Upper bound for any single docker invocation
    pub call_timeout: Duration,
    /// Seconds docker waits for a graceful stop before killing
    pub stop_timeout_secs: u32,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            call_timeout: Duration::from_secs(30),
            stop_timeout_secs: 5,
        }
    }
}

/// Container runtime backed by the docker CLI
pub struct DockerRuntime {
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    pub fn new(config: DockerRuntimeConfig) -> Self {
        Self { config }
    }

    /// Run a docker command and return its trimmed stdout
    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!("Running {} {:?}", self.config.docker_bin, args);

        let output = tokio::time::timeout(
            self.config.call_timeout,
            Command::new(&self.config.docker_bin)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "docker {} timed out after {:?}",
                args.first().map(String::as_str).unwrap_or_default(),
                self.config.call_timeout
            )
        })?
        .with_context(|| format!("Failed to run {}", self.config.docker_bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Read the host port mappings of a running container
    async fn port_mappings(&self, id: &str) -> Result<Vec<PortMapping>> {
        let stdout = self
            .docker(&["port".to_string(), id.to_string()])
            .await
            .with_context(|| format!("Failed to read ports of {}", id))?;
        parse_port_output(&stdout)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<ResourceRef> {
        let created_at = Utc::now();

        let mut args = vec!["run".to_string(), "--detach".to_string()];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("--label".to_string());
        args.push(format!("{}={}", LABEL_CREATED_AT, created_at.timestamp()));

        for port in &spec.ports {
            args.push("--publish".to_string());
            args.push(port.to_string());
        }
        args.push(spec.image.clone());

        let id = self
            .docker(&args)
            .await
            .with_context(|| format!("Failed to create container from {}", spec.image))?;
        if id.is_empty() {
            anyhow::bail!("docker run returned no container id for {}", spec.image);
        }

        let ports = match self.port_mappings(&id).await {
            Ok(ports) => ports,
            Err(e) => {
                // Nobody will own the container; take it down now
                if let Err(rm) = self
                    .docker(&["rm".to_string(), "--force".to_string(), id.clone()])
                    .await
                {
                    warn!(
                        "Failed to remove container {} after port lookup failed: {:#}",
                        short_id(&id),
                        rm
                    );
                }
                return Err(e);
            }
        };
        info!(
            "Created container {} from {} ({} ports)",
            short_id(&id),
            spec.image,
            ports.len()
        );

        Ok(ResourceRef {
            id,
            image: spec.image.clone(),
            created_at,
            ports,
        })
    }

    async fn start(&self, mut resource: ResourceRef) -> Result<ResourceRef> {
        self.docker(&["start".to_string(), resource.id.clone()])
            .await
            .with_context(|| format!("Failed to start container {}", short_id(&resource.id)))?;
        resource.ports = self.port_mappings(&resource.id).await?;
        debug!("Restarted container {}", short_id(&resource.id));
        Ok(resource)
    }

    async fn stop(&self, resource: &ResourceRef) -> Result<()> {
        self.docker(&[
            "stop".to_string(),
            "--time".to_string(),
            self.config.stop_timeout_secs.to_string(),
            resource.id.clone(),
        ])
        .await
        .with_context(|| format!("Failed to stop container {}", short_id(&resource.id)))?;
        Ok(())
    }

    async fn remove(&self, resource: &ResourceRef) -> Result<()> {
        match self
            .docker(&["rm".to_string(), "--force".to_string(), resource.id.clone()])
            .await
        {
            Ok(_) => {
                info!("Removed container {}", short_id(&resource.id));
                Ok(())
            }
            // Already gone counts as removed
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove container {}", short_id(&resource.id))),
        }
    }

    async fn list(&self, label: &str) -> Result<Vec<ResourceRef>> {
        let format = format!(
            "{{{{.ID}}}}\t{{{{.Image}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.CreatedAt}}}}",
            LABEL_CREATED_AT
        );
        let stdout = self
            .docker(&[
                "ps".to_string(),
                "--all".to_string(),
                "--no-trunc".to_string(),
                "--filter".to_string(),
                format!("label={}", label),
                "--format".to_string(),
                format,
            ])
            .await
            .context("Failed to list containers")?;

        Ok(parse_list_output(&stdout))
    }

    async fn ping(&self) -> Result<()> {
        let version = self
            .docker(&[
                "info".to_string(),
                "--format".to_string(),
                "{{.ServerVersion}}".to_string(),
            ])
            .await
            .context("Docker daemon is not reachable")?;
        debug!("Docker daemon alive (server {})", version);
        Ok(())
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Parse `docker port` output, e.g.
/// `80/tcp -> 0.0.0.0:32768` and `80/tcp -> [::]:32768`
fn parse_port_output(output: &str) -> Result<Vec<PortMapping>> {
    let mut mappings: Vec<PortMapping> = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (container, host) = line
            .split_once("->")
            .with_context(|| format!("Malformed docker port line: {}", line))?;
        let (port, protocol) = container
            .trim()
            .split_once('/')
            .with_context(|| format!("Malformed container port: {}", container))?;
        let container_port = port.parse::<u16>()?;
        let protocol = match protocol {
            "udp" => Protocol::Udp,
            _ => Protocol::Tcp,
        };
        let host_port = host
            .trim()
            .rsplit_once(':')
            .map(|(_, p)| p)
            .with_context(|| format!("Malformed host address: {}", host))?
            .parse::<u16>()?;

        let mapping = PortMapping {
            container_port,
            protocol,
            host_port,
        };
        // IPv4 and IPv6 bindings report the same mapping twice
        if !mappings.contains(&mapping) {
            mappings.push(mapping);
        }
    }

    Ok(mappings)
}

/// Parse `docker ps` output, skipping lines that cannot be understood so one
/// foreign container does not hide the rest
fn parse_list_output(output: &str) -> Vec<ResourceRef> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_list_line(line) {
            Ok(resource) => Some(resource),
            Err(e) => {
                warn!("Skipping unparsable container listing: {:#}", e);
                None
            }
        })
        .collect()
}

/// Parse one `docker ps` line: id, image, created_at label, CreatedAt
fn parse_list_line(line: &str) -> Result<ResourceRef> {
    let mut fields = line.split('\t');
    let id = fields
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("Missing container id in: {}", line))?;
    let image = fields.next().unwrap_or_default();
    let label = fields.next().unwrap_or_default();
    let docker_created = fields.next().unwrap_or_default();

    let created_at = parse_created_label(label)
        .or_else(|| parse_docker_timestamp(docker_created))
        .with_context(|| format!("Cannot determine creation time of {}", id))?;

    Ok(ResourceRef {
        id: id.to_string(),
        image: image.to_string(),
        created_at,
        ports: Vec::new(),
    })
}

fn parse_created_label(label: &str) -> Option<DateTime<Utc>> {
    let secs = label.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Docker prints e.g. `2024-03-01 12:30:45 +0000 UTC`; podman adds
/// fractional seconds (`12:30:45.123456789`)
fn parse_docker_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let without_zone = value.rsplit_once(' ').map(|(head, _)| head)?;
    DateTime::parse_from_str(without_zone, "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
