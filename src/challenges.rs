//! Challenge catalog: which image each challenge runs and how its sandboxes behave

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::config::ManagerConfig;
use crate::runtime::PortSpec;
use crate::sandbox::PoolKey;

/// Configuration for a single challenge
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    pub id: i64,
    /// Display name (e.g. "web-101")
    pub name: String,
    /// Image every sandbox of this challenge runs
    pub image: String,
    /// Ports to publish
    pub ports: Vec<PortSpec>,
    /// Lifetime of a sandbox without extension
    pub ttl: Duration,
    /// Maximum stopped resources kept for reuse
    pub pool_size: usize,
    /// Whether stopped resources may be handed to another team.
    /// Non-reusable challenges bypass the pool entirely.
    pub reusable: bool,
    /// Maximum number of TTL extensions per sandbox (0 = unlimited)
    pub max_extensions: u32,
}

impl ChallengeConfig {
    /// Key of the free list this challenge's resources belong to
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.id, &self.image)
    }
}

/// Raw TOML configuration for a challenge
#[derive(Debug, Deserialize)]
struct RawChallengeConfig {
    id: i64,
    #[serde(default)]
    name: Option<String>,
    image: String,
    #[serde(default)]
    ports: Vec<String>,
    ttl_secs: Option<u64>,
    pool_size: Option<usize>,
    #[serde(default = "default_reusable")]
    reusable: bool,
    #[serde(default)]
    max_extensions: u32,
}

fn default_reusable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default, rename = "challenge")]
    challenges: Vec<RawChallengeConfig>,
}

/// All challenges that can be instanced, keyed by challenge id
#[derive(Debug, Clone, Default)]
pub struct ChallengeCatalog {
    challenges: HashMap<i64, ChallengeConfig>,
}

impl ChallengeCatalog {
    /// Load the catalog from a TOML file
    pub fn from_file(path: impl AsRef<Path>, defaults: &ManagerConfig) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read challenge config {}", path.display()))?;
        Self::from_toml(&content, defaults)
            .with_context(|| format!("Invalid challenge config {}", path.display()))
    }

    /// Parse the catalog from TOML content
    pub fn from_toml(content: &str, defaults: &ManagerConfig) -> anyhow::Result<Self> {
        let raw: RawCatalog = toml::from_str(content)?;

        let mut challenges = HashMap::new();
        for raw in raw.challenges {
            let id = raw.id;
            if raw.image.trim().is_empty() {
                anyhow::bail!("Challenge {} has an empty image", id);
            }

            let ports = raw
                .ports
                .iter()
                .map(|p| p.parse::<PortSpec>())
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("Invalid ports for challenge {}", id))?;

            let ttl = raw
                .ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl);
            if ttl.is_zero() {
                anyhow::bail!("Challenge {} has a zero TTL", id);
            }

            let config = ChallengeConfig {
                id,
                name: raw.name.unwrap_or_else(|| format!("challenge-{}", id)),
                image: raw.image.trim().to_string(),
                ports,
                ttl,
                pool_size: raw.pool_size.unwrap_or(defaults.default_pool_size),
                reusable: raw.reusable,
                max_extensions: raw.max_extensions,
            };

            if challenges.insert(id, config).is_some() {
                anyhow::bail!("Duplicate challenge id {}", id);
            }
        }

        Ok(Self { challenges })
    }

    /// Build a catalog from already-typed configs
    pub fn from_configs(configs: impl IntoIterator<Item = ChallengeConfig>) -> Self {
        Self {
            challenges: configs.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    /// Get a challenge by id
    pub fn get(&self, challenge_id: i64) -> Option<&ChallengeConfig> {
        self.challenges.get(&challenge_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChallengeConfig> {
        self.challenges.values()
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}
