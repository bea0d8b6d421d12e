//! Error types returned by the sandbox lifecycle manager

use crate::runtime::ResourceRef;
use crate::sandbox::SandboxState;

/// Errors surfaced to callers of the sandbox manager
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Unknown challenge: {0}")]
    UnknownChallenge(i64),

    #[error("No active sandbox for team {team_id} on challenge {challenge_id}")]
    NotFound { team_id: i64, challenge_id: i64 },

    #[error("Sandbox is {actual}, expected {expected}")]
    InvalidState {
        actual: SandboxState,
        expected: SandboxState,
    },

    #[error("Sandbox for team {team_id} on challenge {challenge_id} cannot be extended again (limit {limit})")]
    ExtensionLimitReached {
        team_id: i64,
        challenge_id: i64,
        limit: u32,
    },

    #[error("Sandbox manager is shutting down")]
    ShuttingDown,

    /// The container runtime failed to provide a resource
    #[error("Container runtime failure: {0:#}")]
    Runtime(#[source] anyhow::Error),
}

impl SandboxError {
    /// Whether the caller should present this as "service temporarily unavailable"
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::Runtime(_) | SandboxError::ShuttingDown)
    }
}

/// Errors from the resource pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The free list for this key is at capacity; the resource is handed back
    /// so the caller can tear it down instead of leaking it.
    #[error("Pool is full for challenge {challenge_id}, resource {} must be torn down", .resource.id)]
    Full {
        challenge_id: i64,
        resource: ResourceRef,
    },

    /// The pool was drained for shutdown and takes nothing back
    #[error("Pool is closed, resource {} must be torn down", .resource.id)]
    Closed { resource: ResourceRef },
}

impl PoolError {
    /// Take back ownership of the rejected resource
    pub fn into_resource(self) -> ResourceRef {
        match self {
            PoolError::Full { resource, .. } | PoolError::Closed { resource } => resource,
        }
    }
}
