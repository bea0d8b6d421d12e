//! Sandbox entity and its lifecycle state machine
//!
//! `Created -> Active -> Terminated`. A sandbox owns its backing resource
//! while Active; terminating hands the resource back to the caller.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::runtime::{PortMapping, ResourceRef};

/// Registry key: at most one live sandbox per (team, challenge)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxKey {
    pub team_id: i64,
    pub challenge_id: i64,
}

impl SandboxKey {
    pub fn new(team_id: i64, challenge_id: i64) -> Self {
        Self {
            team_id,
            challenge_id,
        }
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "team={} challenge={}", self.team_id, self.challenge_id)
    }
}

/// Lifecycle state of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Requested, not yet bound to a resource
    Created,
    /// Bound to a resource with a live deadline
    Active,
    /// Resource released or torn down
    Terminated,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Created => "created",
            SandboxState::Active => "active",
            SandboxState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// A per-(team, challenge) sandbox instance
#[derive(Debug)]
pub struct Sandbox {
    id: Uuid,
    user_id: i64,
    key: SandboxKey,
    created_at: DateTime<Utc>,
    state: SandboxState,
    resource: Option<ResourceRef>,
    deadline: Option<Instant>,
    extensions: u32,
}

impl Sandbox {
    /// Create a sandbox in the `Created` state
    pub fn new(user_id: i64, key: SandboxKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            key,
            created_at: Utc::now(),
            state: SandboxState::Created,
            resource: None,
            deadline: None,
            extensions: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn key(&self) -> SandboxKey {
        self.key
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn extensions(&self) -> u32 {
        self.extensions
    }

    pub fn resource(&self) -> Option<&ResourceRef> {
        self.resource.as_ref()
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Fail with `InvalidState` unless the sandbox is in `expected`
    pub fn ensure_state(&self, expected: SandboxState) -> Result<(), SandboxError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SandboxError::InvalidState {
                actual: self.state,
                expected,
            })
        }
    }

    /// `Created -> Active`: bind the resource and start the TTL window.
    /// Callers check `ensure_state(Created)` before obtaining the resource.
    pub(crate) fn activate(&mut self, resource: ResourceRef, ttl: Duration, now: Instant) {
        debug_assert_eq!(self.state, SandboxState::Created);
        self.resource = Some(resource);
        self.deadline = Some(now + ttl);
        self.state = SandboxState::Active;
    }

    /// `Active -> Active`: push the deadline to `now + ttl`.
    ///
    /// The deadline never moves backward; returns the resulting deadline.
    pub fn extend(&mut self, ttl: Duration, now: Instant) -> Result<Instant, SandboxError> {
        self.ensure_state(SandboxState::Active)?;
        let candidate = now + ttl;
        let deadline = match self.deadline {
            Some(current) if current >= candidate => current,
            _ => candidate,
        };
        self.deadline = Some(deadline);
        self.extensions += 1;
        Ok(deadline)
    }

    /// `Active -> Active`: bind a fresh resource and reset the TTL window.
    /// Returns the previously bound resource.
    /// Callers check `ensure_state(Active)` before obtaining the resource.
    pub(crate) fn rebind(
        &mut self,
        resource: ResourceRef,
        ttl: Duration,
        now: Instant,
    ) -> Option<ResourceRef> {
        debug_assert_eq!(self.state, SandboxState::Active);
        self.deadline = Some(now + ttl);
        self.extensions = 0;
        self.resource.replace(resource)
    }

    /// `Created | Active -> Terminated`, handing back the bound resource
    pub fn terminate(&mut self) -> Result<Option<ResourceRef>, SandboxError> {
        if self.state == SandboxState::Terminated {
            return Err(SandboxError::InvalidState {
                actual: SandboxState::Terminated,
                expected: SandboxState::Active,
            });
        }
        self.state = SandboxState::Terminated;
        self.deadline = None;
        Ok(self.resource.take())
    }

    /// Snapshot for callers outside the manager
    pub fn view(&self) -> SandboxView {
        let expires_at = self.deadline.map(|deadline| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            Utc::now() + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero())
        });

        SandboxView {
            id: self.id,
            user_id: self.user_id,
            team_id: self.key.team_id,
            challenge_id: self.key.challenge_id,
            state: self.state,
            resource_id: self.resource.as_ref().map(|r| r.id.clone()),
            ports: self
                .resource
                .as_ref()
                .map(|r| r.ports.clone())
                .unwrap_or_default(),
            created_at: self.created_at,
            expires_at,
            extensions: self.extensions,
        }
    }
}

/// Serializable snapshot of a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxView {
    pub id: Uuid,
    pub user_id: i64,
    pub team_id: i64,
    pub challenge_id: i64,
    pub state: SandboxState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub ports: Vec<PortMapping>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub extensions: u32,
}
