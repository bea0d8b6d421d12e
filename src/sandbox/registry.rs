//! Sandbox registry
//!
//! In-memory map of live sandboxes keyed by (team, challenge). Callers take
//! the per-key lock from [`SandboxRegistry::lock_key`] before any
//! check-then-act sequence on a key; the map lock itself is only held for
//! map access and never across runtime I/O.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use uuid::Uuid;

use super::entity::{Sandbox, SandboxKey, SandboxState, SandboxView};
use crate::error::SandboxError;
use crate::runtime::ResourceRef;

/// Serializes operations on one (team, challenge) key while held
pub type KeyGuard = OwnedMutexGuard<()>;

/// Deadline bookkeeping returned after a mutation, for the cleaner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pub sandbox_id: Uuid,
    pub key: SandboxKey,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct SandboxRegistry {
    sandboxes: Mutex<HashMap<SandboxKey, Sandbox>>,
    key_locks: Mutex<HashMap<SandboxKey, Arc<tokio::sync::Mutex<()>>>>,
    // Only written while the sandboxes lock is held
    closed: AtomicBool,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sandboxes(&self) -> MutexGuard<'_, HashMap<SandboxKey, Sandbox>> {
        self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the per-key lock. Different keys never contend.
    pub async fn lock_key(&self, key: SandboxKey) -> KeyGuard {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Snapshot of the sandbox at `key`, whatever its state
    pub fn get(&self, key: SandboxKey) -> Option<SandboxView> {
        self.sandboxes().get(&key).map(Sandbox::view)
    }

    /// Snapshot of the sandbox at `key` if it is Active
    pub fn get_active(&self, key: SandboxKey) -> Option<SandboxView> {
        self.sandboxes()
            .get(&key)
            .filter(|s| s.state() == SandboxState::Active)
            .map(Sandbox::view)
    }

    /// Register a `Created` sandbox. Fails if the key is already taken or
    /// the registry has been drained for shutdown.
    pub fn insert_pending(&self, sandbox: Sandbox) -> Result<(), SandboxError> {
        sandbox.ensure_state(SandboxState::Created)?;
        let mut sandboxes = self.sandboxes();
        if self.closed.load(Ordering::SeqCst) {
            return Err(SandboxError::ShuttingDown);
        }
        if let Some(existing) = sandboxes.get(&sandbox.key()) {
            return Err(SandboxError::InvalidState {
                actual: existing.state(),
                expected: SandboxState::Created,
            });
        }
        sandboxes.insert(sandbox.key(), sandbox);
        Ok(())
    }

    /// Bind a resource to the pending sandbox `sandbox_id` at `key`.
    ///
    /// Hands the resource back if that sandbox is gone (e.g. shutdown
    /// drained the registry while the resource was being created).
    pub fn activate(
        &self,
        key: SandboxKey,
        sandbox_id: Uuid,
        resource: ResourceRef,
        ttl: Duration,
        now: Instant,
    ) -> Result<(SandboxView, Tracked), ResourceRef> {
        let mut sandboxes = self.sandboxes();
        match sandboxes.get_mut(&key) {
            Some(sandbox)
                if sandbox.id() == sandbox_id && sandbox.state() == SandboxState::Created =>
            {
                sandbox.activate(resource, ttl, now);
                Ok((sandbox.view(), tracked(sandbox)))
            }
            _ => Err(resource),
        }
    }

    /// Swap the resource of the Active sandbox `sandbox_id` at `key`.
    ///
    /// On success returns the previously bound resource; hands the new
    /// resource back if the sandbox is gone.
    pub fn rebind(
        &self,
        key: SandboxKey,
        sandbox_id: Uuid,
        resource: ResourceRef,
        ttl: Duration,
        now: Instant,
    ) -> Result<(SandboxView, Tracked, Option<ResourceRef>), ResourceRef> {
        let mut sandboxes = self.sandboxes();
        match sandboxes.get_mut(&key) {
            Some(sandbox)
                if sandbox.id() == sandbox_id && sandbox.state() == SandboxState::Active =>
            {
                let old = sandbox.rebind(resource, ttl, now);
                Ok((sandbox.view(), tracked(sandbox), old))
            }
            _ => Err(resource),
        }
    }

    /// Run `f` against the sandbox at `key`
    pub fn with_sandbox<R>(&self, key: SandboxKey, f: impl FnOnce(&mut Sandbox) -> R) -> Option<R> {
        self.sandboxes().get_mut(&key).map(f)
    }

    /// Remove the sandbox at `key`
    pub fn remove(&self, key: SandboxKey) -> Option<Sandbox> {
        self.sandboxes().remove(&key)
    }

    /// Remove the sandbox at `key` only if it is `sandbox_id` and `pred` holds
    pub fn remove_if(
        &self,
        key: SandboxKey,
        sandbox_id: Uuid,
        pred: impl FnOnce(&Sandbox) -> bool,
    ) -> Option<Sandbox> {
        let mut sandboxes = self.sandboxes();
        let matches = sandboxes
            .get(&key)
            .is_some_and(|sandbox| sandbox.id() == sandbox_id && pred(sandbox));
        if matches {
            sandboxes.remove(&key)
        } else {
            None
        }
    }

    /// Runtime ids of every resource currently bound to a sandbox
    pub fn resource_ids(&self) -> HashSet<String> {
        self.sandboxes()
            .values()
            .filter_map(|s| s.resource().map(|r| r.id.clone()))
            .collect()
    }

    /// Number of registered sandboxes (any state)
    pub fn len(&self) -> usize {
        self.sandboxes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes().is_empty()
    }

    /// Whether `drain` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take every sandbox out and refuse new ones (used on shutdown)
    pub fn drain(&self) -> Vec<Sandbox> {
        let mut sandboxes = self.sandboxes();
        self.closed.store(true, Ordering::SeqCst);
        sandboxes.drain().map(|(_, s)| s).collect()
    }
}

fn tracked(sandbox: &Sandbox) -> Tracked {
    Tracked {
        sandbox_id: sandbox.id(),
        key: sandbox.key(),
        // Active sandboxes always carry a deadline
        deadline: sandbox.deadline().unwrap_or_else(Instant::now),
    }
}

impl Tracked {
    /// Bookkeeping for an Active sandbox, `None` otherwise
    pub fn of(sandbox: &Sandbox) -> Option<Self> {
        (sandbox.state() == SandboxState::Active).then(|| tracked(sandbox))
    }
}
