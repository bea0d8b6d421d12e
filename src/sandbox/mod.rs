//! Sandbox module - Lifecycle of per-(team, challenge) sandboxes
//!
//! This module owns the bookkeeping side of sandboxes:
//! - `Sandbox` entity and its `Created -> Active -> Terminated` state machine
//! - `ResourcePool`: bounded per-challenge free lists plus the lease ledger
//! - `SandboxRegistry`: at most one live sandbox per key, per-key locks
//! - `Cleaner`: deadline-ordered expiry scheduler
//! - `OrphanReconciler`: removes managed resources nobody accounts for
//! - `SandboxManager`: the start/stop/extend/regenerate API on top
//!
//! The sandbox module does NOT:
//! - Talk to Docker directly (that's the runtime's job)
//! - Parse jobs or publish results
//! - Persist anything; state is rebuilt by reconciliation after a restart

pub mod cleaner;
pub mod entity;
pub mod manager;
pub mod pool;
pub mod reconciler;
pub mod registry;

// Re-exports for convenience
pub use cleaner::{Cleaner, ExpiryHandler};
pub use entity::{Sandbox, SandboxKey, SandboxState, SandboxView};
pub use manager::SandboxManager;
pub use pool::{LeaseGuard, PoolKey, ResourcePool};
pub use reconciler::{OrphanReconciler, ReconcileReport};
pub use registry::{KeyGuard, SandboxRegistry, Tracked};
