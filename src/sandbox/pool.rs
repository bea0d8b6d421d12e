//! Resource pool
//!
//! Per-challenge bounded free lists of stopped resources that can be
//! restarted for another team instead of creating a new one.
//! The lock is held only for list mutation; no runtime I/O happens here.
//!
//! The pool also keeps the ledger of leased resources: everything handed
//! out by `acquire` or registered with `lease` stays leased (bound to a
//! sandbox or in flight to/from the runtime) until it is released back or
//! forgotten after teardown. Moving between free and leased happens under
//! one lock, so `is_accounted` never misses a resource in transit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::PoolError;
use crate::runtime::ResourceRef;

/// Which free list a resource belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub challenge_id: i64,
    pub image: String,
}

impl PoolKey {
    pub fn new(challenge_id: i64, image: impl Into<String>) -> Self {
        Self {
            challenge_id,
            image: image.into(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    free: HashMap<PoolKey, VecDeque<ResourceRef>>,
    capacities: HashMap<PoolKey, usize>,
    leased: HashSet<String>,
    closed: bool,
}

/// Bounded free lists of reusable resources
#[derive(Debug)]
pub struct ResourcePool {
    inner: Mutex<PoolInner>,
    default_capacity: usize,
}

impl ResourcePool {
    /// Create a pool; keys without an explicit capacity use `default_capacity`
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            default_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the capacity of one key.
    ///
    /// Returns the resources that no longer fit so the caller can tear them down.
    pub fn set_capacity(&self, key: &PoolKey, capacity: usize) -> Vec<ResourceRef> {
        let mut inner = self.lock();
        inner.capacities.insert(key.clone(), capacity);
        match inner.free.get_mut(key) {
            Some(list) if list.len() > capacity => list.drain(capacity..).collect(),
            _ => Vec::new(),
        }
    }

    /// Capacity configured for `key`
    pub fn capacity(&self, key: &PoolKey) -> usize {
        self.lock()
            .capacities
            .get(key)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    /// Pop the oldest free resource for `key`, if any, and mark it leased
    pub fn acquire(&self, key: &PoolKey) -> Option<ResourceRef> {
        let mut inner = self.lock();
        let resource = inner.free.get_mut(key)?.pop_front()?;
        inner.leased.insert(resource.id.clone());
        Some(resource)
    }

    /// Record a freshly created resource as leased
    pub fn lease(&self, resource: &ResourceRef) {
        self.lock().leased.insert(resource.id.clone());
    }

    /// Drop a resource from the ledger once it has been torn down (or its
    /// teardown failed and it is left to the reconciler)
    pub fn forget(&self, resource_id: &str) {
        self.lock().leased.remove(resource_id);
    }

    /// Guard a leased id until it is bound to a sandbox or torn down.
    ///
    /// Dropping the guard armed forgets the id, so a caller that goes away
    /// mid-flight leaves the resource to the reconciler instead of keeping it
    /// accounted forever.
    pub fn guard(&self, resource_id: &str) -> LeaseGuard<'_> {
        LeaseGuard {
            pool: self,
            resource_id: Some(resource_id.to_string()),
        }
    }

    /// Return a stopped resource to its free list.
    ///
    /// Fails with `PoolError::Full` (handing the resource back, still
    /// leased) when the list is already at capacity, and with
    /// `PoolError::Closed` once the pool has been drained.
    pub fn release(&self, resource: ResourceRef, key: &PoolKey) -> Result<(), PoolError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PoolError::Closed { resource });
        }
        let capacity = inner
            .capacities
            .get(key)
            .copied()
            .unwrap_or(self.default_capacity);

        let list = inner.free.entry(key.clone()).or_default();
        if list.len() >= capacity {
            return Err(PoolError::Full {
                challenge_id: key.challenge_id,
                resource,
            });
        }
        let id = resource.id.clone();
        list.push_back(resource);
        inner.leased.remove(&id);
        Ok(())
    }

    /// Whether a resource is free in a pool or leased out
    pub fn is_accounted(&self, resource_id: &str) -> bool {
        let inner = self.lock();
        inner.leased.contains(resource_id)
            || inner
                .free
                .values()
                .any(|list| list.iter().any(|r| r.id == resource_id))
    }

    /// Number of leased resources
    pub fn leased(&self) -> usize {
        self.lock().leased.len()
    }

    /// Number of free resources for `key`
    pub fn len(&self, key: &PoolKey) -> usize {
        self.lock().free.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// Total number of free resources across all keys
    pub fn total(&self) -> usize {
        self.lock().free.values().map(VecDeque::len).sum()
    }

    /// Take every free resource out, marking them leased, and refuse any
    /// further release (used on shutdown)
    pub fn drain(&self) -> Vec<ResourceRef> {
        let mut inner = self.lock();
        inner.closed = true;
        let drained: Vec<ResourceRef> = inner.free.drain().flat_map(|(_, list)| list).collect();
        inner.leased.extend(drained.iter().map(|r| r.id.clone()));
        drained
    }
}

/// Forgets its lease on drop unless disarmed
#[must_use = "dropping the guard forgets the lease immediately"]
pub struct LeaseGuard<'a> {
    pool: &'a ResourcePool,
    resource_id: Option<String>,
}

impl LeaseGuard<'_> {
    /// The resource reached its owner; keep the lease
    pub fn disarm(mut self) {
        self.resource_id = None;
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.resource_id.take() {
            self.pool.forget(&id);
        }
    }
}
