//! Expiry scheduler ("cleaner")
//!
//! Keeps every Active sandbox's deadline in order and sleeps until the
//! nearest one. Tracking an earlier deadline (or untracking the nearest)
//! wakes the loop through a `Notify`; notifications sent before the loop
//! gets to them collapse into a single stored permit, so a burst of
//! updates costs one wake-up.
//!
//! Expired entries are handed to an [`ExpiryHandler`] on their own task,
//! so a slow runtime never stalls the loop.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::registry::Tracked;

/// Fallback wait when nothing is tracked
pub const IDLE_WAIT: Duration = Duration::from_secs(30);

/// Receives sandboxes whose deadline has passed
#[async_trait]
pub trait ExpiryHandler: Send + Sync + 'static {
    async fn expire(&self, entry: Tracked);
}

#[derive(Debug, Default)]
struct Schedule {
    by_deadline: BTreeSet<(Instant, Uuid)>,
    entries: HashMap<Uuid, Tracked>,
}

impl Schedule {
    fn nearest(&self) -> Option<Instant> {
        self.by_deadline.first().map(|(deadline, _)| *deadline)
    }

    fn remove(&mut self, sandbox_id: Uuid) -> Option<Tracked> {
        let entry = self.entries.remove(&sandbox_id)?;
        self.by_deadline.remove(&(entry.deadline, sandbox_id));
        Some(entry)
    }
}

/// Deadline-driven expiry scheduler
#[derive(Debug, Default)]
pub struct Cleaner {
    schedule: Mutex<Schedule>,
    wake: Notify,
}

impl Cleaner {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `entry`, replacing any earlier deadline for the same sandbox
    pub fn track(&self, entry: Tracked) {
        let changed = {
            let mut schedule = self.schedule();
            let before = schedule.nearest();
            schedule.remove(entry.sandbox_id);
            schedule.entries.insert(entry.sandbox_id, entry);
            schedule
                .by_deadline
                .insert((entry.deadline, entry.sandbox_id));
            schedule.nearest() != before
        };
        if changed {
            self.wake.notify_one();
        }
    }

    /// Stop tracking a sandbox. Returns whether it was tracked.
    pub fn untrack(&self, sandbox_id: Uuid) -> bool {
        let (removed, changed) = {
            let mut schedule = self.schedule();
            let before = schedule.nearest();
            let removed = schedule.remove(sandbox_id).is_some();
            (removed, schedule.nearest() != before)
        };
        if changed {
            self.wake.notify_one();
        }
        removed
    }

    /// Whether a sandbox is currently tracked
    pub fn is_tracked(&self, sandbox_id: Uuid) -> bool {
        self.schedule().entries.contains_key(&sandbox_id)
    }

    /// Nearest tracked deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.schedule().nearest()
    }

    pub fn len(&self) -> usize {
        self.schedule().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedule().entries.is_empty()
    }

    /// Remove and return every entry whose deadline is at or before `now`
    fn take_expired(&self, now: Instant) -> Vec<Tracked> {
        let mut schedule = self.schedule();
        let mut expired = Vec::new();
        while let Some(&(deadline, sandbox_id)) = schedule.by_deadline.first() {
            if deadline > now {
                break;
            }
            if let Some(entry) = schedule.remove(sandbox_id) {
                expired.push(entry);
            }
        }
        expired
    }

    /// Run the expiry loop until `cancel` fires
    pub async fn run(self: Arc<Self>, handler: Arc<dyn ExpiryHandler>, cancel: CancellationToken) {
        info!("Cleaner started");

        loop {
            let wake_at = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cleaner stopped ({} sandboxes still tracked)", self.len());
                    return;
                }
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.wake.notified() => {
                    debug!("Cleaner woken by deadline change");
                }
            }

            let expired = self.take_expired(Instant::now());
            if !expired.is_empty() {
                debug!("Cleaner expiring {} sandboxes", expired.len());
            }
            for entry in expired {
                let handler = handler.clone();
                tokio::spawn(async move { handler.expire(entry).await });
            }
        }
    }
}
