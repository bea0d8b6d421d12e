//! Orphan reconciler
//!
//! Periodically lists every runtime resource carrying the managed label and
//! removes the ones neither pooled nor bound to a registered sandbox. This
//! recovers resources leaked by failed teardowns and by restarts, since the
//! pool and registry only live in memory.
//!
//! A resource counts as known when the pool has it free or leased (the
//! ledger covers resources in flight between pool, sandbox and runtime)
//! or a sandbox has it bound. Unknown resources younger than the grace
//! window are left alone: they may have just been created for a start
//! that has not leased them yet.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::ResourcePool;
use super::registry::SandboxRegistry;
use crate::runtime::ContainerRuntime;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Resources the runtime reported
    pub seen: usize,
    /// Resources accounted for by the pool or registry
    pub known: usize,
    /// Unknown resources still inside the grace window
    pub skipped_young: usize,
    /// Orphans stopped and removed
    pub removed: usize,
    /// Orphans whose teardown failed (retried next pass)
    pub failed: usize,
}

pub struct OrphanReconciler {
    runtime: Arc<dyn ContainerRuntime>,
    pool: Arc<ResourcePool>,
    registry: Arc<SandboxRegistry>,
    label: String,
    grace: Duration,
}

impl OrphanReconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        pool: Arc<ResourcePool>,
        registry: Arc<SandboxRegistry>,
        label: impl Into<String>,
        grace: Duration,
    ) -> Self {
        Self {
            runtime,
            pool,
            registry,
            label: label.into(),
            grace,
        }
    }

    /// Run a single pass
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let resources = self.runtime.list(&self.label).await?;
        let bound = self.registry.resource_ids();
        let now = Utc::now();
        let mut report = ReconcileReport {
            seen: resources.len(),
            ..Default::default()
        };

        for resource in resources {
            if self.pool.is_accounted(&resource.id) || bound.contains(&resource.id) {
                report.known += 1;
                continue;
            }

            if resource.age(now) < self.grace {
                debug!(
                    "Skipping young unknown resource {} (age {:?})",
                    resource.id,
                    resource.age(now)
                );
                report.skipped_young += 1;
                continue;
            }

            info!(
                "Removing orphaned resource {} ({}, age {:?})",
                resource.id,
                resource.image,
                resource.age(now)
            );
            if let Err(e) = self.runtime.stop(&resource).await {
                // remove below forces it down anyway
                debug!("Stop of orphan {} failed: {:#}", resource.id, e);
            }
            match self.runtime.remove(&resource).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to remove orphaned resource {}: {:#}", resource.id, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run passes every `interval` until `cancel` fires
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!(
            "Orphan reconciler started (interval {:?}, grace {:?})",
            interval, self.grace
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Orphan reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.reconcile().await {
                        Ok(report) if report.removed > 0 || report.failed > 0 => {
                            info!(
                                "Reconciliation: seen={}, known={}, young={}, removed={}, failed={}",
                                report.seen, report.known, report.skipped_young, report.removed, report.failed
                            );
                        }
                        Ok(report) => debug!("Reconciliation clean: {:?}", report),
                        Err(e) => warn!("Reconciliation pass failed: {:#}", e),
                    }
                }
            }
        }
    }
}
