//! Sandbox manager - the lifecycle API
//!
//! Ties the pool, registry, cleaner and container runtime together:
//! - `start_sandbox`: reuse a pooled resource or create one, register, schedule expiry
//! - `stop_sandbox`: unregister, unschedule, release to the pool or tear down
//! - `extend_sandbox_ttl`: push the deadline forward
//! - `regenerate_sandbox`: swap in a fresh resource and reset the TTL window
//!
//! Every operation on a (team, challenge) key runs under that key's lock.
//! Resource teardown after the sandbox left the registry happens outside it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cleaner::{Cleaner, ExpiryHandler};
use super::entity::{Sandbox, SandboxKey, SandboxState, SandboxView};
use super::pool::{LeaseGuard, ResourcePool};
use super::registry::{SandboxRegistry, Tracked};
use crate::challenges::{ChallengeCatalog, ChallengeConfig};
use crate::config::ManagerConfig;
use crate::error::SandboxError;
use crate::runtime::{ContainerRuntime, LaunchSpec, ResourceRef, LABEL_CHALLENGE};

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    pool: Arc<ResourcePool>,
    registry: Arc<SandboxRegistry>,
    cleaner: Arc<Cleaner>,
    catalog: ChallengeCatalog,
    config: ManagerConfig,
}

impl SandboxManager {
    /// Wire the manager to its collaborators and size every challenge's pool
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        pool: Arc<ResourcePool>,
        registry: Arc<SandboxRegistry>,
        cleaner: Arc<Cleaner>,
        catalog: ChallengeCatalog,
        config: ManagerConfig,
    ) -> Self {
        let manager = Self {
            runtime,
            pool,
            registry,
            cleaner,
            catalog,
            config,
        };

        for challenge in manager.catalog.iter() {
            let capacity = if manager.pooling(challenge) {
                challenge.pool_size
            } else {
                0
            };
            manager.pool.set_capacity(&challenge.pool_key(), capacity);
        }

        manager
    }

    /// Start (or return the already running) sandbox for `team_id` on `challenge_id`
    pub async fn start_sandbox(
        &self,
        user_id: i64,
        team_id: i64,
        challenge_id: i64,
    ) -> Result<SandboxView, SandboxError> {
        let challenge = self.challenge(challenge_id)?;
        let key = SandboxKey::new(team_id, challenge_id);
        let _guard = self.registry.lock_key(key).await;

        match self.registry.get(key) {
            Some(existing) if existing.state == SandboxState::Active => {
                debug!("Sandbox {} already active for {}", existing.id, key);
                return Ok(existing);
            }
            // Left behind by a start whose caller went away mid-flight
            Some(stale) => {
                warn!("Discarding stale {} sandbox {} for {}", stale.state, stale.id, key);
                self.registry.remove_if(key, stale.id, |_| true);
            }
            None => {}
        }

        let sandbox = Sandbox::new(user_id, key);
        let sandbox_id = sandbox.id();
        self.registry.insert_pending(sandbox)?;

        let (resource, lease) = match self.provision(challenge).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                self.registry
                    .remove_if(key, sandbox_id, |s| s.state() == SandboxState::Created);
                warn!("Failed to provision sandbox for {}: {:#}", key, e);
                return Err(SandboxError::Runtime(e));
            }
        };

        match self
            .registry
            .activate(key, sandbox_id, resource, challenge.ttl, Instant::now())
        {
            Ok((view, tracked)) => {
                lease.disarm();
                self.cleaner.track(tracked);
                info!(
                    "Started sandbox {} for {} (user {}, resource {})",
                    view.id,
                    key,
                    user_id,
                    view.resource_id.as_deref().unwrap_or("-")
                );
                Ok(view)
            }
            Err(resource) => {
                // The registry was drained while the resource was starting
                self.teardown(resource).await;
                Err(SandboxError::ShuttingDown)
            }
        }
    }

    /// Stop the active sandbox for `team_id` on `challenge_id`
    pub async fn stop_sandbox(&self, team_id: i64, challenge_id: i64) -> Result<(), SandboxError> {
        let key = SandboxKey::new(team_id, challenge_id);
        let guard = self.registry.lock_key(key).await;

        let mut sandbox = self
            .registry
            .remove(key)
            .ok_or(SandboxError::NotFound {
                team_id,
                challenge_id,
            })?;
        self.cleaner.untrack(sandbox.id());
        let resource = sandbox.terminate()?;
        drop(guard);

        info!("Stopped sandbox {} for {}", sandbox.id(), key);
        if let Some(resource) = resource {
            self.reclaim(resource, challenge_id).await;
        }
        Ok(())
    }

    /// Push the deadline of the active sandbox to `now + ttl` (never backward)
    pub async fn extend_sandbox_ttl(
        &self,
        team_id: i64,
        challenge_id: i64,
    ) -> Result<SandboxView, SandboxError> {
        let challenge = self.challenge(challenge_id)?;
        let key = SandboxKey::new(team_id, challenge_id);
        let _guard = self.registry.lock_key(key).await;

        let (view, tracked) = self
            .registry
            .with_sandbox(key, |sandbox| -> Result<_, SandboxError> {
                sandbox.ensure_state(SandboxState::Active)?;
                if challenge.max_extensions > 0 && sandbox.extensions() >= challenge.max_extensions
                {
                    return Err(SandboxError::ExtensionLimitReached {
                        team_id,
                        challenge_id,
                        limit: challenge.max_extensions,
                    });
                }
                sandbox.extend(challenge.ttl, Instant::now())?;
                Ok((sandbox.view(), Tracked::of(sandbox)))
            })
            .ok_or(SandboxError::NotFound {
                team_id,
                challenge_id,
            })??;

        if let Some(tracked) = tracked {
            self.cleaner.track(tracked);
        }
        info!(
            "Extended sandbox {} for {} (extension {})",
            view.id, key, view.extensions
        );
        Ok(view)
    }

    /// Replace the resource behind the active sandbox with a fresh one.
    ///
    /// The new resource is obtained first; if that fails the sandbox keeps
    /// its current resource. The old resource is removed, never pooled.
    pub async fn regenerate_sandbox(
        &self,
        team_id: i64,
        challenge_id: i64,
    ) -> Result<SandboxView, SandboxError> {
        let challenge = self.challenge(challenge_id)?;
        let key = SandboxKey::new(team_id, challenge_id);
        let guard = self.registry.lock_key(key).await;

        let current = self.registry.get(key).ok_or(SandboxError::NotFound {
            team_id,
            challenge_id,
        })?;
        if current.state != SandboxState::Active {
            return Err(SandboxError::InvalidState {
                actual: current.state,
                expected: SandboxState::Active,
            });
        }

        let (resource, lease) = self.provision(challenge).await.map_err(|e| {
            warn!("Failed to regenerate sandbox {} for {}: {:#}", current.id, key, e);
            SandboxError::Runtime(e)
        })?;

        match self
            .registry
            .rebind(key, current.id, resource, challenge.ttl, Instant::now())
        {
            Ok((view, tracked, old)) => {
                lease.disarm();
                self.cleaner.track(tracked);
                drop(guard);
                info!(
                    "Regenerated sandbox {} for {} (resource {})",
                    view.id,
                    key,
                    view.resource_id.as_deref().unwrap_or("-")
                );
                if let Some(old) = old {
                    self.teardown(old).await;
                }
                Ok(view)
            }
            Err(resource) => {
                drop(guard);
                self.teardown(resource).await;
                Err(SandboxError::ShuttingDown)
            }
        }
    }

    /// Snapshot of the active sandbox for `team_id` on `challenge_id`
    pub fn get_sandbox(&self, team_id: i64, challenge_id: i64) -> Option<SandboxView> {
        self.registry
            .get_active(SandboxKey::new(team_id, challenge_id))
    }

    /// Liveness of the container runtime
    pub async fn ping(&self) -> Result<()> {
        self.runtime.ping().await
    }

    /// Tear down every active and pooled resource and refuse new sandboxes
    pub async fn shutdown(&self) {
        let sandboxes = self.registry.drain();
        let active = sandboxes.len();
        for mut sandbox in sandboxes {
            self.cleaner.untrack(sandbox.id());
            if let Ok(Some(resource)) = sandbox.terminate() {
                self.teardown(resource).await;
            }
        }

        let pooled = self.pool.drain();
        let pooled_count = pooled.len();
        for resource in pooled {
            self.teardown(resource).await;
        }

        info!(
            "Sandbox manager shut down ({} active, {} pooled resources torn down)",
            active, pooled_count
        );
    }

    fn challenge(&self, challenge_id: i64) -> Result<&ChallengeConfig, SandboxError> {
        self.catalog
            .get(challenge_id)
            .ok_or(SandboxError::UnknownChallenge(challenge_id))
    }

    fn pooling(&self, challenge: &ChallengeConfig) -> bool {
        self.config.reuse_resources && challenge.reusable
    }

    fn launch_spec(&self, challenge: &ChallengeConfig) -> LaunchSpec {
        let managed = match self.config.managed_label.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (self.config.managed_label.clone(), "true".to_string()),
        };
        LaunchSpec {
            image: challenge.image.clone(),
            ports: challenge.ports.clone(),
            labels: vec![
                managed,
                (LABEL_CHALLENGE.to_string(), challenge.id.to_string()),
            ],
        }
    }

    /// Get a running resource for `challenge`: a restarted pooled one if
    /// possible, otherwise a new one. The result is leased in the pool ledger
    /// and stays guarded until the caller disarms the lease.
    async fn provision(
        &self,
        challenge: &ChallengeConfig,
    ) -> Result<(ResourceRef, LeaseGuard<'_>)> {
        if self.pooling(challenge) {
            while let Some(pooled) = self.pool.acquire(&challenge.pool_key()) {
                let lease = self.pool.guard(&pooled.id);
                let id = pooled.id.clone();
                match self.runtime.start(pooled).await {
                    Ok(resource) => {
                        debug!("Reusing pooled resource {} for challenge {}", id, challenge.id);
                        return Ok((resource, lease));
                    }
                    Err(e) => {
                        warn!(
                            "Pooled resource {} failed to start, leaving it to the reconciler: {:#}",
                            id, e
                        );
                        drop(lease);
                    }
                }
            }
        }

        let resource = self
            .runtime
            .create_and_start(&self.launch_spec(challenge))
            .await?;
        self.pool.lease(&resource);
        let lease = self.pool.guard(&resource.id);
        debug!(
            "Created resource {} for challenge {} ({})",
            resource.id, challenge.id, challenge.image
        );
        Ok((resource, lease))
    }

    /// Stop a released resource and return it to its pool, or tear it down
    /// when the challenge does not pool or the pool is full
    async fn reclaim(&self, resource: ResourceRef, challenge_id: i64) {
        let key = match self.catalog.get(challenge_id) {
            Some(challenge) if self.pooling(challenge) => challenge.pool_key(),
            _ => return self.teardown(resource).await,
        };

        // Full pool: remove without stopping first
        if self.pool.len(&key) >= self.pool.capacity(&key) {
            debug!(
                "Pool for challenge {} is full, removing {}",
                challenge_id, resource.id
            );
            return self.teardown(resource).await;
        }

        if let Err(e) = self.runtime.stop(&resource).await {
            warn!(
                "Failed to stop resource {}, leaving it to the reconciler: {:#}",
                resource.id, e
            );
            self.pool.forget(&resource.id);
            return;
        }

        match self.pool.release(resource, &key) {
            Ok(()) => debug!("Returned resource to pool for challenge {}", challenge_id),
            Err(e) => {
                debug!("{}", e);
                self.teardown(e.into_resource()).await;
            }
        }
    }

    /// Remove a resource for good. Failures are logged and the resource is
    /// dropped from the ledger so the reconciler collects it.
    async fn teardown(&self, resource: ResourceRef) {
        if let Err(e) = self.runtime.remove(&resource).await {
            warn!(
                "Failed to remove resource {}, leaving it to the reconciler: {:#}",
                resource.id, e
            );
        }
        self.pool.forget(&resource.id);
    }
}

#[async_trait]
impl ExpiryHandler for SandboxManager {
    async fn expire(&self, entry: Tracked) {
        let guard = self.registry.lock_key(entry.key).await;

        // An ExtendTTL or Regenerate that won the race moved the deadline
        let now = Instant::now();
        let removed = self.registry.remove_if(entry.key, entry.sandbox_id, |s| {
            s.state() == SandboxState::Active && s.is_expired(now)
        });
        let Some(mut sandbox) = removed else {
            debug!("Expiry of sandbox {} skipped: no longer due", entry.sandbox_id);
            return;
        };
        self.cleaner.untrack(sandbox.id());
        let resource = sandbox.terminate();
        drop(guard);

        info!("Sandbox {} for {} expired", sandbox.id(), entry.key);
        if let Ok(Some(resource)) = resource {
            self.reclaim(resource, entry.key.challenge_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PortSpec;
    use crate::sandbox::OrphanReconciler;
    use crate::testing::FakeRuntime;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        manager: Arc<SandboxManager>,
        runtime: Arc<FakeRuntime>,
        pool: Arc<ResourcePool>,
        registry: Arc<SandboxRegistry>,
        cleaner: Arc<Cleaner>,
    }

    fn challenge(id: i64, ttl: Duration) -> ChallengeConfig {
        ChallengeConfig {
            id,
            name: format!("chall-{}", id),
            image: format!("ctf/chall-{}:latest", id),
            ports: vec![PortSpec::tcp(1337)],
            ttl,
            pool_size: 2,
            reusable: true,
            max_extensions: 0,
        }
    }

    fn harness(challenges: Vec<ChallengeConfig>) -> Harness {
        let runtime = Arc::new(FakeRuntime::new());
        let config = ManagerConfig::default();
        let pool = Arc::new(ResourcePool::new(config.default_pool_size));
        let registry = Arc::new(SandboxRegistry::new());
        let cleaner = Arc::new(Cleaner::new());
        let manager = Arc::new(SandboxManager::new(
            runtime.clone(),
            pool.clone(),
            registry.clone(),
            cleaner.clone(),
            ChallengeCatalog::from_configs(challenges),
            config,
        ));
        Harness {
            manager,
            runtime,
            pool,
            registry,
            cleaner,
        }
    }

    fn one_hour() -> Duration {
        Duration::from_secs(3600)
    }

    #[tokio::test]
    async fn test_start_creates_and_schedules() {
        let h = harness(vec![challenge(1, one_hour())]);

        let view = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        assert_eq!(view.state, SandboxState::Active);
        assert_eq!(view.user_id, 10);
        assert_eq!(view.ports.len(), 1);
        assert_eq!(view.ports[0].container_port, 1337);
        assert_eq!(h.runtime.create_count(), 1);
        assert!(h.cleaner.is_tracked(view.id));
        assert_eq!(h.manager.get_sandbox(1, 1).map(|v| v.id), Some(view.id));
    }

    #[tokio::test]
    async fn test_unknown_challenge_rejected() {
        let h = harness(vec![challenge(1, one_hour())]);
        assert!(matches!(
            h.manager.start_sandbox(10, 1, 99).await,
            Err(SandboxError::UnknownChallenge(99))
        ));
        assert_eq!(h.runtime.create_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_sandbox() {
        let h = harness(vec![challenge(1, one_hour())]);
        h.runtime.slow_creates(Duration::from_millis(50));

        let (a, b) = tokio::join!(
            h.manager.start_sandbox(10, 1, 1),
            h.manager.start_sandbox(11, 1, 1)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id, b.id);
        assert_eq!(a.resource_id, b.resource_id);
        assert_eq!(h.runtime.create_count(), 1);
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_start_is_idempotent() {
        let h = harness(vec![challenge(1, one_hour())]);
        let first = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        let second = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.runtime.create_count(), 1);
    }

    #[tokio::test]
    async fn test_stopped_resource_is_reused_by_next_team() {
        let h = harness(vec![challenge(1, one_hour())]);

        let first = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        h.manager.stop_sandbox(1, 1).await.unwrap();
        assert_eq!(h.runtime.stop_count(), 1);
        assert_eq!(h.pool.total(), 1);
        assert!(h.manager.get_sandbox(1, 1).is_none());
        assert!(!h.cleaner.is_tracked(first.id));

        let second = h.manager.start_sandbox(20, 2, 1).await.unwrap();
        assert_eq!(second.resource_id, first.resource_id);
        assert_ne!(second.id, first.id);
        assert_eq!(h.runtime.create_count(), 1);
        assert_eq!(h.runtime.start_count(), 1);
        assert_eq!(h.pool.total(), 0);
    }

    #[tokio::test]
    async fn test_creation_failure_leaves_no_entry() {
        let h = harness(vec![challenge(1, one_hour())]);
        h.runtime.fail_creates(true);

        let err = h.manager.start_sandbox(10, 1, 1).await.unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
        assert!(err.is_retryable());
        assert!(h.registry.is_empty());
        assert!(h.cleaner.is_empty());

        h.runtime.fail_creates(false);
        tokio_test::assert_ok!(h.manager.start_sandbox(10, 1, 1).await);
    }

    #[tokio::test]
    async fn test_failed_pooled_start_falls_back_to_create() {
        let h = harness(vec![challenge(1, one_hour())]);
        let first = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        h.manager.stop_sandbox(1, 1).await.unwrap();

        h.runtime.fail_starts(true);
        let second = h.manager.start_sandbox(20, 2, 1).await.unwrap();
        assert_ne!(second.resource_id, first.resource_id);
        assert_eq!(h.runtime.create_count(), 2);

        // The broken one is no longer accounted for, so the reconciler may take it
        let broken = first.resource_id.unwrap();
        assert!(!h.pool.is_accounted(&broken));
    }

    #[tokio::test]
    async fn test_stop_without_sandbox_is_not_found() {
        let h = harness(vec![challenge(1, one_hour())]);
        assert!(matches!(
            h.manager.stop_sandbox(1, 1).await,
            Err(SandboxError::NotFound {
                team_id: 1,
                challenge_id: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_non_reusable_challenge_bypasses_pool() {
        let mut config = challenge(1, one_hour());
        config.reusable = false;
        let h = harness(vec![config]);

        h.manager.start_sandbox(10, 1, 1).await.unwrap();
        h.manager.stop_sandbox(1, 1).await.unwrap();
        assert_eq!(h.runtime.remove_count(), 1);
        assert_eq!(h.pool.total(), 0);

        h.manager.start_sandbox(20, 2, 1).await.unwrap();
        assert_eq!(h.runtime.create_count(), 2);
    }

    #[tokio::test]
    async fn test_full_pool_tears_down_extra_resource() {
        let mut config = challenge(1, one_hour());
        config.pool_size = 1;
        let h = harness(vec![config]);

        h.manager.start_sandbox(10, 1, 1).await.unwrap();
        h.manager.start_sandbox(20, 2, 1).await.unwrap();
        h.manager.stop_sandbox(1, 1).await.unwrap();
        h.manager.stop_sandbox(2, 1).await.unwrap();

        assert_eq!(h.pool.total(), 1);
        assert_eq!(h.runtime.remove_count(), 1);
        assert_eq!(h.runtime.resource_count(), 1);
        assert_eq!(h.pool.leased(), 0);
        // Only the pooled one was stopped; the extra went straight to removal
        assert_eq!(h.runtime.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_failure_is_left_for_reconciler() {
        let h = harness(vec![challenge(1, one_hour())]);

        let view = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        let resource_id = view.resource_id.unwrap();
        h.runtime.fail_stops(true);
        tokio_test::assert_ok!(h.manager.stop_sandbox(1, 1).await);
        assert!(h.manager.get_sandbox(1, 1).is_none());
        assert_eq!(h.pool.total(), 0);
        assert!(!h.pool.is_accounted(&resource_id));
        assert!(h.runtime.is_running(&resource_id));

        let reconciler = OrphanReconciler::new(
            h.runtime.clone(),
            h.pool.clone(),
            h.registry.clone(),
            "instancer.managed=true",
            Duration::ZERO,
        );
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!h.runtime.exists(&resource_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_start_does_not_keep_lease() {
        let h = harness(vec![challenge(1, one_hour())]);
        let first = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        h.manager.stop_sandbox(1, 1).await.unwrap();
        let pooled = first.resource_id.unwrap();

        // The caller gives up while the pooled resource is restarting
        h.runtime.slow_starts(Duration::from_secs(10));
        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), h.manager.start_sandbox(20, 2, 1)).await;
        assert!(abandoned.is_err());
        assert_eq!(h.pool.leased(), 0);
        assert!(!h.pool.is_accounted(&pooled));

        let reconciler = OrphanReconciler::new(
            h.runtime.clone(),
            h.pool.clone(),
            h.registry.clone(),
            "instancer.managed=true",
            Duration::ZERO,
        );
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.removed, 1);

        // The stale entry left by the abandoned call does not block the key
        h.runtime.slow_starts(Duration::ZERO);
        let view = h.manager.start_sandbox(20, 2, 1).await.unwrap();
        assert_eq!(view.state, SandboxState::Active);
        assert_eq!(h.pool.leased(), 1);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_left_for_reconciler() {
        let mut config = challenge(1, one_hour());
        config.reusable = false;
        let h = harness(vec![config]);

        let view = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        let resource_id = view.resource_id.unwrap();
        h.runtime.fail_removes(true);
        tokio_test::assert_ok!(h.manager.stop_sandbox(1, 1).await);
        assert!(h.runtime.exists(&resource_id));
        assert!(!h.pool.is_accounted(&resource_id));

        h.runtime.fail_removes(false);
        let reconciler = OrphanReconciler::new(
            h.runtime.clone(),
            h.pool.clone(),
            h.registry.clone(),
            "instancer.managed=true",
            Duration::ZERO,
        );
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!h.runtime.exists(&resource_id));
    }

    #[tokio::test]
    async fn test_reconciler_keeps_active_and_pooled_resources() {
        let h = harness(vec![challenge(1, one_hour())]);
        h.manager.start_sandbox(10, 1, 1).await.unwrap();
        h.manager.start_sandbox(20, 2, 1).await.unwrap();
        h.manager.stop_sandbox(2, 1).await.unwrap();

        let reconciler = OrphanReconciler::new(
            h.runtime.clone(),
            h.pool.clone(),
            h.registry.clone(),
            "instancer.managed=true",
            Duration::ZERO,
        );
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.seen, 2);
        assert_eq!(report.known, 2);
        assert_eq!(report.removed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_moves_deadline_forward() {
        let h = harness(vec![challenge(1, Duration::from_secs(60))]);
        let view = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        let before = h.cleaner.next_deadline().unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let extended = h.manager.extend_sandbox_ttl(1, 1).await.unwrap();
        assert_eq!(extended.id, view.id);
        assert_eq!(extended.extensions, 1);

        let after = h.cleaner.next_deadline().unwrap();
        assert!(after > before);
        assert_eq!(after, Instant::now() + Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_extend_without_sandbox_is_not_found() {
        let h = harness(vec![challenge(1, one_hour())]);
        assert!(matches!(
            h.manager.extend_sandbox_ttl(1, 1).await,
            Err(SandboxError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_extension_limit_enforced() {
        let mut config = challenge(1, one_hour());
        config.max_extensions = 1;
        let h = harness(vec![config]);

        h.manager.start_sandbox(10, 1, 1).await.unwrap();
        tokio_test::assert_ok!(h.manager.extend_sandbox_ttl(1, 1).await);
        assert!(matches!(
            h.manager.extend_sandbox_ttl(1, 1).await,
            Err(SandboxError::ExtensionLimitReached { limit: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_regenerate_swaps_resource() {
        let h = harness(vec![challenge(1, one_hour())]);
        let view = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        h.manager.extend_sandbox_ttl(1, 1).await.unwrap();
        let old = view.resource_id.clone().unwrap();

        let regenerated = h.manager.regenerate_sandbox(1, 1).await.unwrap();
        assert_eq!(regenerated.id, view.id);
        assert_ne!(regenerated.resource_id.as_deref(), Some(old.as_str()));
        assert_eq!(regenerated.extensions, 0);
        assert!(!h.runtime.exists(&old));
        assert_eq!(h.pool.total(), 0);
    }

    #[tokio::test]
    async fn test_regenerate_failure_keeps_current_resource() {
        let h = harness(vec![challenge(1, one_hour())]);
        let view = h.manager.start_sandbox(10, 1, 1).await.unwrap();

        h.runtime.fail_creates(true);
        assert!(matches!(
            h.manager.regenerate_sandbox(1, 1).await,
            Err(SandboxError::Runtime(_))
        ));
        let current = h.manager.get_sandbox(1, 1).unwrap();
        assert_eq!(current.resource_id, view.resource_id);
        assert!(h.runtime.exists(view.resource_id.as_deref().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_sandbox_reclaimed_others_untouched() {
        let h = harness(vec![
            challenge(1, Duration::from_millis(100)),
            challenge(2, one_hour()),
        ]);
        let cancel = CancellationToken::new();
        tokio::spawn(h.cleaner.clone().run(
            h.manager.clone() as Arc<dyn ExpiryHandler>,
            cancel.clone(),
        ));

        let short = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        let long = h.manager.start_sandbox(10, 1, 2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.manager.get_sandbox(1, 1).is_none());
        assert!(!h.cleaner.is_tracked(short.id));
        assert_eq!(h.pool.total(), 1);

        assert_eq!(h.manager.get_sandbox(1, 2).map(|v| v.id), Some(long.id));
        assert!(h.cleaner.is_tracked(long.id));

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_skips_extended_sandbox() {
        let h = harness(vec![challenge(1, Duration::from_millis(100))]);
        let view = h.manager.start_sandbox(10, 1, 1).await.unwrap();
        let original = h.cleaner.next_deadline().unwrap();

        tokio::time::advance(Duration::from_millis(50)).await;
        h.manager.extend_sandbox_ttl(1, 1).await.unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;

        // Fired for the deadline that was in force before the extension
        h.manager
            .expire(Tracked {
                sandbox_id: view.id,
                key: SandboxKey::new(1, 1),
                deadline: original,
            })
            .await;
        assert!(h.manager.get_sandbox(1, 1).is_some());
        assert!(h.cleaner.is_tracked(view.id));
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_everything() {
        let h = harness(vec![challenge(1, one_hour())]);
        h.manager.start_sandbox(10, 1, 1).await.unwrap();
        h.manager.start_sandbox(20, 2, 1).await.unwrap();
        h.manager.stop_sandbox(2, 1).await.unwrap();
        assert_eq!(h.runtime.resource_count(), 2);

        h.manager.shutdown().await;
        assert_eq!(h.runtime.resource_count(), 0);
        assert!(h.cleaner.is_empty());
        assert_eq!(h.pool.leased(), 0);
        assert!(matches!(
            h.manager.start_sandbox(30, 3, 1).await,
            Err(SandboxError::ShuttingDown)
        ));
    }
}
