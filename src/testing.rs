//! In-memory container runtime for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::runtime::{ContainerRuntime, LaunchSpec, PortMapping, ResourceRef};

#[derive(Debug)]
struct FakeResource {
    image: String,
    created_at: DateTime<Utc>,
    running: bool,
}

/// Records every call and keeps the resource set in memory
#[derive(Debug, Default)]
pub struct FakeRuntime {
    resources: Mutex<HashMap<String, FakeResource>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    removes: AtomicUsize,
    fail_creates: AtomicBool,
    fail_starts: AtomicBool,
    fail_stops: AtomicBool,
    fail_removes: AtomicBool,
    fail_lists: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    start_delay: Mutex<Option<Duration>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a resource already exists (e.g. left over from a previous run)
    pub fn add_existing(&self, id: &str, created_at: DateTime<Utc>) {
        self.resources.lock().unwrap().insert(
            id.to_string(),
            FakeResource {
                image: "ctf/leftover:1".to_string(),
                created_at,
                running: true,
            },
        );
    }

    pub fn exists(&self, id: &str) -> bool {
        self.resources.lock().unwrap().contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.resources
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|r| r.running)
    }

    /// Number of resources currently present
    pub fn resource_count(&self) -> usize {
        self.resources.lock().unwrap().len()
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Make every create sleep first, to widen race windows
    pub fn slow_creates(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    /// Make every restart of an existing resource sleep first
    pub fn slow_starts(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    fn ports_for(&self, spec_ports: &[crate::runtime::PortSpec]) -> Vec<PortMapping> {
        spec_ports
            .iter()
            .enumerate()
            .map(|(i, p)| PortMapping {
                container_port: p.port,
                protocol: p.protocol,
                host_port: 40000 + i as u16,
            })
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<ResourceRef> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            bail!("fake create failure");
        }
        self.creates.fetch_add(1, Ordering::SeqCst);

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let created_at = Utc::now();
        self.resources.lock().unwrap().insert(
            id.clone(),
            FakeResource {
                image: spec.image.clone(),
                created_at,
                running: true,
            },
        );
        Ok(ResourceRef {
            id,
            image: spec.image.clone(),
            created_at,
            ports: self.ports_for(&spec.ports),
        })
    }

    async fn start(&self, mut resource: ResourceRef) -> Result<ResourceRef> {
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_starts.load(Ordering::SeqCst) {
            bail!("fake start failure for {}", resource.id);
        }
        match self.resources.lock().unwrap().get_mut(&resource.id) {
            Some(r) => r.running = true,
            None => bail!("No such container: {}", resource.id),
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        // Host ports change across restarts
        for port in &mut resource.ports {
            port.host_port += 100;
        }
        Ok(resource)
    }

    async fn stop(&self, resource: &ResourceRef) -> Result<()> {
        if self.fail_stops.load(Ordering::SeqCst) {
            bail!("fake stop failure for {}", resource.id);
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(r) = self.resources.lock().unwrap().get_mut(&resource.id) {
            r.running = false;
        }
        Ok(())
    }

    async fn remove(&self, resource: &ResourceRef) -> Result<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            bail!("fake remove failure for {}", resource.id);
        }
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.resources.lock().unwrap().remove(&resource.id);
        Ok(())
    }

    async fn list(&self, _label: &str) -> Result<Vec<ResourceRef>> {
        if self.fail_lists.load(Ordering::SeqCst) {
            bail!("fake list failure");
        }
        Ok(self
            .resources
            .lock()
            .unwrap()
            .iter()
            .map(|(id, r)| ResourceRef {
                id: id.clone(),
                image: r.image.clone(),
                created_at: r.created_at,
                ports: vec![],
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
