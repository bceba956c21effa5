//! In-memory fakes for the container runtime and object store
//!
//! Both fakes record what they were asked to do and can be told to fail or
//! stall, so lifecycle behavior can be exercised without Docker or S3.

use crate::error::{ArchiveError, ProvisioningError};
use crate::runtime::{ContainerRuntime, ContainerSpec, ManagedContainer, LABEL_SESSION};
use crate::store::ObjectStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
struct FakeContainer {
    name: String,
    session_id: Option<String>,
    running: bool,
}

#[derive(Clone, Default)]
pub struct RecordingRuntime {
    inner: Arc<RecordingRuntimeInner>,
}

#[derive(Default)]
struct RecordingRuntimeInner {
    operations: Mutex<Vec<String>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    specs: Mutex<Vec<ContainerSpec>>,
    next_id: Mutex<u64>,
    create_failure: Mutex<Option<ProvisioningError>>,
    start_failure: Mutex<Option<ProvisioningError>>,
    remove_failure: Mutex<Option<ProvisioningError>>,
    start_delay: Mutex<Option<Duration>>,
}

impl RecordingRuntime {
    /// Every call in order, e.g. `create:lab-1a2b3c4d-...`, `start:c-1`, `remove:c-1`
    pub fn operations(&self) -> Vec<String> {
        self.inner.operations.lock().clone()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.inner.specs.lock().last().cloned()
    }

    /// Containers that exist and have not been removed
    pub fn live_containers(&self) -> usize {
        self.inner.containers.lock().len()
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.inner.containers.lock().contains_key(id)
    }

    pub fn remove_calls(&self, id_or_name: &str) -> usize {
        let target = format!("remove:{}", id_or_name);
        self.inner
            .operations
            .lock()
            .iter()
            .filter(|op| **op == target)
            .count()
    }

    pub fn create_calls(&self) -> usize {
        self.inner
            .operations
            .lock()
            .iter()
            .filter(|op| op.starts_with("create:"))
            .count()
    }

    pub fn fail_next_create(&self, err: ProvisioningError) {
        *self.inner.create_failure.lock() = Some(err);
    }

    pub fn fail_next_start(&self, err: ProvisioningError) {
        *self.inner.start_failure.lock() = Some(err);
    }

    pub fn fail_next_remove(&self, err: ProvisioningError) {
        *self.inner.remove_failure.lock() = Some(err);
    }

    /// Make every start stall for `delay`
    pub fn set_start_delay(&self, delay: Duration) {
        *self.inner.start_delay.lock() = Some(delay);
    }

    pub fn set_running(&self, id: &str, running: bool) {
        if let Some(container) = self.inner.containers.lock().get_mut(id) {
            container.running = running;
        }
    }

    /// Simulate a container left behind by an earlier process
    pub fn insert_orphan(&self, name: &str, session_id: Option<&str>) -> String {
        let id = self.next_id();
        self.inner.containers.lock().insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                session_id: session_id.map(str::to_string),
                running: true,
            },
        );
        id
    }

    fn next_id(&self) -> String {
        let mut guard = self.inner.next_id.lock();
        *guard += 1;
        format!("c-{}", *guard)
    }

    fn record(&self, op: String) {
        self.inner.operations.lock().push(op);
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ProvisioningError> {
        self.record(format!("create:{}", spec.name));
        self.inner.specs.lock().push(spec.clone());
        if let Some(err) = self.inner.create_failure.lock().take() {
            return Err(err);
        }

        let id = self.next_id();
        self.inner.containers.lock().insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                session_id: spec.labels.get(LABEL_SESSION).cloned(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), ProvisioningError> {
        self.record(format!("start:{}", container_id));
        let delay = *self.inner.start_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.inner.start_failure.lock().take() {
            return Err(err);
        }

        match self.inner.containers.lock().get_mut(container_id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(ProvisioningError::Runtime(format!(
                "no such container: {}",
                container_id
            ))),
        }
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<(), ProvisioningError> {
        self.record(format!("remove:{}", id_or_name));
        if let Some(err) = self.inner.remove_failure.lock().take() {
            return Err(err);
        }

        self.inner
            .containers
            .lock()
            .retain(|id, container| id != id_or_name && container.name != id_or_name);
        Ok(())
    }

    async fn is_running(&self, container_id: &str) -> Result<bool, ProvisioningError> {
        Ok(self
            .inner
            .containers
            .lock()
            .get(container_id)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn list_managed_containers(&self) -> Result<Vec<ManagedContainer>, ProvisioningError> {
        Ok(self
            .inner
            .containers
            .lock()
            .iter()
            .map(|(id, c)| ManagedContainer {
                id: id.clone(),
                name: c.name.clone(),
                session_id: c.session_id.clone(),
            })
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<MemoryObjectStoreInner>,
}

#[derive(Default)]
struct MemoryObjectStoreInner {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    put_count: Mutex<usize>,
    failures_left: Mutex<usize>,
    put_delay: Mutex<Option<Duration>>,
}

impl MemoryObjectStore {
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.objects.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.objects.lock().keys().cloned().collect()
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.lock().len()
    }

    /// Attempted uploads, including failed ones
    pub fn put_count(&self) -> usize {
        *self.inner.put_count.lock()
    }

    pub fn fail_next_puts(&self, count: usize) {
        *self.inner.failures_left.lock() = count;
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.inner.put_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<String, ArchiveError> {
        *self.inner.put_count.lock() += 1;
        let delay = *self.inner.put_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.inner.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ArchiveError::Storage("simulated storage outage".into()));
            }
        }

        self.inner.objects.lock().insert(key.to_string(), body);
        Ok(format!("memory://{}", key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArchiveError> {
        Ok(self
            .inner
            .objects
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
