//! In-memory `ContainerRuntime` for tests, the counterpart to `MemoryStore`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};

#[derive(Debug, Clone)]
struct FakeContainer {
    labels: HashMap<String, String>,
    status: ContainerStatus,
    health_file_present: bool,
    last_exec: Option<Vec<String>>,
}

pub struct FakeRuntime {
    containers: DashMap<String, FakeContainer>,
    next_id: AtomicU64,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Test hook: simulate an out-of-band exit, e.g. a crashed runner.
    pub fn simulate_exit(&self, container_id: &str, code: i64) {
        if let Some(mut entry) = self.containers.get_mut(container_id) {
            entry.status = ContainerStatus::Exited(code);
        }
    }

    pub fn simulate_health_failure(&self, container_id: &str) {
        if let Some(mut entry) = self.containers.get_mut(container_id) {
            entry.health_file_present = false;
        }
    }

    /// Test hook: inspect the last command run via `exec_run`.
    pub fn last_exec(&self, container_id: &str) -> Option<Vec<String>> {
        self.containers.get(container_id).and_then(|c| c.last_exec.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.containers.insert(
            id.clone(),
            FakeContainer {
                labels: spec.labels,
                status: ContainerStatus::Running,
                health_file_present: true,
                last_exec: None,
            },
        );
        Ok(id)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError> {
        self.containers
            .get(container_id)
            .map(|c| c.status)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }

    async fn exec_check(&self, container_id: &str, _path: &str) -> Result<bool, RuntimeError> {
        self.containers
            .get(container_id)
            .map(|c| c.health_file_present)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }

    async fn exec_run(&self, container_id: &str, cmd: Vec<String>) -> Result<(), RuntimeError> {
        let mut entry = self
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        entry.last_exec = Some(cmd);
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace_secs: i64) -> Result<(), RuntimeError> {
        if let Some(mut entry) = self.containers.get_mut(container_id) {
            entry.status = ContainerStatus::Exited(0);
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.containers.remove(container_id);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<(String, HashMap<String, String>)>, RuntimeError> {
        Ok(self
            .containers
            .iter()
            .map(|e| (e.key().clone(), e.value().labels.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_inspect_reports_running() {
        let runtime = FakeRuntime::new();
        let id = runtime
            .create_and_start(ContainerSpec {
                image: "ghcr.io/actions/runner".into(),
                name: "r1".into(),
                cpu_cores: 2,
                memory_bytes: 1 << 30,
                env: HashMap::new(),
                labels: HashMap::new(),
            })
            .await
            .unwrap();

        assert_eq!(runtime.inspect(&id).await.unwrap(), ContainerStatus::Running);
        runtime.simulate_exit(&id, 1);
        assert_eq!(runtime.inspect(&id).await.unwrap(), ContainerStatus::Exited(1));
    }
}
