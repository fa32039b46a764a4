//! Low-level container daemon client (`spec.md` §6: "requires a daemon API
//! supporting create/start/stop/remove/inspect/exec/events"). `DockerRuntime`
//! is the production implementation, talking to the local Docker Engine via
//! `bollard`, the crate the broader pack reaches for container orchestration
//! (`rrik-komodo`, `getsynth-shuttle`).

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use thiserror::Error;
use tracing::instrument;

use crate::error::{Classify, ErrorKind};

pub const MANAGED_LABEL: &str = "runnerhub.managed";
pub const POOL_LABEL: &str = "runnerhub.pool";
pub const PERSISTENT_LABEL: &str = "runnerhub.persistent";
pub const RUNNER_NETWORK: &str = "runnerhub-net";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container daemon unavailable: {0}")]
    DaemonUnavailable(String),
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("container runtime rejected the request: {0}")]
    Rejected(String),
}

impl Classify for RuntimeError {
    fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::DaemonUnavailable(_) => ErrorKind::TransientExternal,
            RuntimeError::NotFound(_) => ErrorKind::PermanentExternal,
            RuntimeError::Rejected(_) => ErrorKind::Validation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited(i64),
    Unknown,
}

/// Resource and security limits applied to every runner container
/// (`spec.md` §4.4 step 1-2).
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub cpu_cores: u32,
    pub memory_bytes: i64,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// What C4 needs from a container daemon, decoupled from `bollard`'s
/// concrete types so a fake can stand in during tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String, RuntimeError>;
    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError>;
    async fn exec_check(&self, container_id: &str, path: &str) -> Result<bool, RuntimeError>;
    /// Runs an arbitrary command to completion inside the container, e.g.
    /// configuring and starting the runner agent against a freshly issued
    /// token when adopting a pre-warmed container.
    async fn exec_run(&self, container_id: &str, cmd: Vec<String>) -> Result<(), RuntimeError>;
    async fn stop(&self, container_id: &str, grace_secs: i64) -> Result<(), RuntimeError>;
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;
    async fn list_managed(&self) -> Result<Vec<(String, HashMap<String, String>)>, RuntimeError>;
}

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::DaemonUnavailable(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_and_start(&self, spec: ContainerSpec) -> Result<String, RuntimeError> {
        let host_config = HostConfig {
            cpu_shares: Some((spec.cpu_cores * 1024) as i64),
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes),
            network_mode: Some(RUNNER_NETWORK.to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec![
                "CHOWN".to_string(),
                "DAC_OVERRIDE".to_string(),
                "SETGID".to_string(),
                "SETUID".to_string(),
            ]),
            security_opt: Some(vec![
                "no-new-privileges:true".to_string(),
                "seccomp=default".to_string(),
            ]),
            readonly_rootfs: Some(true),
            port_bindings: Some(HashMap::<String, Option<Vec<PortBinding>>>::new()),
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = BollardConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;

        self.client
            .start_container(&created.id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;

        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, RuntimeError> {
        let details = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::NotFound(e.to_string()))?;

        let state = details.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            return Ok(ContainerStatus::Running);
        }
        if let Some(code) = state.exit_code {
            return Ok(ContainerStatus::Exited(code));
        }
        Ok(ContainerStatus::Unknown)
    }

    #[instrument(skip(self))]
    async fn exec_check(&self, container_id: &str, path: &str) -> Result<bool, RuntimeError> {
        use bollard::exec::{CreateExecOptions, StartExecResults};
        use futures::StreamExt;

        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["test", "-f", path]),
                    attach_stdout: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while output.next().await.is_some() {}
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;

        Ok(inspect.exit_code == Some(0))
    }

    #[instrument(skip(self, cmd))]
    async fn exec_run(&self, container_id: &str, cmd: Vec<String>) -> Result<(), RuntimeError> {
        use bollard::exec::{CreateExecOptions, StartExecResults};
        use futures::StreamExt;

        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while output.next().await.is_some() {}
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::Rejected(e.to_string()))?;

        if inspect.exit_code == Some(0) {
            Ok(())
        } else {
            Err(RuntimeError::Rejected(format!(
                "exec in {container_id} exited with {:?}",
                inspect.exit_code
            )))
        }
    }

    #[instrument(skip(self))]
    async fn stop(&self, container_id: &str, grace_secs: i64) -> Result<(), RuntimeError> {
        match self
            .client
            .stop_container(
                container_id,
                Some(StopContainerOptions { t: grace_secs }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(RuntimeError::Rejected(e.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(RuntimeError::Rejected(e.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn list_managed(&self) -> Result<Vec<(String, HashMap<String, String>)>, RuntimeError> {
        use bollard::container::ListContainersOptions;

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::DaemonUnavailable(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| Some((c.id?, c.labels.unwrap_or_default())))
            .collect())
    }
}
