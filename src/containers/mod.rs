//! Container Lifecycle (`spec.md` §4.4): owns every interaction with the
//! container runtime, split into a low-level daemon client (`runtime`) and
//! the orchestration logic that keeps `Runner` records consistent with it
//! (`lifecycle`).

pub mod fake;
pub mod lifecycle;
pub mod runtime;

pub use lifecycle::{CleanupPolicies, CleanupReport, ContainerError, ContainerLifecycle, RunnerRegistrar};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, DockerRuntime, RuntimeError};
