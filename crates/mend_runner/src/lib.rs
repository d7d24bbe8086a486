//! # mend_runner
//!
//! Sandbox execution for Mender.
//!
//! Every generated project runs inside its own isolated sandbox with a
//! preview server. This crate provides the runtime abstraction over the
//! backend and the lifecycle manager that provisions, restarts and probes
//! sandboxes with per-step timeouts and retries.
//!
//! # Features
//!
//! - **Runtimes**: Docker API (bollard), scripted mock for tests
//! - **Restart reports**: per-step succeeded/failed/skipped breakdown
//! - **Remediation**: release ports, clean stale caches
//! - **Probes**: build/boot checks used to verify fixes
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use mend_core::{ProjectId, SandboxConfig};
//! use mend_runner::{DockerRuntime, SandboxLifecycleManager, SandboxSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Arc::new(DockerRuntime::new().await?);
//!     let manager = SandboxLifecycleManager::new(runtime);
//!
//!     let project = ProjectId::from("todo-app");
//!     let spec = SandboxSpec::from_config(&SandboxConfig::default(), Path::new("./todo-app"));
//!     manager.provision(&project, spec).await?;
//!
//!     let report = manager.restart(&project).await?;
//!     println!("Restart: {}", report.overall);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod runtime;

pub use config::{MountConfig, SandboxSpec, StepPolicy};
pub use docker::DockerRuntime;
pub use error::{RunnerError, RunnerResult};
pub use lifecycle::{
    LifecycleStep, RestartOutcome, RestartReport, SandboxHandle, SandboxLifecycleManager,
    StepReport, StepStatus,
};
pub use mock::{CapturedCall, MockRuntime};
pub use runtime::{PortMapping, ProbeResult, RemediationAction, SandboxInstance, SandboxRuntime};
