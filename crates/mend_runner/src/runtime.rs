//! Sandbox runtime trait and types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mend_core::ProjectId;

use crate::config::SandboxSpec;
use crate::error::RunnerResult;

/// A port exposed by a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    /// Host port assigned by the runtime, once known
    pub host_port: Option<u16>,
}

impl PortMapping {
    pub fn unbound(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
        }
    }
}

/// A sandbox created by a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    /// Runtime-specific id (container id for Docker)
    pub instance_id: String,
    pub name: String,
    pub ports: Vec<PortMapping>,
}

/// Result of a build/boot check inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub exit_code: i64,
    /// Combined stdout and stderr
    pub output: String,
    pub duration_ms: u64,
}

impl ProbeResult {
    pub fn healthy(output: impl Into<String>) -> Self {
        Self {
            healthy: true,
            exit_code: 0,
            output: output.into(),
            duration_ms: 0,
        }
    }

    pub fn unhealthy(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            healthy: false,
            exit_code,
            output: output.into(),
            duration_ms: 0,
        }
    }

    /// Lines of output that report an error, deduplicated, in order.
    pub fn error_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        for line in self.output.lines() {
            let trimmed = line.trim();
            let lower = trimmed.to_lowercase();
            let is_error = lower.contains("error")
                || lower.contains("err!")
                || lower.starts_with("traceback")
                || lower.contains("cannot find module");
            if is_error && !lower.contains("0 errors") && !lines.iter().any(|l| l == trimmed) {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }
}

/// Deterministic infrastructure remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    /// Kill whatever holds a port inside the sandbox
    ReleasePort { port: u16 },
    /// Remove stale caches and temporary files
    Cleanup,
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReleasePort { port } => write!(f, "release port {}", port),
            Self::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// Isolated execution environment backend.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Check if the backend is reachable.
    async fn is_available(&self) -> RunnerResult<bool>;

    /// Backend version information.
    async fn version(&self) -> RunnerResult<String>;

    /// Create (but do not start) a sandbox for a project.
    async fn create_sandbox(
        &self,
        project_id: &ProjectId,
        spec: &SandboxSpec,
    ) -> RunnerResult<SandboxInstance>;

    /// Start a sandbox and return its port mappings.
    async fn start_sandbox(&self, instance_id: &str) -> RunnerResult<Vec<PortMapping>>;

    async fn stop_sandbox(&self, instance_id: &str) -> RunnerResult<()>;

    /// Remove a sandbox and everything it owns.
    async fn destroy_sandbox(&self, instance_id: &str) -> RunnerResult<()>;

    /// Launch the preview server in the background.
    async fn start_preview(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<()>;

    async fn stop_preview(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<()>;

    /// Run the build/boot check and wait for it.
    async fn probe(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<ProbeResult>;

    /// Free a port held by a stray process.
    async fn release_port(&self, instance_id: &str, port: u16) -> RunnerResult<()>;

    /// Remove stale caches and temporary files.
    async fn cleanup(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_lines_are_deduplicated() {
        let probe = ProbeResult::unhealthy(
            1,
            "> next build\nTypeError: x is undefined\n  at foo\nTypeError: x is undefined\nnpm ERR! code 1\nFound 0 errors",
        );
        assert_eq!(
            probe.error_lines(),
            vec!["TypeError: x is undefined", "npm ERR! code 1"]
        );
    }

    #[test]
    fn test_remediation_serialization() {
        let json = serde_json::to_string(&RemediationAction::ReleasePort { port: 3000 }).unwrap();
        assert_eq!(json, r#"{"action":"release_port","port":3000}"#);
    }
}
