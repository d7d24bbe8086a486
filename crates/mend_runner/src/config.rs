//! Sandbox configuration types.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mend_core::SandboxConfig;

/// Host directory bind-mounted into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Host path to mount
    pub source: PathBuf,
    /// Container path to mount to
    pub target: String,
    pub read_only: bool,
}

impl MountConfig {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Everything a runtime needs to create a project's sandbox and run its preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub image: String,
    pub tag: String,
    /// Working directory inside the sandbox
    pub workdir: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountConfig>,
    /// Preview/dev server command
    pub preview_command: Vec<String>,
    /// Build/boot check run by `probe`
    pub probe_command: Vec<String>,
    /// Ports exposed from the sandbox
    pub ports: Vec<u16>,
    pub network_mode: Option<String>,
}

impl SandboxSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: "latest".to_string(),
            workdir: "/app".to_string(),
            env: HashMap::new(),
            mounts: Vec::new(),
            preview_command: Vec::new(),
            probe_command: Vec::new(),
            ports: Vec::new(),
            network_mode: None,
        }
    }

    /// Spec for a project checked out at `project_root`, mounted at the configured workdir.
    pub fn from_config(config: &SandboxConfig, project_root: &Path) -> Self {
        let mut spec = Self::new(config.image.clone())
            .tag(config.tag.clone())
            .workdir(config.workdir.clone())
            .mount(MountConfig::new(project_root, config.workdir.clone()))
            .preview_command(config.preview_command.clone())
            .probe_command(config.probe_command.clone())
            .port(config.preview_port);
        spec.network_mode = config.network_mode.clone();
        spec
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn mount(mut self, mount: MountConfig) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn preview_command(mut self, cmd: Vec<String>) -> Self {
        self.preview_command = cmd;
        self
    }

    pub fn probe_command(mut self, cmd: Vec<String>) -> Self {
        self.probe_command = cmd;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network_mode = Some(network.into());
        self
    }

    /// Get the full image name with tag.
    pub fn full_image(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Timeout and retry policy applied to every lifecycle step.
#[derive(Debug, Clone, Copy)]
pub struct StepPolicy {
    pub timeout: Duration,
    /// Extra attempts after the first failure
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

impl StepPolicy {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.step_timeout(),
            retries: config.step_retries,
            retry_delay: config.retry_delay(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_config() {
        let config = SandboxConfig::default();
        let spec = SandboxSpec::from_config(&config, Path::new("/work/todo"));

        assert_eq!(spec.full_image(), "node:20-slim");
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.mounts[0].target, "/app");
        assert_eq!(spec.ports, vec![3000]);
        assert_eq!(spec.preview_command, vec!["npm", "run", "dev"]);
    }

    #[test]
    fn test_duplicate_ports_are_ignored() {
        let spec = SandboxSpec::new("python").port(8000).port(8000).port(5678);
        assert_eq!(spec.ports, vec![8000, 5678]);
    }

    #[test]
    fn test_step_policy_defaults() {
        let policy = StepPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.retry_delay, Duration::from_millis(250));
    }
}
