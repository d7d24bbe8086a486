//! Docker implementation of SandboxRuntime.
//!
//! A sandbox is a long-lived container that idles on `sleep infinity` with
//! the project bind-mounted at its workdir. The preview server, probes and
//! remediation commands all run as `exec`s inside it.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use mend_core::ProjectId;

use crate::config::SandboxSpec;
use crate::error::{RunnerError, RunnerResult};
use crate::runtime::{PortMapping, ProbeResult, SandboxInstance, SandboxRuntime};

const PROJECT_LABEL: &str = "mend.project";

/// Docker-based sandbox runtime.
pub struct DockerRuntime {
    client: Docker,
    /// Seconds Docker waits before killing a stopping container
    stop_grace_secs: i64,
}

impl DockerRuntime {
    /// Connect with local defaults and verify the daemon answers.
    pub async fn new() -> RunnerResult<Self> {
        let client = Docker::connect_with_local_defaults()?;
        client
            .ping()
            .await
            .map_err(|e| RunnerError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            stop_grace_secs: 5,
        })
    }

    /// Create with custom Docker host.
    pub async fn with_host(host: &str) -> RunnerResult<Self> {
        let client = Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?;
        client
            .ping()
            .await
            .map_err(|e| RunnerError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            stop_grace_secs: 5,
        })
    }

    fn container_name(project_id: &ProjectId) -> String {
        let slug: String = project_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let id = Uuid::new_v4().to_string()[..8].to_string();
        format!("mend-{}-{}", slug.trim_matches('-'), id)
    }

    async fn ensure_image(&self, image: &str, tag: &str) -> RunnerResult<()> {
        let full_image = format!("{}:{}", image, tag);
        match self.client.inspect_image(&full_image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        info!("Pulling image {}", full_image);
        let options = CreateImageOptions {
            from_image: image,
            tag,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result?;
            if let Some(status) = progress.status {
                debug!("Pull status: {}", status);
            }
        }
        Ok(())
    }

    /// Run a command inside the sandbox. Detached execs return exit code 0.
    async fn exec(
        &self,
        instance_id: &str,
        cmd: Vec<String>,
        workdir: Option<&str>,
        detach: bool,
    ) -> RunnerResult<(i64, String)> {
        debug!("exec in {}: {:?}", instance_id, cmd);
        let exec = self
            .client
            .create_exec(
                instance_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(!detach),
                    attach_stderr: Some(!detach),
                    working_dir: workdir.map(str::to_string),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach,
                    ..Default::default()
                }),
            )
            .await?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(chunk) = stream.next().await {
                match chunk? {
                    LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                        output.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        } else {
            return Ok((0, output));
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        Ok((inspect.exit_code.unwrap_or(0), output))
    }

    async fn shell(
        &self,
        instance_id: &str,
        script: String,
        workdir: Option<&str>,
    ) -> RunnerResult<(i64, String)> {
        self.exec(
            instance_id,
            vec!["sh".to_string(), "-c".to_string(), script],
            workdir,
            false,
        )
        .await
    }
}

/// Single-quote each argument for `sh -c`.
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| format!("'{}'", a.replace('\'', r"'\''")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn is_available(&self) -> RunnerResult<bool> {
        Ok(self.client.ping().await.is_ok())
    }

    async fn version(&self) -> RunnerResult<String> {
        let version = self.client.version().await?;
        Ok(format!(
            "Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    async fn create_sandbox(
        &self,
        project_id: &ProjectId,
        spec: &SandboxSpec,
    ) -> RunnerResult<SandboxInstance> {
        self.ensure_image(&spec.image, &spec.tag).await?;

        let name = Self::container_name(project_id);
        debug!("Creating sandbox {} with image {}", name, spec.full_image());

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.to_string_lossy().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: None,
                }]),
            );
        }

        let host_config = HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            network_mode: spec.network_mode.clone(),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(PROJECT_LABEL.to_string(), project_id.to_string());

        let config = Config {
            image: Some(spec.full_image()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(spec.workdir.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;

        Ok(SandboxInstance {
            instance_id: container.id,
            name,
            ports: spec.ports.iter().copied().map(PortMapping::unbound).collect(),
        })
    }

    async fn start_sandbox(&self, instance_id: &str) -> RunnerResult<Vec<PortMapping>> {
        match self
            .client
            .start_container(instance_id, None::<StartContainerOptions<String>>)
            .await
        {
            // 304: already running
            Ok(_)
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        let inspect = self
            .client
            .inspect_container(instance_id, None::<InspectContainerOptions>)
            .await?;

        let ports = inspect
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let container_port = key.split('/').next()?.parse().ok()?;
                let host_port = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse().ok()));
                Some(PortMapping {
                    container_port,
                    host_port,
                })
            })
            .collect();
        Ok(ports)
    }

    async fn stop_sandbox(&self, instance_id: &str) -> RunnerResult<()> {
        match self
            .client
            .stop_container(
                instance_id,
                Some(StopContainerOptions {
                    t: self.stop_grace_secs,
                }),
            )
            .await
        {
            // 304: already stopped
            Ok(_)
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy_sandbox(&self, instance_id: &str) -> RunnerResult<()> {
        match self
            .client
            .remove_container(
                instance_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(_)
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_preview(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<()> {
        if spec.preview_command.is_empty() {
            return Err(RunnerError::step_failed("start_preview", "no preview command configured"));
        }
        let script = format!("{} > /tmp/mend-preview.log 2>&1", shell_join(&spec.preview_command));
        self.exec(
            instance_id,
            vec!["sh".to_string(), "-c".to_string(), script],
            Some(&spec.workdir),
            true,
        )
        .await?;
        Ok(())
    }

    async fn stop_preview(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<()> {
        if spec.preview_command.is_empty() {
            return Ok(());
        }
        let pattern = spec.preview_command.join(" ");
        let script = format!("pkill -f {} || true", shell_join(&[pattern]));
        let (code, output) = self.shell(instance_id, script, None).await?;
        if code != 0 {
            return Err(RunnerError::step_failed("stop_preview", output));
        }
        Ok(())
    }

    async fn probe(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<ProbeResult> {
        if spec.probe_command.is_empty() {
            return Ok(ProbeResult::healthy("no probe command configured"));
        }
        let started = Instant::now();
        let (exit_code, output) = self
            .exec(instance_id, spec.probe_command.clone(), Some(&spec.workdir), false)
            .await?;
        Ok(ProbeResult {
            healthy: exit_code == 0,
            exit_code,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn release_port(&self, instance_id: &str, port: u16) -> RunnerResult<()> {
        let script = format!("fuser -k {}/tcp >/dev/null 2>&1 || true", port);
        self.shell(instance_id, script, None).await?;
        Ok(())
    }

    async fn cleanup(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<()> {
        let script = format!(
            "rm -rf /tmp/mend-* {wd}/.next/cache {wd}/node_modules/.cache {wd}/__pycache__",
            wd = spec.workdir
        );
        let (code, output) = self.shell(instance_id, script, None).await?;
        if code != 0 {
            return Err(RunnerError::step_failed("cleanup", output));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_join_quotes_arguments() {
        let args = vec!["npm".to_string(), "run".to_string(), "it's".to_string()];
        assert_eq!(shell_join(&args), r"'npm' 'run' 'it'\''s'");
    }

    #[test]
    fn test_container_name_is_sanitized() {
        let name = DockerRuntime::container_name(&ProjectId::from("My App/v2"));
        assert!(name.starts_with("mend-my-app-v2-"));
        assert_eq!(name.len(), "mend-my-app-v2-".len() + 8);
    }
}
