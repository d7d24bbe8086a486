//! Mock sandbox runtime for testing.
//!
//! Captures every call and returns scripted results, so lifecycle and
//! orchestration logic can be exercised without Docker. Failures and
//! delays are injected per method name (`"start_sandbox"`, `"probe"`, ...).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use mend_core::ProjectId;

use crate::config::SandboxSpec;
use crate::error::{RunnerError, RunnerResult};
use crate::runtime::{PortMapping, ProbeResult, SandboxInstance, SandboxRuntime};

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub instance_id: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
enum FailureMode {
    /// Fail the next N calls
    Times(usize, String),
    Always(String),
}

/// Mock sandbox runtime.
#[derive(Clone)]
pub struct MockRuntime {
    available: Arc<RwLock<bool>>,
    version: Arc<RwLock<String>>,
    probe_results: Arc<RwLock<Vec<ProbeResult>>>,
    probe_index: Arc<AtomicUsize>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    failures: Arc<RwLock<HashMap<String, FailureMode>>>,
    delays: Arc<RwLock<HashMap<String, Duration>>>,
    sandbox_counter: Arc<AtomicUsize>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            available: Arc::new(RwLock::new(true)),
            version: Arc::new(RwLock::new("mock-runtime 1.0.0".to_string())),
            probe_results: Arc::new(RwLock::new(Vec::new())),
            probe_index: Arc::new(AtomicUsize::new(0)),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
            delays: Arc::new(RwLock::new(HashMap::new())),
            sandbox_counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_available(self, available: bool) -> Self {
        *self.available.write() = available;
        self
    }

    /// Queue a probe result. Results are returned in order; the last one repeats.
    pub fn add_probe_result(self, result: ProbeResult) -> Self {
        self.probe_results.write().push(result);
        self
    }

    /// Fail the next `times` calls to `method`.
    pub fn fail_times(self, method: &str, times: usize, message: impl Into<String>) -> Self {
        self.failures
            .write()
            .insert(method.to_string(), FailureMode::Times(times, message.into()));
        self
    }

    /// Fail every call to `method`.
    pub fn fail_always(self, method: &str, message: impl Into<String>) -> Self {
        self.failures
            .write()
            .insert(method.to_string(), FailureMode::Always(message.into()));
        self
    }

    /// Sleep before answering calls to `method`.
    pub fn with_delay(self, method: &str, delay: Duration) -> Self {
        self.delays.write().insert(method.to_string(), delay);
        self
    }

    /// Stop injecting failures into `method`.
    pub fn heal(&self, method: &str) {
        self.failures.write().remove(method);
    }

    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Method names in call order.
    pub fn call_sequence(&self) -> Vec<String> {
        self.captured_calls
            .read()
            .iter()
            .map(|c| c.method.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    pub fn was_called(&self, method: &str) -> bool {
        self.captured_calls.read().iter().any(|c| c.method == method)
    }

    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Record the call, apply any delay, then any injected failure.
    async fn enter(
        &self,
        method: &str,
        instance_id: Option<&str>,
        detail: Option<String>,
    ) -> RunnerResult<()> {
        self.captured_calls.write().push(CapturedCall {
            method: method.to_string(),
            instance_id: instance_id.map(str::to_string),
            detail,
        });

        let delay = self.delays.read().get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut failures = self.failures.write();
        let message = match failures.get_mut(method) {
            Some(FailureMode::Always(message)) => Some(message.clone()),
            Some(FailureMode::Times(remaining, message)) if *remaining > 0 => {
                *remaining -= 1;
                Some(message.clone())
            }
            _ => None,
        };
        match message {
            Some(message) => Err(RunnerError::step_failed(method, message)),
            None => Ok(()),
        }
    }

    fn next_probe(&self) -> ProbeResult {
        let results = self.probe_results.read();
        if results.is_empty() {
            return ProbeResult::healthy("mock probe ok");
        }
        let index = self.probe_index.fetch_add(1, Ordering::SeqCst);
        results[index.min(results.len() - 1)].clone()
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn is_available(&self) -> RunnerResult<bool> {
        self.enter("is_available", None, None).await?;
        Ok(*self.available.read())
    }

    async fn version(&self) -> RunnerResult<String> {
        self.enter("version", None, None).await?;
        Ok(self.version.read().clone())
    }

    async fn create_sandbox(
        &self,
        project_id: &ProjectId,
        spec: &SandboxSpec,
    ) -> RunnerResult<SandboxInstance> {
        self.enter("create_sandbox", None, Some(spec.full_image())).await?;
        let n = self.sandbox_counter.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxInstance {
            instance_id: format!("mock-{}-{}", project_id, n),
            name: format!("mend-{}", project_id),
            ports: spec.ports.iter().copied().map(PortMapping::unbound).collect(),
        })
    }

    async fn start_sandbox(&self, instance_id: &str) -> RunnerResult<Vec<PortMapping>> {
        self.enter("start_sandbox", Some(instance_id), None).await?;
        Ok(Vec::new())
    }

    async fn stop_sandbox(&self, instance_id: &str) -> RunnerResult<()> {
        self.enter("stop_sandbox", Some(instance_id), None).await
    }

    async fn destroy_sandbox(&self, instance_id: &str) -> RunnerResult<()> {
        self.enter("destroy_sandbox", Some(instance_id), None).await
    }

    async fn start_preview(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<()> {
        self.enter("start_preview", Some(instance_id), Some(spec.preview_command.join(" ")))
            .await
    }

    async fn stop_preview(&self, instance_id: &str, _spec: &SandboxSpec) -> RunnerResult<()> {
        self.enter("stop_preview", Some(instance_id), None).await
    }

    async fn probe(&self, instance_id: &str, spec: &SandboxSpec) -> RunnerResult<ProbeResult> {
        self.enter("probe", Some(instance_id), Some(spec.probe_command.join(" ")))
            .await?;
        Ok(self.next_probe())
    }

    async fn release_port(&self, instance_id: &str, port: u16) -> RunnerResult<()> {
        self.enter("release_port", Some(instance_id), Some(port.to_string()))
            .await
    }

    async fn cleanup(&self, instance_id: &str, _spec: &SandboxSpec) -> RunnerResult<()> {
        self.enter("cleanup", Some(instance_id), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_runtime_captures_calls() {
        let runtime = MockRuntime::new();
        let spec = SandboxSpec::new("node").tag("20-slim").port(3000);

        let instance = runtime
            .create_sandbox(&ProjectId::from("todo"), &spec)
            .await
            .unwrap();
        runtime.start_sandbox(&instance.instance_id).await.unwrap();

        assert_eq!(runtime.call_sequence(), vec!["create_sandbox", "start_sandbox"]);
        let create = &runtime.get_method_calls("create_sandbox")[0];
        assert_eq!(create.detail.as_deref(), Some("node:20-slim"));
        assert_eq!(instance.ports, vec![PortMapping::unbound(3000)]);
    }

    #[tokio::test]
    async fn test_fail_times_then_recover() {
        let runtime = MockRuntime::new().fail_times("stop_sandbox", 2, "busy");

        assert!(runtime.stop_sandbox("x").await.is_err());
        assert!(runtime.stop_sandbox("x").await.is_err());
        assert!(runtime.stop_sandbox("x").await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_always_until_healed() {
        let runtime = MockRuntime::new().fail_always("probe", "daemon gone");
        let spec = SandboxSpec::new("node");

        assert!(runtime.probe("x", &spec).await.is_err());
        runtime.heal("probe");
        assert!(runtime.probe("x", &spec).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_probe_results_in_order_last_repeats() {
        let runtime = MockRuntime::new()
            .add_probe_result(ProbeResult::unhealthy(1, "Error: boom"))
            .add_probe_result(ProbeResult::healthy("ok"));
        let spec = SandboxSpec::new("node");

        assert!(!runtime.probe("x", &spec).await.unwrap().healthy);
        assert!(runtime.probe("x", &spec).await.unwrap().healthy);
        assert!(runtime.probe("x", &spec).await.unwrap().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_uses_tokio_clock() {
        let runtime = MockRuntime::new().with_delay("version", Duration::from_secs(60));
        let started = tokio::time::Instant::now();
        runtime.version().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_availability() {
        assert!(MockRuntime::new().is_available().await.unwrap());
        assert!(!MockRuntime::new()
            .set_available(false)
            .is_available()
            .await
            .unwrap());
    }
}
