//! Per-project circuit breaker.
//!
//! Counts consecutive failed fixes. At the threshold the circuit opens and
//! every request is denied until the recovery time has passed; then a single
//! probe is let through. A successful probe closes the circuit, a failed one
//! reopens it and restarts the timer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use mend_core::{BreakerConfig, ProjectId, ShardedMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BreakerDecision {
    /// `probe` is set when this request is the single half-open probe
    Allow { probe: bool },
    Deny { reason: String },
}

impl BreakerDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn is_probe(&self) -> bool {
        matches!(self, Self::Allow { probe: true })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow { .. } => None,
            Self::Deny { reason } => Some(reason),
        }
    }
}

/// Operator view of one project's circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub project_id: ProjectId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_since: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum Inner {
    Closed,
    Open {
        since: Instant,
        since_utc: DateTime<Utc>,
    },
    HalfOpen {
        probe_in_flight: bool,
        since_utc: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct Circuit {
    failures: u32,
    inner: Inner,
}

impl Circuit {
    fn new() -> Self {
        Self {
            failures: 0,
            inner: Inner::Closed,
        }
    }

    fn state(&self) -> CircuitState {
        match self.inner {
            Inner::Closed => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn open(&mut self) {
        self.inner = Inner::Open {
            since: Instant::now(),
            since_utc: Utc::now(),
        };
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: ShardedMap<ProjectId, Circuit>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: ShardedMap::default(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask whether a fix may be attempted for the project.
    pub fn check(&self, project_id: &ProjectId) -> BreakerDecision {
        let recovery = self.config.recovery_time();
        self.circuits
            .with_entry(project_id.clone(), Circuit::new, |circuit| match circuit.inner {
                Inner::Closed => BreakerDecision::Allow { probe: false },
                Inner::Open { since, since_utc } => {
                    if since.elapsed() >= recovery {
                        info!(project = %project_id, "Circuit half-open, allowing one probe");
                        circuit.inner = Inner::HalfOpen {
                            probe_in_flight: true,
                            since_utc,
                        };
                        BreakerDecision::Allow { probe: true }
                    } else {
                        BreakerDecision::Deny {
                            reason: "circuit open".to_string(),
                        }
                    }
                }
                Inner::HalfOpen {
                    probe_in_flight: true,
                    ..
                } => BreakerDecision::Deny {
                    reason: "circuit half-open: probe in flight".to_string(),
                },
                Inner::HalfOpen {
                    probe_in_flight: false,
                    since_utc,
                } => {
                    circuit.inner = Inner::HalfOpen {
                        probe_in_flight: true,
                        since_utc,
                    };
                    BreakerDecision::Allow { probe: true }
                }
            })
    }

    pub fn record_success(&self, project_id: &ProjectId) {
        self.circuits
            .with_entry(project_id.clone(), Circuit::new, |circuit| {
                if circuit.state() != CircuitState::Closed {
                    info!(project = %project_id, "Circuit closed");
                }
                *circuit = Circuit::new();
            })
    }

    pub fn record_failure(&self, project_id: &ProjectId) {
        let threshold = self.config.failure_threshold;
        self.circuits
            .with_entry(project_id.clone(), Circuit::new, |circuit| {
                circuit.failures = circuit.failures.saturating_add(1);
                match circuit.inner {
                    Inner::HalfOpen { .. } => {
                        warn!(project = %project_id, "Probe failed, circuit reopened");
                        circuit.open();
                    }
                    Inner::Closed if circuit.failures >= threshold => {
                        warn!(
                            project = %project_id,
                            failures = circuit.failures,
                            "Circuit opened"
                        );
                        circuit.open();
                    }
                    _ => {}
                }
            })
    }

    /// Give back a half-open probe slot that ended without an outcome,
    /// e.g. a cancelled attempt.
    pub fn release_probe(&self, project_id: &ProjectId) {
        self.circuits.with_existing(project_id, |circuit| {
            if let Inner::HalfOpen {
                probe_in_flight,
                ..
            } = &mut circuit.inner
            {
                *probe_in_flight = false;
            }
        });
    }

    /// Operator reset, bypassing the recovery timer.
    pub fn reset(&self, project_id: &ProjectId) {
        self.circuits.remove(project_id);
        info!(project = %project_id, "Circuit manually reset");
    }

    pub fn state(&self, project_id: &ProjectId) -> CircuitState {
        self.circuits
            .with_existing(project_id, |circuit| circuit.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, project_id: &ProjectId) -> CircuitSnapshot {
        self.circuits
            .with_existing(project_id, |circuit| snapshot_of(project_id, circuit))
            .unwrap_or_else(|| snapshot_of(project_id, &Circuit::new()))
    }

    /// Every project whose circuit is not closed.
    pub fn open_circuits(&self) -> Vec<CircuitSnapshot> {
        let mut open = Vec::new();
        self.circuits.for_each(|project_id, circuit| {
            if circuit.state() != CircuitState::Closed {
                open.push(snapshot_of(project_id, circuit));
            }
        });
        open.sort_by(|a, b| a.project_id.as_str().cmp(b.project_id.as_str()));
        open
    }
}

fn snapshot_of(project_id: &ProjectId, circuit: &Circuit) -> CircuitSnapshot {
    let open_since = match circuit.inner {
        Inner::Closed => None,
        Inner::Open { since_utc, .. } | Inner::HalfOpen { since_utc, .. } => Some(since_utc),
    };
    CircuitSnapshot {
        project_id: project_id.clone(),
        state: circuit.state(),
        consecutive_failures: circuit.failures,
        open_since,
    }
}
