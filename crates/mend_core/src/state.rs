//! Fixed-table state machines for projects, sandboxes, previews and fix loops.
//!
//! Every machine is a [`StateMachine`] over a [`Phase`] enum. The phase enum
//! owns its transition table; the machine serializes transitions behind a
//! mutex and publishes the current phase through an atomic so that readers
//! never wait on a writer.
//!
//! Illegal transitions return [`CoreError::InvalidTransition`]. Terminal
//! phases can only be left through [`StateMachine::resume`], which follows
//! the phase's explicit resume target.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Default number of transitions retained per machine.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// A phase enum with a fixed transition table.
pub trait Phase:
    Copy + Eq + fmt::Debug + fmt::Display + Serialize + Send + Sync + 'static
{
    /// Machine name used in errors and logs.
    const MACHINE: &'static str;

    /// Every phase, in declaration order.
    const ALL: &'static [Self];

    /// Phase a new machine starts in.
    fn initial() -> Self;

    /// Whether `self -> next` is in the transition table.
    fn allows(self, next: Self) -> bool;

    /// Whether the phase only exits through an explicit resume.
    fn is_terminal(self) -> bool;

    /// Where an explicit resume leads from this phase, if anywhere.
    fn resume_target(self) -> Option<Self> {
        None
    }

    fn index(self) -> u8 {
        Self::ALL.iter().position(|p| *p == self).unwrap_or(0) as u8
    }

    fn from_index(index: u8) -> Self {
        Self::ALL
            .get(index as usize)
            .copied()
            .unwrap_or_else(Self::initial)
    }
}

/// One entry in a machine's transition history.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord<P: Phase> {
    pub from: P,
    pub to: P,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of a machine.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSnapshot<P: Phase> {
    pub current: P,
    pub history: Vec<TransitionRecord<P>>,
}

/// A state machine guarded by a single transition mutex.
pub struct StateMachine<P: Phase> {
    current: AtomicU8,
    history: Mutex<VecDeque<TransitionRecord<P>>>,
    history_limit: usize,
}

impl<P: Phase> Default for StateMachine<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Phase> fmt::Debug for StateMachine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("machine", &P::MACHINE)
            .field("current", &self.current())
            .finish()
    }
}

impl<P: Phase> StateMachine<P> {
    /// Create a machine in the phase's initial state.
    pub fn new() -> Self {
        Self::starting_at(P::initial())
    }

    /// Create a machine in an arbitrary phase (used when adopting existing resources).
    pub fn starting_at(phase: P) -> Self {
        Self {
            current: AtomicU8::new(phase.index()),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Current phase. Lock-free.
    pub fn current(&self) -> P {
        P::from_index(self.current.load(Ordering::Acquire))
    }

    pub fn is_terminal(&self) -> bool {
        self.current().is_terminal()
    }

    /// Move to `to` if the table allows it from the current phase.
    pub fn transition(&self, to: P, reason: impl Into<String>) -> CoreResult<TransitionRecord<P>> {
        let mut history = self.history.lock();
        let from = self.current();
        if !from.allows(to) {
            return Err(CoreError::InvalidTransition {
                machine: P::MACHINE,
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(self.commit(&mut history, from, to, reason.into()))
    }

    /// Move to `to` only if the machine is currently in `expected`.
    ///
    /// Used where a caller must not race another writer between reading and
    /// writing the phase, e.g. claiming an idle fix loop.
    pub fn transition_from(
        &self,
        expected: P,
        to: P,
        reason: impl Into<String>,
    ) -> CoreResult<TransitionRecord<P>> {
        let mut history = self.history.lock();
        let from = self.current();
        if from != expected || !from.allows(to) {
            return Err(CoreError::InvalidTransition {
                machine: P::MACHINE,
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(self.commit(&mut history, from, to, reason.into()))
    }

    /// Leave a terminal phase through its resume target.
    pub fn resume(&self, reason: impl Into<String>) -> CoreResult<TransitionRecord<P>> {
        let mut history = self.history.lock();
        let from = self.current();
        let to = match from.resume_target() {
            Some(to) => to,
            None => {
                return Err(CoreError::InvalidTransition {
                    machine: P::MACHINE,
                    from: from.to_string(),
                    to: "resume".to_string(),
                })
            }
        };
        Ok(self.commit(&mut history, from, to, reason.into()))
    }

    pub fn snapshot(&self) -> MachineSnapshot<P> {
        let history = self.history.lock();
        MachineSnapshot {
            current: self.current(),
            history: history.iter().cloned().collect(),
        }
    }

    fn commit(
        &self,
        history: &mut VecDeque<TransitionRecord<P>>,
        from: P,
        to: P,
        reason: String,
    ) -> TransitionRecord<P> {
        debug!(machine = P::MACHINE, %from, %to, %reason, "state transition");
        let record = TransitionRecord {
            from,
            to,
            reason,
            at: Utc::now(),
        };
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(record.clone());
        self.current.store(to.index(), Ordering::Release);
        record
    }
}

// =============================================================================
// Project
// =============================================================================

/// Lifecycle phase of a generated project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Draft,
    Planning,
    Generating,
    Building,
    Running,
    Fixing,
    Failed,
    Paused,
}

impl ProjectPhase {
    fn is_active(self) -> bool {
        matches!(
            self,
            Self::Planning | Self::Generating | Self::Building | Self::Running | Self::Fixing
        )
    }

    /// Whether error reports are accepted in this phase.
    pub fn accepts_reports(self) -> bool {
        matches!(self, Self::Building | Self::Running)
    }
}

impl Phase for ProjectPhase {
    const MACHINE: &'static str = "project";
    const ALL: &'static [Self] = &[
        Self::Draft,
        Self::Planning,
        Self::Generating,
        Self::Building,
        Self::Running,
        Self::Fixing,
        Self::Failed,
        Self::Paused,
    ];

    fn initial() -> Self {
        Self::Draft
    }

    fn allows(self, next: Self) -> bool {
        use ProjectPhase::*;
        match (self, next) {
            (Draft, Planning)
            | (Planning, Generating)
            | (Generating, Building)
            | (Building, Running)
            | (Building, Fixing)
            | (Running, Fixing)
            | (Fixing, Running) => true,
            (from, Failed | Paused) => from.is_active(),
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Paused)
    }

    fn resume_target(self) -> Option<Self> {
        match self {
            Self::Failed | Self::Paused => Some(Self::Building),
            _ => None,
        }
    }
}

impl fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Draft => "draft",
            Self::Planning => "planning",
            Self::Generating => "generating",
            Self::Building => "building",
            Self::Running => "running",
            Self::Fixing => "fixing",
            Self::Failed => "failed",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Sandbox
// =============================================================================

/// Status of a project's isolated execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Creating,
    Running,
    Stopped,
    Error,
    Terminated,
}

impl Phase for SandboxStatus {
    const MACHINE: &'static str = "sandbox";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Creating,
        Self::Running,
        Self::Stopped,
        Self::Error,
        Self::Terminated,
    ];

    fn initial() -> Self {
        Self::Pending
    }

    fn allows(self, next: Self) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, next),
            (Pending, Creating)
                | (Pending, Terminated)
                | (Creating, Running)
                | (Creating, Error)
                | (Running, Stopped)
                | (Running, Error)
                | (Running, Terminated)
                | (Stopped, Creating)
                | (Stopped, Terminated)
                | (Error, Creating)
                | (Error, Terminated)
        )
    }

    fn is_terminal(self) -> bool {
        self == Self::Terminated
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Preview
// =============================================================================

/// Status of the preview/dev server inside a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewPhase {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Crashed,
}

impl Phase for PreviewPhase {
    const MACHINE: &'static str = "preview";
    const ALL: &'static [Self] = &[
        Self::Stopped,
        Self::Starting,
        Self::Ready,
        Self::Stopping,
        Self::Crashed,
    ];

    fn initial() -> Self {
        Self::Stopped
    }

    fn allows(self, next: Self) -> bool {
        use PreviewPhase::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Ready)
                | (Starting, Crashed)
                | (Ready, Crashed)
                | (Ready, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Crashed)
                | (Crashed, Starting)
                | (Crashed, Stopped)
        )
    }

    fn is_terminal(self) -> bool {
        false
    }
}

impl fmt::Display for PreviewPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Fix loop
// =============================================================================

/// Phase of a project's recovery loop. Anything but `Idle` means a fix is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixLoopPhase {
    Idle,
    Detecting,
    Classifying,
    Fixing,
    Verifying,
    Aborted,
}

impl FixLoopPhase {
    fn in_flight(self) -> bool {
        matches!(
            self,
            Self::Detecting | Self::Classifying | Self::Fixing | Self::Verifying
        )
    }
}

impl Phase for FixLoopPhase {
    const MACHINE: &'static str = "fix_loop";
    const ALL: &'static [Self] = &[
        Self::Idle,
        Self::Detecting,
        Self::Classifying,
        Self::Fixing,
        Self::Verifying,
        Self::Aborted,
    ];

    fn initial() -> Self {
        Self::Idle
    }

    fn allows(self, next: Self) -> bool {
        use FixLoopPhase::*;
        match (self, next) {
            (Idle, Detecting)
            | (Detecting, Classifying)
            | (Detecting, Fixing)
            | (Classifying, Fixing)
            | (Fixing, Verifying) => true,
            (from, Idle | Aborted) => from.in_flight(),
            _ => false,
        }
    }

    fn is_terminal(self) -> bool {
        self == Self::Aborted
    }

    fn resume_target(self) -> Option<Self> {
        match self {
            Self::Aborted => Some(Self::Idle),
            _ => None,
        }
    }
}

impl fmt::Display for FixLoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Detecting => "detecting",
            Self::Classifying => "classifying",
            Self::Fixing => "fixing",
            Self::Verifying => "verifying",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_project_happy_path() {
        let machine = StateMachine::<ProjectPhase>::new();
        for next in [
            ProjectPhase::Planning,
            ProjectPhase::Generating,
            ProjectPhase::Building,
            ProjectPhase::Running,
            ProjectPhase::Fixing,
            ProjectPhase::Running,
        ] {
            machine.transition(next, "test").unwrap();
        }
        assert_eq!(machine.current(), ProjectPhase::Running);
        assert_eq!(machine.snapshot().history.len(), 6);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let machine = StateMachine::<ProjectPhase>::new();
        let err = machine.transition(ProjectPhase::Running, "skip").unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(machine.current(), ProjectPhase::Draft);
        assert!(machine.snapshot().history.is_empty());
    }

    #[test]
    fn test_terminal_project_requires_resume() {
        let machine = StateMachine::starting_at(ProjectPhase::Running);
        machine.transition(ProjectPhase::Failed, "budget").unwrap();
        assert!(machine.is_terminal());
        assert!(machine.transition(ProjectPhase::Running, "again").is_err());

        let record = machine.resume("operator").unwrap();
        assert_eq!(record.to, ProjectPhase::Building);
        assert!(machine.resume("twice").is_err());
    }

    #[test]
    fn test_draft_cannot_fail() {
        let machine = StateMachine::<ProjectPhase>::new();
        assert!(machine.transition(ProjectPhase::Failed, "x").is_err());
    }

    #[test]
    fn test_sandbox_restart_cycle() {
        let machine = StateMachine::<SandboxStatus>::new();
        machine.transition(SandboxStatus::Creating, "create").unwrap();
        machine.transition(SandboxStatus::Running, "up").unwrap();
        machine.transition(SandboxStatus::Stopped, "stop").unwrap();
        machine.transition(SandboxStatus::Creating, "start").unwrap();
        machine.transition(SandboxStatus::Running, "up").unwrap();
        machine.transition(SandboxStatus::Terminated, "destroy").unwrap();

        assert!(machine.is_terminal());
        assert!(machine.resume("nope").is_err());
        assert!(machine.transition(SandboxStatus::Creating, "x").is_err());
    }

    #[test]
    fn test_fix_loop_cache_hit_skips_classifying() {
        let machine = StateMachine::<FixLoopPhase>::new();
        machine.transition(FixLoopPhase::Detecting, "report").unwrap();
        machine.transition(FixLoopPhase::Fixing, "cache hit").unwrap();
        machine.transition(FixLoopPhase::Verifying, "applied").unwrap();
        machine.transition(FixLoopPhase::Idle, "verified").unwrap();
        assert_eq!(machine.current(), FixLoopPhase::Idle);
    }

    #[test]
    fn test_fix_loop_abort_and_reset() {
        let machine = StateMachine::<FixLoopPhase>::new();
        assert!(machine.transition(FixLoopPhase::Aborted, "idle abort").is_err());

        machine.transition(FixLoopPhase::Detecting, "report").unwrap();
        machine.transition(FixLoopPhase::Aborted, "denied").unwrap();
        assert!(machine.transition(FixLoopPhase::Detecting, "again").is_err());

        machine.resume("reset").unwrap();
        assert_eq!(machine.current(), FixLoopPhase::Idle);
    }

    #[test]
    fn test_transition_from_claims_once() {
        let machine = Arc::new(StateMachine::<FixLoopPhase>::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let machine = Arc::clone(&machine);
                std::thread::spawn(move || {
                    machine
                        .transition_from(FixLoopPhase::Idle, FixLoopPhase::Detecting, "claim")
                        .is_ok()
                })
            })
            .collect();

        let claimed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(claimed, 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let machine = StateMachine::<PreviewPhase>::new().with_history_limit(3);
        for _ in 0..3 {
            machine.transition(PreviewPhase::Starting, "start").unwrap();
            machine.transition(PreviewPhase::Crashed, "crash").unwrap();
        }
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.history.len(), 3);
        assert_eq!(snapshot.current, PreviewPhase::Crashed);
    }

    #[test]
    fn test_snapshot_matches_its_history() {
        let machine = Arc::new(StateMachine::<PreviewPhase>::new());
        let writer = {
            let machine = Arc::clone(&machine);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    machine.transition(PreviewPhase::Starting, "start").unwrap();
                    machine.transition(PreviewPhase::Crashed, "crash").unwrap();
                }
            })
        };

        for _ in 0..200 {
            let snapshot = machine.snapshot();
            if let Some(last) = snapshot.history.last() {
                assert_eq!(last.to, snapshot.current);
            }
        }
        writer.join().unwrap();
        assert_eq!(machine.current(), PreviewPhase::Crashed);
    }

    #[test]
    fn test_phase_index_round_trip() {
        for phase in ProjectPhase::ALL {
            assert_eq!(ProjectPhase::from_index(phase.index()), *phase);
        }
    }
}
