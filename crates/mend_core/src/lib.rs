//! # mend_core
//!
//! Shared foundations for Mender, the build-fix-restart loop.
//!
//! # Architecture
//!
//! - **State machines**: fixed transition tables for projects, sandboxes,
//!   previews and fix loops
//! - **Event bus**: per-project pub/sub with priorities and bounded queues
//! - **Journal**: JSONL persistence of published events
//! - **Config**: YAML configuration with `MEND_*` environment overrides
//!
//! # Example
//!
//! ```rust
//! use mend_core::{Event, EventBus, FixLoopPhase, ProjectId, StateMachine};
//!
//! let bus = EventBus::default();
//! let mut sub = bus.subscribe(&ProjectId::from("todo-app"));
//! bus.publish(Event::status("todo-app", "building")).unwrap();
//! assert!(sub.try_recv().is_some());
//!
//! let fix_loop = StateMachine::<FixLoopPhase>::new();
//! fix_loop.transition(FixLoopPhase::Detecting, "error reported").unwrap();
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod journal;
pub mod shard;
pub mod state;
pub mod types;

pub use config::{
    BreakerConfig, CacheConfig, EventsConfig, LimiterConfig, MendConfig, OrchestratorConfig,
    SandboxConfig,
};
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus, EventPriority, EventSubscription, EventType};
pub use hash::{content_hash, sha256_hex};
pub use journal::EventJournal;
pub use shard::{ShardedMap, DEFAULT_SHARDS};
pub use state::{
    FixLoopPhase, MachineSnapshot, Phase, PreviewPhase, ProjectPhase, SandboxStatus,
    StateMachine, TransitionRecord,
};
pub use types::{ErrorReport, ErrorSource, ProjectId};
