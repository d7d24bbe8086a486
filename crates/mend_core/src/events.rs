//! In-process event bus with one logical channel per project.
//!
//! Delivery is at-most-once and best-effort. Each subscription owns two
//! bounded queues, one for high-priority events and one for everything else;
//! `recv` always drains the high queue first, and each queue is FIFO. When a
//! queue is full the oldest event in it is dropped and counted as missed, so a
//! slow subscriber never holds up a publisher.
//!
//! Events for one project are sequenced and fanned out under that project's
//! shard lock, which keeps per-project order stable for every subscriber.
//! There is no ordering guarantee across projects.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::EventsConfig;
use crate::error::{CoreError, CoreResult};
use crate::shard::ShardedMap;
use crate::types::ProjectId;

/// Kind of orchestration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Progress of a fix cycle or lifecycle step
    Status,
    /// A file was written, created or removed
    FileOperation,
    /// Something failed
    Error,
    /// A fix was applied to the project
    FixApplied,
    /// A sandbox restart finished (fully or partially)
    RestartComplete,
    /// Terminal event of a fix cycle
    FixOutcome,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Status => "status",
            Self::FileOperation => "file_operation",
            Self::Error => "error",
            Self::FixApplied => "fix_applied",
            Self::RestartComplete => "restart_complete",
            Self::FixOutcome => "fix_outcome",
        };
        f.write_str(name)
    }
}

/// Delivery priority. `High` jumps ahead of queued lower-priority events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Normal,
    High,
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// An immutable orchestration event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub project_id: ProjectId,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub priority: EventPriority,
    pub timestamp: DateTime<Utc>,
    /// Position in the project's channel, assigned on publish.
    #[serde(default)]
    pub sequence: u64,
}

impl Event {
    pub fn new(
        event_type: EventType,
        project_id: impl Into<ProjectId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            project_id: project_id.into(),
            message: message.into(),
            payload: serde_json::Value::Null,
            priority: EventPriority::Normal,
            timestamp: Utc::now(),
            sequence: 0,
        }
    }

    /// Low-priority progress update.
    pub fn status(project_id: impl Into<ProjectId>, message: impl Into<String>) -> Self {
        Self::new(EventType::Status, project_id, message).with_priority(EventPriority::Low)
    }

    /// High-priority failure.
    pub fn error(project_id: impl Into<ProjectId>, message: impl Into<String>) -> Self {
        Self::new(EventType::Error, project_id, message).with_priority(EventPriority::High)
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Default)]
struct Queues {
    high: VecDeque<Arc<Event>>,
    normal: VecDeque<Arc<Event>>,
    missed: u64,
    closed: bool,
}

struct Subscriber {
    queues: Mutex<Queues>,
    notify: Notify,
    capacity: usize,
}

impl Subscriber {
    fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn deliver(&self, event: &Arc<Event>) {
        {
            let mut queues = self.queues.lock();
            if queues.closed {
                return;
            }
            let capacity = self.capacity;
            let queue = if event.priority == EventPriority::High {
                &mut queues.high
            } else {
                &mut queues.normal
            };
            let dropped = if queue.len() >= capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(Arc::clone(event));
            if dropped {
                queues.missed += 1;
            }
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.queues.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Receiving end of a subscription.
pub struct EventSubscription {
    inner: Arc<Subscriber>,
}

impl EventSubscription {
    /// Wait for the next event. Returns `None` once the bus is shut down and
    /// the queues are drained.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            {
                let mut queues = self.inner.queues.lock();
                if let Some(event) = queues.high.pop_front().or_else(|| queues.normal.pop_front()) {
                    return Some(event);
                }
                if queues.closed {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        let mut queues = self.inner.queues.lock();
        queues.high.pop_front().or_else(|| queues.normal.pop_front())
    }

    /// Number of events dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.inner.queues.lock().missed
    }

    /// Number of events waiting to be received.
    pub fn pending(&self) -> usize {
        let queues = self.inner.queues.lock();
        queues.high.len() + queues.normal.len()
    }
}

#[derive(Default)]
struct Channel {
    next_sequence: u64,
    history: VecDeque<Arc<Event>>,
    subscribers: Vec<Weak<Subscriber>>,
}

/// Project-scoped pub/sub bus.
pub struct EventBus {
    channels: ShardedMap<ProjectId, Channel>,
    global: RwLock<Vec<Weak<Subscriber>>>,
    config: EventsConfig,
    closed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventsConfig::default())
    }
}

impl EventBus {
    pub fn new(config: EventsConfig) -> Self {
        Self {
            channels: ShardedMap::default(),
            global: RwLock::new(Vec::new()),
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to a single project's channel.
    pub fn subscribe(&self, project_id: &ProjectId) -> EventSubscription {
        let subscriber = Arc::new(Subscriber::new(self.config.subscriber_capacity));
        if self.is_closed() {
            subscriber.close();
        } else {
            self.channels.with_entry(project_id.clone(), Channel::default, |channel| {
                channel.subscribers.push(Arc::downgrade(&subscriber));
            });
        }
        EventSubscription { inner: subscriber }
    }

    /// Subscribe to every project's channel.
    pub fn subscribe_all(&self) -> EventSubscription {
        let subscriber = Arc::new(Subscriber::new(self.config.subscriber_capacity));
        if self.is_closed() {
            subscriber.close();
        } else {
            let mut global = self.global.write();
            global.retain(|weak| weak.strong_count() > 0);
            global.push(Arc::downgrade(&subscriber));
        }
        EventSubscription { inner: subscriber }
    }

    /// Publish an event to its project's channel.
    ///
    /// Returns the sequence number assigned to the event. Never waits on
    /// subscribers.
    pub fn publish(&self, mut event: Event) -> CoreResult<u64> {
        if self.is_closed() {
            return Err(CoreError::EventBusClosed);
        }

        // Taken before the shard lock so projects never queue on each other.
        let (global, registered) = {
            let list = self.global.read();
            let live: Vec<Arc<Subscriber>> = list.iter().filter_map(Weak::upgrade).collect();
            (live, list.len())
        };

        let history_limit = self.config.history_limit;
        let project_id = event.project_id.clone();
        let sequence = self.channels.with_entry(project_id, Channel::default, |channel| {
            event.sequence = channel.next_sequence;
            channel.next_sequence += 1;
            let event = Arc::new(event);
            trace!(
                project = %event.project_id,
                sequence = event.sequence,
                event_type = %event.event_type,
                "publishing event"
            );

            if history_limit > 0 {
                if channel.history.len() >= history_limit {
                    channel.history.pop_front();
                }
                channel.history.push_back(Arc::clone(&event));
            }

            channel.subscribers.retain(|weak| match weak.upgrade() {
                Some(subscriber) => {
                    subscriber.deliver(&event);
                    true
                }
                None => false,
            });

            for subscriber in &global {
                subscriber.deliver(&event);
            }

            event.sequence
        });

        if global.len() < registered {
            self.global.write().retain(|weak| weak.strong_count() > 0);
        }
        Ok(sequence)
    }

    /// Recent events for a project, oldest first.
    pub fn history(&self, project_id: &ProjectId) -> Vec<Arc<Event>> {
        self.channels
            .with_existing(project_id, |channel| channel.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a project's channel and history.
    pub fn remove_channel(&self, project_id: &ProjectId) {
        if let Some(channel) = self.channels.remove(project_id) {
            for subscriber in channel.subscribers.iter().filter_map(Weak::upgrade) {
                subscriber.close();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the bus. Pending events stay receivable; later publishes fail.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("event bus shutting down");
        self.channels.for_each(|_, channel| {
            for subscriber in channel.subscribers.iter().filter_map(Weak::upgrade) {
                subscriber.close();
            }
        });
        for subscriber in self.global.read().iter().filter_map(Weak::upgrade) {
            subscriber.close();
        }
    }
}
