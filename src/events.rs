//! Progress bus: fan-out of structured events to subscribed viewers.
//!
//! Workers publish; each subscriber owns a bounded single-slot channel, so
//! a stalled viewer buffers at most one in-flight message and then loses
//! events instead of blocking generation. Publishing snapshots the
//! subscriber set under the lock and sends outside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::registry::PlacedObject;
use crate::tile_store::TileCoord;

/// Pipeline stage a progress event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Light,
    Refine,
}

/// Events delivered to viewers over the (out-of-scope) transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Sent once on connect: current registry plus dirty tiles.
    Hello {
        objects: Vec<PlacedObject>,
        modified: Vec<TileCoord>,
    },
    JobProgress {
        job_id: String,
        stage: JobStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        entry: Option<PlacedObject>,
        progress: usize,
    },
    JobError {
        job_id: String,
        tile: TileCoord,
        message: String,
    },
    JobDone {
        job_id: String,
        stage: JobStage,
    },
    PingAck,
}

/// A live subscription; dropping the receiver unsubscribes on the next
/// publish that notices the disconnect.
pub struct Subscription {
    pub id: u64,
    pub receiver: Receiver<Event>,
}

/// Thread-safe publish/subscribe fan-out.
pub struct ProgressBus {
    subscribers: Mutex<Vec<(u64, Sender<Event>)>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            send_timeout: Duration::from_millis(100),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = bounded(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver an event to every current subscriber.
    ///
    /// Per-subscriber channels preserve publish order; a full queue past
    /// the bounded wait drops the event for that subscriber only, and a
    /// disconnected subscriber is pruned.
    pub fn publish(&self, event: &Event) {
        let targets: Vec<(u64, Sender<Event>)> = self.subscribers.lock().clone();
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.send_timeout(event.clone(), self.send_timeout) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    debug!(subscriber = id, "subscriber stalled, dropping event");
                }
                Err(SendTimeoutError::Disconnected(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .lock()
                .retain(|(id, _)| !dead.contains(id));
        }
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
