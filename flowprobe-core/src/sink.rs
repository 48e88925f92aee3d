//! Event consumers.
//!
//! The engine hands every event to an [`EventSink`]. [`QueueSink`] decouples
//! the capture path from downstream consumers through a bounded channel;
//! [`VecSink`] collects events in memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::warn;

use crate::event::{Event, EventPayload};

/// How often a blocked producer wakes to check for shutdown.
const SEND_POLL: Duration = Duration::from_secs(1);

/// Receiver of decoded events.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: Event);
}

/// Sink feeding a bounded queue.
///
/// When the queue is full the producer blocks, waking once a second to see
/// whether the sink has been stopped. This gives back-pressure instead of
/// unbounded buffering.
#[derive(Clone)]
pub struct QueueSink {
    tx: Sender<Event>,
    running: Arc<AtomicBool>,
}

impl QueueSink {
    /// Create a sink and the receiving end of its queue.
    pub fn new(capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = channel::bounded(capacity.max(1));
        let sink = Self {
            tx,
            running: Arc::new(AtomicBool::new(true)),
        };
        (sink, rx)
    }

    /// Stop accepting events. Blocked producers give up within one poll
    /// interval and later events are dropped.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl EventSink for QueueSink {
    fn handle(&self, event: Event) {
        let mut event = event;
        while self.is_running() {
            match self.tx.send_timeout(event, SEND_POLL) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(returned)) => event = returned,
                Err(SendTimeoutError::Disconnected(_)) => {
                    warn!("event queue receiver has gone away, dropping event");
                    return;
                }
            }
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Default)]
pub struct VecSink {
    events: Mutex<Vec<Event>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone out the payloads collected so far.
    pub fn payloads(&self) -> Vec<EventPayload> {
        self.events
            .lock()
            .iter()
            .map(|e| e.payload.clone())
            .collect()
    }
}

impl EventSink for VecSink {
    fn handle(&self, event: Event) {
        self.events.lock().push(event);
    }
}
