//! Lifecycle and state-change notifications.
//!
//! Subscribers get a bounded channel. Publishing never blocks: when a
//! subscriber's buffer is full the event is dropped for that subscriber
//! and counted, and closed subscribers are pruned on the next publish.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::resilience::CircuitState;
use crate::types::Priority;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccessEvent {
    CircuitTransition {
        endpoint: String,
        from: CircuitState,
        to: CircuitState,
    },
    UpstreamThrottled {
        endpoint: String,
    },
    AdmissionRejected {
        priority: Priority,
        utilization: f64,
    },
    DrainStarted {
        critical: usize,
        normal: usize,
    },
    DrainFinished {
        clean: bool,
        elapsed_ms: u64,
    },
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<AccessEvent>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<AccessEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: AccessEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Events discarded because a subscriber was not keeping up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
