//! Execution of traffic plans against a [`Transport`](crate::transport::Transport).
//!
//! The [`manager::CommManager`] runs one task per implicit connection and
//! one task per object's explicit requests. Tasks only share the report
//! accumulator and the cancellation signal.

pub mod counters;
pub mod manager;
pub mod state;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use crate::plan::TrafficEvent;
use crate::report::Outcome;

pub use counters::{Heartbeat, SequenceCounter, SEQUENCE_START};
pub use manager::{CommManager, CommSettings};
pub use state::{ConnectionState, ConnectionTracker, InvalidTransition, MissOutcome};

/// Notified around every executed event.
///
/// Returned strings are attached to the event's report entry as warnings.
#[async_trait]
pub trait CommObserver: Send + Sync {
    async fn before_event(&self, event: &TrafficEvent) -> Vec<String>;
    async fn after_event(&self, event: &TrafficEvent, outcome: &Outcome) -> Vec<String>;
}

/// Observer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl CommObserver for NoopObserver {
    async fn before_event(&self, _event: &TrafficEvent) -> Vec<String> {
        Vec::new()
    }

    async fn after_event(&self, _event: &TrafficEvent, _outcome: &Outcome) -> Vec<String> {
        Vec::new()
    }
}

/// Requests termination of a running plan.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new signal observing this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked handle/signal pair.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}
