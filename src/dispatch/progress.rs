//! Progress observer: broadcast fan-out of dispatch and delivery events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::state::DispatchState;
use crate::delivery::DeliveryResult;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Events pushed to every observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Emitted after each issued transmission.
    Progress { sent: usize, total: usize },
    /// Terminal or informational status line.
    Status { status: String },
    /// An outcome was applied for a job.
    Delivered {
        job_id: String,
        address: String,
        result: DeliveryResult,
    },
    /// Consecutive failures reached the escalation threshold.
    Escalation { streak: u32 },
    /// Lifecycle state changed.
    State { state: DispatchState },
}

/// Fan-out point for progress events plus the current lifecycle state.
pub struct ProgressObserver {
    tx: broadcast::Sender<ProgressEvent>,
    state: watch::Sender<DispatchState>,
}

impl ProgressObserver {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        let (state, _) = watch::channel(DispatchState::Idle);
        Arc::new(Self { tx, state })
    }

    /// Subscribe to real-time events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Events as a `Stream`. Lagged receivers yield an error item and continue.
    pub fn stream(&self) -> BroadcastStream<ProgressEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Broadcast an event. No receivers is fine.
    pub fn emit(&self, event: ProgressEvent) {
        debug!(?event, "Progress event");
        let _ = self.tx.send(event);
    }

    pub fn state(&self) -> DispatchState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<DispatchState> {
        self.state.subscribe()
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// state changed.
    pub fn set_state(&self, next: DispatchState) -> bool {
        let mut rejected_from = None;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                rejected_from = Some(*current);
                return false;
            }
            *current = next;
            true
        });

        if let Some(from) = rejected_from {
            warn!(from = %from, to = %next, "Ignoring invalid dispatch state transition");
        }
        if changed {
            self.emit(ProgressEvent::State { state: next });
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let observer = ProgressObserver::new();
        let mut rx = observer.subscribe();

        observer.emit(ProgressEvent::Progress { sent: 1, total: 3 });
        assert_eq!(
            rx.recv().await.unwrap(),
            ProgressEvent::Progress { sent: 1, total: 3 }
        );
    }

    #[tokio::test]
    async fn state_changes_are_broadcast() {
        let observer = ProgressObserver::new();
        let mut stream = observer.stream();

        assert!(observer.set_state(DispatchState::Running));
        assert_eq!(observer.state(), DispatchState::Running);

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(
            event,
            ProgressEvent::State {
                state: DispatchState::Running
            }
        );
    }

    #[test]
    fn invalid_transition_is_ignored() {
        let observer = ProgressObserver::new();
        assert!(!observer.set_state(DispatchState::Succeeded));
        assert_eq!(observer.state(), DispatchState::Idle);

        observer.set_state(DispatchState::Running);
        assert!(!observer.set_state(DispatchState::Running));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(ProgressEvent::Escalation { streak: 2 }).unwrap();
        assert_eq!(json["type"], "escalation");
        assert_eq!(json["streak"], 2);

        let json = serde_json::to_value(ProgressEvent::Status {
            status: "No tasks".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "status");
    }
}
