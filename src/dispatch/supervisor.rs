//! Dispatch supervisor: keeps at most one dispatch loop alive per device.
//!
//! Starting a loop supersedes whatever was running: the old loop is
//! cancelled and awaited before the new one is spawned.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dispatcher::Dispatcher;
use super::progress::{ProgressEvent, ProgressObserver};
use super::state::{DispatchState, RunMode};
use crate::delivery::FailureStreak;
use crate::error::DispatchError;
use crate::store::SessionStore;

/// How long a cancelled loop gets to wind down before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Handle to the running loop.
struct ActiveLoop {
    account_id: String,
    slot: usize,
    mode: RunMode,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Snapshot of the supervisor for status queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoopInfo {
    pub account_id: String,
    pub slot: usize,
    pub mode: RunMode,
    pub finished: bool,
}

pub struct DispatchSupervisor {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<dyn SessionStore>,
    observer: Arc<ProgressObserver>,
    streak: Arc<FailureStreak>,
    active: Mutex<Option<ActiveLoop>>,
}

impl DispatchSupervisor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        sessions: Arc<dyn SessionStore>,
        observer: Arc<ProgressObserver>,
        streak: Arc<FailureStreak>,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            observer,
            streak,
            active: Mutex::new(None),
        }
    }

    /// Start a loop for the signed-in account on `slot`, replacing any loop
    /// already running. Refuses without a session.
    pub async fn start(&self, slot: usize, mode: RunMode) -> Result<(), DispatchError> {
        let session = match self.sessions.load_session().await {
            Ok(Some(session)) => session,
            Ok(None) => return Err(self.refuse().await),
            Err(e) => {
                error!(error = %e, "Failed to load session");
                return Err(self.refuse().await);
            }
        };

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!(
                account_id = %previous.account_id,
                slot = previous.slot,
                "Superseding running dispatch loop"
            );
            self.shutdown(previous).await;
        }

        self.streak.reset();
        self.observer.set_state(DispatchState::Running);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let dispatcher = Arc::clone(&self.dispatcher);
        let observer = Arc::clone(&self.observer);
        let account_id = session.account_id.clone();
        let handle = tokio::spawn(async move {
            let terminal = dispatcher.run(&account_id, slot, mode, cancel_rx).await;
            observer.set_state(terminal);
        });

        info!(account_id = %session.account_id, slot, ?mode, "Dispatch started");
        *active = Some(ActiveLoop {
            account_id: session.account_id,
            slot,
            mode,
            cancel: cancel_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the running loop. Returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        let previous = self.active.lock().await.take();
        match previous {
            Some(previous) => {
                let was_running = !previous.handle.is_finished();
                self.shutdown(previous).await;
                info!("Dispatch stopped");
                was_running
            }
            None => false,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.observer.state()
    }

    pub async fn current(&self) -> Option<LoopInfo> {
        self.active.lock().await.as_ref().map(|a| LoopInfo {
            account_id: a.account_id.clone(),
            slot: a.slot,
            mode: a.mode,
            finished: a.handle.is_finished(),
        })
    }

    async fn refuse(&self) -> DispatchError {
        let e = DispatchError::NotAuthenticated;
        warn!(error = %e, "Dispatch start refused");
        let idle = self
            .active
            .lock()
            .await
            .as_ref()
            .is_none_or(|a| a.handle.is_finished());
        if idle {
            self.observer.set_state(DispatchState::Failed);
        }
        self.observer.emit(ProgressEvent::Status {
            status: e.to_string(),
        });
        e
    }

    async fn shutdown(&self, mut previous: ActiveLoop) {
        let _ = previous.cancel.send(true);
        if tokio::time::timeout(STOP_GRACE, &mut previous.handle)
            .await
            .is_err()
        {
            warn!(account_id = %previous.account_id, "Dispatch loop did not stop in time, aborting");
            previous.handle.abort();
            self.observer.set_state(DispatchState::Cancelled);
        }
    }
}
