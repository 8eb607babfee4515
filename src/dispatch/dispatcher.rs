//! Dispatch loop: fetch a batch, transmit one job at a time, retire each
//! job as soon as its transmission is issued.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::job::normalize_address;
use super::progress::{ProgressEvent, ProgressObserver};
use super::state::{DispatchState, RunMode};
use crate::channels::{ChannelRegistry, Correlation, SmsChannel};
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::store::{IssueLog, TaskSource};

/// Result of one fetch-and-send cycle.
#[derive(Debug)]
enum Cycle {
    /// The queue had nothing pending.
    Empty,
    /// A batch was walked to the end.
    Batch { sent: usize, total: usize },
    /// The fetch failed or timed out.
    SourceUnavailable(DispatchError),
    /// Cancellation was observed mid-cycle.
    Cancelled,
}

/// Runs dispatch loops against one task source and channel registry.
pub struct Dispatcher {
    source: Arc<dyn TaskSource>,
    issued: Arc<dyn IssueLog>,
    channels: Arc<ChannelRegistry>,
    observer: Arc<ProgressObserver>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn TaskSource>,
        issued: Arc<dyn IssueLog>,
        channels: Arc<ChannelRegistry>,
        observer: Arc<ProgressObserver>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            source,
            issued,
            channels,
            observer,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run until cancelled (or, in single-batch mode, until one batch is
    /// done). Progress goes to the observer; the terminal state is returned.
    ///
    /// Setting `cancel` to `true` or dropping its sender stops the loop.
    pub async fn run(
        &self,
        account_id: &str,
        slot: usize,
        mode: RunMode,
        mut cancel: watch::Receiver<bool>,
    ) -> DispatchState {
        let channel = self.channels.select(slot);
        info!(
            account_id = %account_id,
            slot,
            channel = %channel.name(),
            ?mode,
            "Dispatch loop started"
        );

        loop {
            if is_cancelled(&cancel) {
                break;
            }

            let cycle = AssertUnwindSafe(self.run_cycle(account_id, channel.as_ref(), &mut cancel))
                .catch_unwind()
                .await;

            let pause = match cycle {
                Ok(Cycle::Cancelled) => break,
                Ok(Cycle::Empty) => {
                    debug!("No pending jobs");
                    if mode == RunMode::SingleBatch {
                        self.observer.emit(status("No tasks"));
                        return DispatchState::Succeeded;
                    }
                    self.config.idle_interval
                }
                Ok(Cycle::Batch { sent, total }) => {
                    info!(sent, total, "Batch finished");
                    if mode == RunMode::SingleBatch {
                        self.observer
                            .emit(status(&format!("Sent {sent} of {total} messages")));
                        return DispatchState::Succeeded;
                    }
                    self.config.idle_interval
                }
                Ok(Cycle::SourceUnavailable(e)) => {
                    warn!(error = %e, "Task source unavailable, backing off");
                    if mode == RunMode::SingleBatch {
                        self.observer.emit(status(&e.to_string()));
                        return DispatchState::Failed;
                    }
                    self.config.source_backoff
                }
                Err(panic) => {
                    let e = DispatchError::LoopPanicked(panic_message(panic.as_ref()));
                    error!(error = %e, "Dispatch cycle failed");
                    if mode == RunMode::SingleBatch {
                        self.observer.emit(status(&e.to_string()));
                        return DispatchState::Failed;
                    }
                    self.config.idle_interval
                }
            };

            if !sleep_or_cancel(pause, &mut cancel).await {
                break;
            }
        }

        info!(account_id = %account_id, "Dispatch loop cancelled");
        DispatchState::Cancelled
    }

    async fn run_cycle(
        &self,
        account_id: &str,
        channel: &dyn SmsChannel,
        cancel: &mut watch::Receiver<bool>,
    ) -> Cycle {
        let fetch = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch_pending());
        let fetched = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Cycle::Cancelled,
            r = fetch => r,
        };

        let jobs = match fetched {
            Ok(Ok(jobs)) => jobs,
            Ok(Err(e)) => return Cycle::SourceUnavailable(DispatchError::SourceUnavailable(e.to_string())),
            Err(_) => {
                return Cycle::SourceUnavailable(DispatchError::SourceUnavailable(format!(
                    "fetch did not complete within {:?}",
                    self.config.fetch_timeout
                )));
            }
        };

        if jobs.is_empty() {
            return Cycle::Empty;
        }

        let total = jobs.len();
        let mut sent = 0;
        debug!(total, "Fetched batch");

        for raw in jobs {
            if is_cancelled(cancel) {
                return Cycle::Cancelled;
            }

            let job = match raw.validate() {
                Ok(job) => job,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed job");
                    continue;
                }
            };

            let address = normalize_address(&job.destination, &self.config.default_country_code);
            let correlation = Correlation {
                job_id: job.id.clone(),
                account_id: account_id.to_string(),
                address: address.to_string(),
            };

            // Recorded before transmitting so the completion signal can't
            // outrun it.
            if let Err(e) = self.issued.record_issued(&job.id, account_id).await {
                error!(job_id = %job.id, error = %e, "Failed to record issued job");
            }

            let transmitted = channel.transmit(&address, &job.body, &correlation).await;

            // Retire whatever the channel said: one physical attempt per job.
            if let Err(e) = self.source.retire(&job.id).await {
                error!(job_id = %job.id, error = %e, "Failed to retire job");
            }

            match transmitted {
                Ok(parts) => {
                    sent += 1;
                    debug!(job_id = %job.id, address = %address, parts, "Transmission issued");
                    self.observer.emit(ProgressEvent::Progress { sent, total });
                }
                Err(e) => {
                    let e = DispatchError::TransmitRejected {
                        job_id: job.id.clone(),
                        reason: e.to_string(),
                    };
                    warn!(error = %e, "Transmission rejected");
                }
            }

            if !sleep_or_cancel(self.config.inter_message_delay, cancel).await {
                return Cycle::Cancelled;
            }
        }

        Cycle::Batch { sent, total }
    }
}

fn status(text: &str) -> ProgressEvent {
    ProgressEvent::Status {
        status: text.to_string(),
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Resolves once cancellation is requested or the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `duration`. Returns `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
