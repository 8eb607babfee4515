//! Delivery correlator: turns raw completion signals into outcomes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::applier::OutcomeApplier;
use crate::channels::Correlation;
use crate::error::DeliveryError;

/// Confirmed or failed result of one transmission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    Confirmed,
    Failed,
}

/// Outcome of one transmission, ready for the applier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub job_id: String,
    pub account_id: String,
    pub address: String,
    pub result: DeliveryResult,
}

/// Raw completion report from a channel. Correlation fields are optional
/// because external reporters may drop them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub job_id: Option<String>,
    pub account_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub result_code: i32,
    #[serde(default)]
    pub part_index: usize,
}

impl CompletionSignal {
    pub fn for_part(correlation: &Correlation, result_code: i32, part_index: usize) -> Self {
        Self {
            job_id: Some(correlation.job_id.clone()),
            account_id: Some(correlation.account_id.clone()),
            address: Some(correlation.address.clone()),
            result_code,
            part_index,
        }
    }
}

/// Maps completion signals to outcomes.
#[derive(Debug, Clone, Copy)]
pub struct Correlator {
    ok_code: i32,
}

impl Correlator {
    /// `ok_code` is the raw result code that means delivered.
    pub fn new(ok_code: i32) -> Self {
        Self { ok_code }
    }

    /// Produce the outcome for a signal. Only part 0 of a multi-part
    /// message yields an outcome; other parts return `Ok(None)`.
    pub fn correlate(
        &self,
        signal: CompletionSignal,
    ) -> Result<Option<DeliveryOutcome>, DeliveryError> {
        if signal.part_index != 0 {
            return Ok(None);
        }

        let job_id = required(signal.job_id, "job_id")?;
        let account_id = required(signal.account_id, "account_id")?;
        let address = required(signal.address, "address")?;

        let result = if signal.result_code == self.ok_code {
            DeliveryResult::Confirmed
        } else {
            DeliveryResult::Failed
        };

        Ok(Some(DeliveryOutcome {
            job_id,
            account_id,
            address,
            result,
        }))
    }
}

fn required(field: Option<String>, name: &'static str) -> Result<String, DeliveryError> {
    field
        .filter(|s| !s.trim().is_empty())
        .ok_or(DeliveryError::MissingCorrelation(name))
}

/// Consume completion signals until every sender is dropped, forwarding
/// each outcome to the applier on its own task.
pub fn spawn_correlator(
    correlator: Correlator,
    applier: Arc<OutcomeApplier>,
    mut signals: mpsc::Receiver<CompletionSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            let part_index = signal.part_index;
            match correlator.correlate(signal) {
                Ok(Some(outcome)) => {
                    let applier = Arc::clone(&applier);
                    tokio::spawn(async move {
                        applier.apply(outcome).await;
                    });
                }
                Ok(None) => debug!(part_index, "Ignoring non-leading part"),
                Err(e) => warn!(error = %e, "Discarding completion signal"),
            }
        }
        info!("Completion signal queue closed, correlator stopped");
    })
}
