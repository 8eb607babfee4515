//! Loopback channel: accepts every transmission and reports the result
//! back through the completion-signal queue, one signal per part.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Correlation, SmsChannel, segment_count};
use crate::delivery::CompletionSignal;
use crate::dispatch::NormalizedAddress;
use crate::error::ChannelError;

pub struct LoopbackChannel {
    name: String,
    signals: mpsc::Sender<CompletionSignal>,
    result_code: i32,
}

impl LoopbackChannel {
    /// Every part reports `result_code`.
    pub fn new(
        name: impl Into<String>,
        signals: mpsc::Sender<CompletionSignal>,
        result_code: i32,
    ) -> Self {
        Self {
            name: name.into(),
            signals,
            result_code,
        }
    }
}

#[async_trait]
impl SmsChannel for LoopbackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transmit(
        &self,
        address: &NormalizedAddress,
        body: &str,
        correlation: &Correlation,
    ) -> Result<usize, ChannelError> {
        if self.signals.is_closed() {
            return Err(ChannelError::Unreachable {
                name: self.name.clone(),
                reason: "completion queue closed".to_string(),
            });
        }

        let parts = segment_count(body);
        tracing::debug!(
            channel = %self.name,
            job_id = %correlation.job_id,
            address = %address,
            parts,
            "Loopback transmit"
        );

        // Signals are delivered after transmit returns, like a real radio.
        let signals = self.signals.clone();
        let result_code = self.result_code;
        let correlation = correlation.clone();
        tokio::spawn(async move {
            for part_index in 0..parts {
                let signal = CompletionSignal::for_part(&correlation, result_code, part_index);
                if signals.send(signal).await.is_err() {
                    tracing::warn!(
                        job_id = %correlation.job_id,
                        "Completion queue closed before loopback signal was delivered"
                    );
                    break;
                }
            }
        });

        Ok(parts)
    }
}
