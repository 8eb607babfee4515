//! Channel registry: maps logical slots to transmission paths.

use std::sync::Arc;

use super::SmsChannel;

/// Slot-indexed set of channels. Slot 0 always exists and is the default.
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn SmsChannel>>,
}

impl ChannelRegistry {
    /// Create a registry with `default` in slot 0.
    pub fn new(default: Arc<dyn SmsChannel>) -> Self {
        Self {
            channels: vec![default],
        }
    }

    /// Add a channel in the next free slot.
    pub fn with_channel(mut self, channel: Arc<dyn SmsChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Number of configured slots.
    pub fn slots(&self) -> usize {
        self.channels.len()
    }

    /// Select the channel for `slot`, falling back to the default channel
    /// when the slot is not configured.
    pub fn select(&self, slot: usize) -> Arc<dyn SmsChannel> {
        match self.channels.get(slot) {
            Some(channel) => Arc::clone(channel),
            None => {
                tracing::warn!(
                    slot,
                    configured = self.channels.len(),
                    "Channel slot not configured, using default channel"
                );
                Arc::clone(&self.channels[0])
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Correlation;
    use crate::dispatch::NormalizedAddress;
    use crate::error::ChannelError;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl SmsChannel for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn transmit(
            &self,
            _address: &NormalizedAddress,
            _body: &str,
            _correlation: &Correlation,
        ) -> Result<usize, ChannelError> {
            Ok(1)
        }
    }

    #[test]
    fn select_configured_slot() {
        let registry = ChannelRegistry::new(Arc::new(Named("sim1")))
            .with_channel(Arc::new(Named("sim2")));
        assert_eq!(registry.slots(), 2);
        assert_eq!(registry.select(0).name(), "sim1");
        assert_eq!(registry.select(1).name(), "sim2");
    }

    #[test]
    fn unknown_slot_falls_back_to_default() {
        let registry = ChannelRegistry::new(Arc::new(Named("sim1")));
        assert_eq!(registry.select(5).name(), "sim1");
        assert_eq!(registry.names(), vec!["sim1".to_string()]);
    }
}
