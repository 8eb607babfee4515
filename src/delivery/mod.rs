//! Delivery tracking: correlating completion signals and applying outcomes.

pub mod applier;
pub mod correlator;

pub use applier::{ApplyOutcome, FailureStreak, OutcomeApplier};
pub use correlator::{
    CompletionSignal, Correlator, DeliveryOutcome, DeliveryResult, spawn_correlator,
};
