//! Dispatch lifecycle state machine and run modes.

use serde::{Deserialize, Serialize};

/// Lifecycle state reported to the progress observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// No loop has run yet.
    Idle,
    /// A loop is active.
    Running,
    /// A single-batch run finished.
    Succeeded,
    /// The loop refused to start or a single-batch run could not fetch.
    Failed,
    /// The loop was stopped or superseded.
    Cancelled,
}

impl DispatchState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: DispatchState) -> bool {
        use DispatchState::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Running) | (Idle, Failed) |
            // From Running
            (Running, Succeeded) | (Running, Failed) | (Running, Cancelled) |
            // Any finished loop can be restarted or refused again
            (Succeeded, Running) | (Failed, Running) | (Cancelled, Running) |
            (Succeeded, Failed) | (Cancelled, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// How long a dispatch loop keeps going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Poll forever until cancelled.
    #[default]
    Continuous,
    /// Process one batch, then finish.
    SingleBatch,
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuous" => Ok(Self::Continuous),
            "single_batch" | "single-batch" | "once" => Ok(Self::SingleBatch),
            other => Err(format!(
                "unknown run mode '{other}' (expected 'continuous' or 'single_batch')"
            )),
        }
    }
}
