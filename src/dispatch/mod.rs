//! Dispatch engine: send-jobs, the dispatch loop and its supervisor.

pub mod dispatcher;
pub mod job;
pub mod progress;
pub mod state;
pub mod supervisor;

pub use dispatcher::Dispatcher;
pub use job::{Job, NormalizedAddress, RawJob, normalize_address};
pub use progress::{ProgressEvent, ProgressObserver};
pub use state::{DispatchState, RunMode};
pub use supervisor::{DispatchSupervisor, LoopInfo};
