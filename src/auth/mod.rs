//! Device binding and the local session.

pub mod guard;
pub mod session;
pub mod webhook;

pub use guard::{DeviceGuard, check_binding};
pub use session::{DeviceId, Session};
pub use webhook::WebhookAuth;
