//! SMS relay: queued message dispatch with delivery tracking.

pub mod api;
pub mod auth;
pub mod channels;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod relay;
pub mod store;

pub use error::{Error, Result};
pub use relay::Relay;
