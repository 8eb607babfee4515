//! HTTP/WebSocket control surface.

pub mod routes;

pub use routes::{AppState, relay_routes};
