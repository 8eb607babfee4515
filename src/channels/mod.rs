//! SMS channel abstraction and the concrete transmission paths.

pub mod channel;
pub mod gateway;
pub mod loopback;
pub mod registry;

pub use channel::*;
pub use gateway::GatewayChannel;
pub use loopback::LoopbackChannel;
pub use registry::ChannelRegistry;
