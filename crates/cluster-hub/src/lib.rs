//! cluster-hub library: the WebSocket relay and the matching bus client.
//!
//! The binary runs either side; integration tests use both in-process.

pub mod config;
pub mod connection;
pub mod message;
pub mod relay;
pub mod ws_bus;

pub use config::HubSettings;
pub use connection::{ConnectionEvent, NodeConnection};
pub use message::{HandshakeMessage, MAX_MESSAGE_SIZE};
pub use relay::{RelayEvent, RelayServer};
pub use ws_bus::WsBus;
