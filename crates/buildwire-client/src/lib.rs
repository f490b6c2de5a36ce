// ABOUTME: Connection layer for buildwire clients.
// ABOUTME: Transports, the connection manager and Session assembly on top of buildwire-core.

pub mod connection;
pub mod error;
pub mod memory;
pub mod session;
pub mod transport;
pub mod ws;

pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionSettings};
pub use error::ConnectionError;
pub use memory::{MemoryConnector, MemoryPeer, MemoryServer};
pub use session::Session;
pub use transport::{Connection, Connector, FrameSink, FrameSource};
pub use ws::WebSocketConnector;
