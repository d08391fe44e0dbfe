//! Per-worker socket server: connection registry and the three wire-mode
//! framers (length-prefixed, delimited, WebSocket) — spec §4.D, §4.E.

pub mod connection;
pub mod framer;
pub mod registry;
pub mod server;
pub mod wire;

pub use connection::{Connection, PendingRead, SendQueue};
pub use registry::ConnectionRegistry;
pub use server::SocketServer;
pub use wire::WireMode;
