//! Shared primitives for the ember actor runtime.
//!
//! Everything here is used by every other `ember-*` crate: the byte buffer
//! connections and services exchange data through, the envelope type that
//! crosses every inbox boundary, the `Address`/`Fd` addressing scheme, the
//! logging setup, and the error taxonomy.

pub mod addr;
pub mod buffer;
pub mod envelope;
pub mod error;
pub mod logging;

pub use addr::{Address, Fd};
pub use buffer::Buffer;
pub use envelope::{Envelope, EnvelopeType, Session};
pub use error::{ErrorKind, ErrorUtils, NetError, NetResult, RuntimeError};
pub use logging::{LogConfig, LogDestination, LogLevel, Logger};
