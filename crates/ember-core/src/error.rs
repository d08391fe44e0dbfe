//! Error taxonomy for the runtime, split the way `flux::shared::NetworkError`
//! is split: a `Wait` variant for "not ready yet, try again later" (never
//! logged, never surfaced to a service) and a `Fatal(Kind)` variant for
//! conditions that tear down a connection or abort an operation.

use std::fmt;
use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum NetError {
    /// Not an error: the operation would block. Retry later, never surfaced.
    Wait,
    Fatal(ErrorKind),
}

/// The taxonomy from spec §7. Kinds, not type names: each is a terminal
/// condition for one connection (or one pending accept/connect/read).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ErrorKind {
    SendQueueTooBig,
    ReadTimeout,
    ReadMessageTooBig,
    WriteMessageTooBig,
    WsBadReservedBits,
    WsBadContinuation,
    WsBadOpcode,
    WsBadLength,
    WsClosed,
    ResolveFailed,
    ConnectFailed,
    Io(io::ErrorKind),
    AddrParse,
    ProtocolError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SendQueueTooBig => "send_queue_too_big",
            ErrorKind::ReadTimeout => "read_timeout",
            ErrorKind::ReadMessageTooBig => "read_message_too_big",
            ErrorKind::WriteMessageTooBig => "write_message_too_big",
            ErrorKind::WsBadReservedBits => "ws_bad_reserved_bits",
            ErrorKind::WsBadContinuation => "ws_bad_continuation",
            ErrorKind::WsBadOpcode => "ws_bad_opcode",
            ErrorKind::WsBadLength => "ws_bad_length",
            ErrorKind::WsClosed => "ws_closed",
            ErrorKind::ResolveFailed => "resolve_failed",
            ErrorKind::ConnectFailed => "connect_failed",
            ErrorKind::Io(_) => "io_error",
            ErrorKind::AddrParse => "addr_parse",
            ErrorKind::ProtocolError => "protocol_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Wait => write!(f, "wait"),
            NetError::Fatal(kind) => write!(f, "{}", kind),
        }
    }
}

impl std::error::Error for NetError {}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    fn from(_: net::AddrParseError) -> Self {
        NetError::Fatal(ErrorKind::AddrParse)
    }
}

pub trait ErrorUtils {
    /// True for anything other than `Ok` or `Wait` — mirrors
    /// `flux::shared::ErrorUtils::has_failed`, used to collapse the
    /// would-block/fatal split into a single "should I tear this down" check.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetError::Wait))
    }
}

/// Errors surfaced by service/runtime-facing operations (creation, routing,
/// inbox delivery) as opposed to the network taxonomy above.
#[derive(Debug)]
pub enum RuntimeError {
    UnknownAddress(u32),
    UnknownConnection(u32),
    ServiceInitFailed,
    InboxClosed,
    WorkerUnavailable(u8),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::UnknownAddress(addr) => write!(f, "unknown service address {:#010x}", addr),
            RuntimeError::UnknownConnection(fd) => write!(f, "unknown connection fd {:#010x}", fd),
            RuntimeError::ServiceInitFailed => write!(f, "service init() returned false"),
            RuntimeError::InboxClosed => write!(f, "inbox closed"),
            RuntimeError::WorkerUnavailable(id) => write!(f, "worker {} unavailable", id),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_maps_to_wait() {
        let io_err = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(NetError::from(io_err), NetError::Wait);
    }

    #[test]
    fn other_io_errors_are_fatal() {
        let io_err = io::Error::from(io::ErrorKind::ConnectionReset);
        match NetError::from(io_err) {
            NetError::Fatal(ErrorKind::Io(io::ErrorKind::ConnectionReset)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn has_failed_treats_wait_as_not_failed() {
        let wait: NetResult<()> = Err(NetError::Wait);
        assert!(!wait.has_failed());

        let fatal: NetResult<()> = Err(NetError::Fatal(ErrorKind::ReadTimeout));
        assert!(fatal.has_failed());

        let ok: NetResult<()> = Ok(());
        assert!(!ok.has_failed());
    }
}
