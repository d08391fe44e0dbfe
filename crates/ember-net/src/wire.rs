//! Shared wire-level constants and the per-connection flag bits for a
//! connection record. One bit per boolean so a whole connection's status
//! fits in a register-sized word, the way `Channel`'s `ChannelState` keeps
//! status compact.

/// Which of the three framing state machines a connection runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WireMode {
    /// Mode 1: 2-byte big-endian length prefix, optional chunking.
    LengthPrefixed,
    /// Mode 2: read-until-delimiter or read-exactly-N, one-shot per call.
    Delimited,
    /// Mode 3: RFC-6455 WebSocket frames.
    WebSocket,
}

/// Maximum payload length a single length-prefixed frame header can carry
/// directly; `0xFFFF` is reserved as the chunk-continuation marker.
pub const MAX_FRAME_PAYLOAD: usize = 0xFFFE;
pub const CONTINUATION_MARKER: u16 = 0xFFFF;

/// Maximum delimiter length accepted by mode 2's `read(fd, size, delim, ..)`.
pub const MAX_DELIMITER_LEN: usize = 7;

pub mod flags {
    pub const IS_SERVER: u16 = 1 << 0;
    pub const WOULD_CLOSE_AFTER_FLUSH: u16 = 1 << 1;
    pub const READING_IN_PROGRESS: u16 = 1 << 2;
    pub const CHUNKED_RECV: u16 = 1 << 3;
    pub const CHUNKED_SEND: u16 = 1 << 4;
    pub const NODELAY: u16 = 1 << 5;
}
