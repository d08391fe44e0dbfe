//! The per-connection record (spec §3 "Connection record") and its send
//! queue. One of these lives in the registry for every accepted, connecting,
//! or listening fd.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ember_core::buffer::Buffer;
use mio::net::TcpStream;

use crate::framer::delimited::ReadRequest;
use crate::framer::length_prefixed::ChunkAssembler;
use crate::framer::websocket::Role as WsRole;
use crate::wire::{flags, WireMode};

/// Ordered sequence of shared byte buffers awaiting delivery to the peer,
/// guarded by two byte-count thresholds (spec §3 "Send queue").
pub struct SendQueue {
    queued: VecDeque<Buffer>,
    queued_bytes: usize,
    warn_size: usize,
    error_size: usize,
}

impl SendQueue {
    pub fn new(warn_size: usize, error_size: usize) -> SendQueue {
        SendQueue {
            queued: VecDeque::new(),
            queued_bytes: 0,
            warn_size,
            error_size,
        }
    }

    /// Enqueues `buf`. Fails (leaving the queue unchanged) once the queue
    /// would reach `error_size` bytes — the caller must close the connection
    /// with `send_queue_too_big`.
    pub fn push(&mut self, buf: Buffer) -> Result<(), ()> {
        let incoming = buf.len();
        if self.queued_bytes + incoming >= self.error_size {
            return Err(());
        }
        self.queued_bytes += incoming;
        self.queued.push_back(buf);
        Ok(())
    }

    pub fn is_over_warn(&self) -> bool {
        self.queued_bytes >= self.warn_size
    }

    pub fn total_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn front_mut(&mut self) -> Option<&mut Buffer> {
        self.queued.front_mut()
    }

    /// Records that `n` bytes of the head buffer were written to the
    /// socket, dropping it once fully drained.
    pub fn notify_written(&mut self, n: usize) {
        let mut remaining = n;
        while remaining > 0 {
            let (drained, is_empty) = match self.queued.front_mut() {
                Some(buf) => {
                    let consumed = buf.consume(remaining);
                    (consumed, buf.is_empty())
                }
                None => break,
            };
            self.queued_bytes = self.queued_bytes.saturating_sub(drained);
            remaining -= drained;
            if is_empty {
                self.queued.pop_front();
            }
            if drained == 0 {
                break;
            }
        }
    }
}

/// What a mode-2 connection's single outstanding `read()` call is waiting
/// for, plus the session id to reply with.
pub struct PendingRead {
    pub request: ReadRequest,
    pub session: i64,
}

pub struct Connection {
    pub fd: u32,
    pub owner: u32,
    pub wire_mode: WireMode,
    pub stream: TcpStream,
    pub recv_buf: Buffer,
    pub send_queue: SendQueue,
    flag_bits: u16,
    pub read_deadline: Instant,
    pub read_timeout: Duration,
    pub pending_read: Option<PendingRead>,
    pub chunk_assembler: ChunkAssembler,
    pub ws_role: Option<WsRole>,
    pub ws_handshake_done: bool,
}

impl Connection {
    pub fn new(fd: u32, owner: u32, wire_mode: WireMode, stream: TcpStream, now: Instant) -> Connection {
        Connection {
            fd,
            owner,
            wire_mode,
            stream,
            recv_buf: Buffer::new(4096),
            send_queue: SendQueue::new(1 << 20, 8 << 20),
            flag_bits: 0,
            read_deadline: now + Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            pending_read: None,
            chunk_assembler: ChunkAssembler::new(),
            ws_role: None,
            ws_handshake_done: wire_mode != WireMode::WebSocket,
        }
    }

    #[inline]
    pub fn set_flag(&mut self, bit: u16) {
        self.flag_bits |= bit;
    }

    #[inline]
    pub fn clear_flag(&mut self, bit: u16) {
        self.flag_bits &= !bit;
    }

    #[inline]
    pub fn has_flag(&self, bit: u16) -> bool {
        self.flag_bits & bit != 0
    }

    #[inline]
    pub fn is_server_side(&self) -> bool {
        self.has_flag(flags::IS_SERVER)
    }

    pub fn touch_read_deadline(&mut self, now: Instant) {
        self.read_deadline = now + self.read_timeout;
    }

    pub fn is_read_timed_out(&self, now: Instant) -> bool {
        now >= self.read_deadline
    }

    pub fn mark_would_close_after_flush(&mut self) {
        self.set_flag(flags::WOULD_CLOSE_AFTER_FLUSH);
    }

    pub fn should_close_now(&self) -> bool {
        self.has_flag(flags::WOULD_CLOSE_AFTER_FLUSH) && self.send_queue.is_empty()
    }
}
