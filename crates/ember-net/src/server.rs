//! The per-worker socket server: owns the reactor, the listener table, and
//! the connection registry, and turns I/O readiness into envelopes the
//! worker delivers to owning services (spec §4.E, §4.F pump #1).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use ember_core::addr::Fd;
use ember_core::buffer::Buffer;
use ember_core::envelope::{Envelope, EnvelopeType};
use ember_core::error::{ErrorKind, NetError, NetResult};
use indexmap::IndexMap;
use mio::net::{TcpListener, TcpStream};

use crate::connection::{Connection, PendingRead};
use crate::framer::delimited::{self, ReadRequest};
use crate::framer::length_prefixed;
use crate::framer::websocket::{self, Role as WsRole};
use crate::registry::ConnectionRegistry;
use crate::wire::{flags, WireMode, MAX_DELIMITER_LEN};

/// Envelope subtypes distinguishing the role an `EnvelopeType::SocketTcp`/
/// `SocketWs`/`SocketHttp` envelope plays, per spec §3's example
/// (`socket_accept` vs `socket_recv`).
pub mod subtype {
    pub const SOCKET_ACCEPT: u8 = 1;
    pub const SOCKET_CONNECT: u8 = 2;
    pub const SOCKET_RECV: u8 = 3;
    pub const SOCKET_CLOSE: u8 = 4;
    pub const SOCKET_PING: u8 = 5;
    pub const SOCKET_PONG: u8 = 6;
    pub const DIRECT_READ_RESULT: u8 = 7;
}

/// Result of `SocketServer::write`. Only `Enqueued` means the bytes are on
/// their way; the other two variants carry the envelope the caller must
/// route to the connection's owner (spec §7).
pub enum WriteOutcome {
    Enqueued,
    /// Connection unknown or already closing; nothing to report.
    Unknown,
    /// `send_queue_too_big`: the connection is already closed.
    QueueOverflow(Envelope),
    /// `write_message_too_big`: the connection is still open, the send was
    /// just dropped.
    TooBig(Envelope),
}

const LISTENER_SLOT_BIT: u32 = 1 << 23;

struct Listener {
    stream: TcpListener,
    owner: u32,
    wire_mode: WireMode,
    ws_role: Option<WsRole>,
    pending_accept: Option<i64>,
}

struct PendingConnect {
    owner: u32,
    session: i64,
    wire_mode: WireMode,
    ws_key: Option<String>,
}

fn buffer_from(bytes: &[u8]) -> Buffer {
    let mut buf = Buffer::new(bytes.len());
    buf.write_back(bytes);
    buf
}

fn error_payload(addr: &str, kind: ErrorKind) -> Buffer {
    let text = format!("{{\"addr\":\"{}\",\"code\":0,\"message\":\"{}\"}}", addr, kind);
    buffer_from(text.as_bytes())
}

pub struct SocketServer {
    worker_id: u8,
    poll: mio::Poll,
    events: mio::Events,
    registry: ConnectionRegistry,
    listeners: IndexMap<u32, Listener>,
    listener_next_slot: u32,
    pending_connects: HashMap<u32, PendingConnect>,
    /// Envelopes produced synchronously by a service-facing call (e.g. a
    /// `connect` whose DNS resolve failed before any fd was allocated) that
    /// have nowhere to go until the next `pump()` drains them.
    pending_immediate: Vec<Envelope>,
}

impl SocketServer {
    pub fn new(worker_id: u8) -> io::Result<SocketServer> {
        Ok(SocketServer {
            worker_id,
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            registry: ConnectionRegistry::new(worker_id),
            listeners: IndexMap::new(),
            listener_next_slot: 0,
            pending_connects: HashMap::new(),
            pending_immediate: Vec::new(),
        })
    }

    fn alloc_listener_fd(&mut self) -> u32 {
        let slot = (self.listener_next_slot & 0x007F_FFFF) | LISTENER_SLOT_BIT;
        self.listener_next_slot = self.listener_next_slot.wrapping_add(1);
        u32::from(Fd::new(self.worker_id, slot))
    }

    // -- service-facing operations (spec 4.E) --------------------------------

    pub fn listen(&mut self, host: &str, port: u16, owner: u32, wire_mode: WireMode, ws_role: Option<WsRole>) -> io::Result<u32> {
        let addr: SocketAddr = format!("{}:{}", host, port).parse().map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let stream = TcpListener::bind(&addr)?;
        let fd = self.alloc_listener_fd();
        self.poll.register(&stream, mio::Token(fd as usize), mio::Ready::readable(), mio::PollOpt::edge())?;
        self.listeners.insert(
            fd,
            Listener {
                stream,
                owner,
                wire_mode,
                ws_role,
                pending_accept: None,
            },
        );
        Ok(fd)
    }

    /// One-shot accept request. Tries immediately; if nothing is pending,
    /// remembers the request so `pump` can complete it once the listener
    /// becomes readable.
    pub fn accept(&mut self, listen_fd: u32, session: i64) -> NetResult<Option<Envelope>> {
        let owner = {
            let listener = self.listeners.get(&listen_fd).ok_or(NetError::Fatal(ErrorKind::ProtocolError))?;
            listener.owner
        };

        match self.try_accept_once(listen_fd) {
            Some(fd) => Ok(Some(Envelope::new(EnvelopeType::SocketTcp, listen_fd, owner, -session, buffer_from(&fd.to_be_bytes())).with_subtype(subtype::SOCKET_ACCEPT))),
            None => {
                if let Some(listener) = self.listeners.get_mut(&listen_fd) {
                    listener.pending_accept = Some(session);
                }
                Ok(None)
            }
        }
    }

    fn try_accept_once(&mut self, listen_fd: u32) -> Option<u32> {
        let (stream, owner, wire_mode, ws_role) = {
            let listener = self.listeners.get_mut(&listen_fd)?;
            match listener.stream.accept() {
                Ok((stream, _peer)) => (stream, listener.owner, listener.wire_mode, listener.ws_role),
                Err(_) => return None,
            }
        };

        let mut conn = Connection::new(0, owner, wire_mode, stream, Instant::now());
        conn.set_flag(flags::IS_SERVER);
        conn.ws_role = ws_role;
        let fd = self.registry.insert(conn)?;
        if let Some(c) = self.registry.get(fd) {
            let _ = self.poll.register(&c.stream, mio::Token(fd as usize), mio::Ready::readable() | mio::Ready::writable(), mio::PollOpt::edge());
        }
        Some(fd)
    }

    /// Resolves and connects; completion (success or failure) is delivered
    /// later, by session, once the reactor observes the socket become
    /// writable (or fails to connect at all). Per spec, there is no direct
    /// blocking call here: even a resolve failure that happens before any fd
    /// exists still reaches the caller as a negated-session envelope rather
    /// than a synchronous `Err`, queued for the next `pump()` to deliver.
    pub fn connect(&mut self, host: &str, port: u16, owner: u32, wire_mode: WireMode, session: i64) -> NetResult<()> {
        let addr = match (host, port).to_socket_addrs().ok().and_then(|mut addrs| addrs.next()) {
            Some(addr) => addr,
            None => {
                self.pending_immediate
                    .push(Envelope::new(EnvelopeType::Error, 0, owner, -session, error_payload(host, ErrorKind::ResolveFailed)));
                return Ok(());
            }
        };

        let stream = TcpStream::connect(&addr).map_err(|_| NetError::Fatal(ErrorKind::ConnectFailed))?;

        let ws_key = if wire_mode == WireMode::WebSocket {
            let (request, key) = websocket::build_client_handshake_request(host, "/");
            Some((request, key))
        } else {
            None
        };

        let mut conn = Connection::new(0, owner, wire_mode, stream, Instant::now());
        if wire_mode == WireMode::WebSocket {
            conn.ws_role = Some(WsRole::Client);
        }
        let fd = self.registry.insert(conn).ok_or(NetError::Fatal(ErrorKind::ConnectFailed))?;

        if let Some((request, key)) = ws_key {
            if let Some(c) = self.registry.get_mut(fd) {
                let _ = c.send_queue.push(buffer_from(&request));
            }
            self.pending_connects.insert(
                fd,
                PendingConnect {
                    owner,
                    session,
                    wire_mode,
                    ws_key: Some(key),
                },
            );
        } else {
            self.pending_connects.insert(
                fd,
                PendingConnect {
                    owner,
                    session,
                    wire_mode,
                    ws_key: None,
                },
            );
        }

        if let Some(c) = self.registry.get(fd) {
            let _ = self.poll.register(&c.stream, mio::Token(fd as usize), mio::Ready::readable() | mio::Ready::writable(), mio::PollOpt::edge());
        }
        Ok(())
    }

    pub fn read(&mut self, fd: u32, req: ReadRequest, session: i64) -> NetResult<Option<Vec<u8>>> {
        if let ReadRequest::UntilDelimiter(ref d) = req {
            if d.len() > MAX_DELIMITER_LEN {
                return Err(NetError::Fatal(ErrorKind::ProtocolError));
            }
        }

        let conn = self.registry.get_mut(fd).ok_or(NetError::Fatal(ErrorKind::ProtocolError))?;
        if let Some(data) = delimited::try_satisfy(&mut conn.recv_buf, &req) {
            return Ok(Some(data));
        }
        conn.pending_read = Some(PendingRead { request: req, session });
        conn.set_flag(flags::READING_IN_PROGRESS);
        Ok(None)
    }

    /// Encodes `payload` per the connection's wire mode and enqueues it.
    /// Per spec §7: a `write_message_too_big` encode failure drops the send
    /// and reports back to the owner via an `error` envelope, the connection
    /// itself stays open; a `send_queue_too_big` overflow closes the
    /// connection immediately (not once the queue eventually drains — it
    /// won't, that's the whole premise of the overflow) and reports back via
    /// the ordinary `socket_close` envelope (spec §8 scenario S4).
    pub fn write(&mut self, fd: u32, payload: &[u8]) -> WriteOutcome {
        let (wire_mode, ws_role, chunked_send, owner) = {
            let conn = match self.registry.get(fd) {
                Some(c) => c,
                None => return WriteOutcome::Unknown,
            };
            if conn.has_flag(flags::WOULD_CLOSE_AFTER_FLUSH) {
                return WriteOutcome::Unknown;
            }
            (conn.wire_mode, conn.ws_role, conn.has_flag(flags::CHUNKED_SEND), conn.owner)
        };

        let frames: Result<Vec<Buffer>, ErrorKind> = match wire_mode {
            WireMode::LengthPrefixed => length_prefixed::encode(payload, chunked_send),
            WireMode::Delimited => Ok(vec![buffer_from(payload)]),
            WireMode::WebSocket => {
                let role = ws_role.unwrap_or(WsRole::Server);
                Ok(vec![websocket::encode_frame(payload, websocket::Opcode::Binary, role)])
            }
        };

        let frames = match frames {
            Ok(frames) => frames,
            Err(kind) => {
                let envelope = Envelope::new(EnvelopeType::Error, fd, owner, 0, error_payload("", kind));
                return WriteOutcome::TooBig(envelope);
            }
        };

        for f in frames {
            let overflowed = match self.registry.get_mut(fd) {
                Some(conn) => conn.send_queue.push(f).is_err(),
                None => return WriteOutcome::Unknown,
            };
            if overflowed {
                self.registry.remove(fd);
                let envelope =
                    Envelope::new(EnvelopeType::SocketTcp, fd, owner, 0, error_payload("", ErrorKind::SendQueueTooBig)).with_subtype(subtype::SOCKET_CLOSE);
                return WriteOutcome::QueueOverflow(envelope);
            }
        }
        WriteOutcome::Enqueued
    }

    pub fn close(&mut self, fd: u32) -> bool {
        match self.registry.get_mut(fd) {
            Some(conn) => {
                if conn.send_queue.is_empty() {
                    self.registry.remove(fd);
                } else {
                    conn.mark_would_close_after_flush();
                }
                true
            }
            None => false,
        }
    }

    pub fn settimeout(&mut self, fd: u32, seconds: u64) -> bool {
        match self.registry.get_mut(fd) {
            Some(conn) => {
                conn.read_timeout = Duration::from_secs(seconds);
                true
            }
            None => false,
        }
    }

    pub fn setnodelay(&mut self, fd: u32) -> bool {
        match self.registry.get_mut(fd) {
            Some(conn) => {
                let _ = conn.stream.set_nodelay(true);
                conn.set_flag(flags::NODELAY);
                true
            }
            None => false,
        }
    }

    pub fn set_enable_chunked(&mut self, fd: u32, recv: bool, send: bool) -> bool {
        match self.registry.get_mut(fd) {
            Some(conn) => {
                if recv {
                    conn.set_flag(flags::CHUNKED_RECV);
                } else {
                    conn.clear_flag(flags::CHUNKED_RECV);
                }
                if send {
                    conn.set_flag(flags::CHUNKED_SEND);
                } else {
                    conn.clear_flag(flags::CHUNKED_SEND);
                }
                true
            }
            None => false,
        }
    }

    // -- reactor pump (spec 4.F pump #1) -------------------------------------

    pub fn pump(&mut self, now: Instant, timeout: Duration) -> io::Result<Vec<Envelope>> {
        self.poll.poll(&mut self.events, Some(timeout))?;

        let ready: Vec<(u32, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token().0 as u32, e.readiness().is_readable(), e.readiness().is_writable()))
            .collect();

        let mut out = std::mem::take(&mut self.pending_immediate);

        for (fd, readable, writable) in ready {
            if self.listeners.contains_key(&fd) {
                if readable {
                    self.pump_listener(fd, &mut out);
                }
                continue;
            }

            if self.pending_connects.contains_key(&fd) {
                self.complete_connect(fd, writable, &mut out);
                continue;
            }

            if readable {
                self.pump_read(fd, now, &mut out);
            }
            if writable {
                self.pump_write(fd, &mut out);
            }
        }

        self.sweep_read_timeouts(now, &mut out);
        Ok(out)
    }

    fn pump_listener(&mut self, listen_fd: u32, out: &mut Vec<Envelope>) {
        let pending_session = match self.listeners.get(&listen_fd) {
            Some(l) => l.pending_accept,
            None => return,
        };
        let session = match pending_session {
            Some(s) => s,
            None => return,
        };

        if let Some(fd) = self.try_accept_once(listen_fd) {
            let owner = self.listeners.get(&listen_fd).map(|l| l.owner).unwrap_or(0);
            self.listeners.get_mut(&listen_fd).unwrap().pending_accept = None;
            out.push(Envelope::new(EnvelopeType::SocketTcp, listen_fd, owner, -session, buffer_from(&fd.to_be_bytes())).with_subtype(subtype::SOCKET_ACCEPT));
        }
    }

    fn complete_connect(&mut self, fd: u32, writable: bool, out: &mut Vec<Envelope>) {
        if !writable {
            return;
        }
        let pending = match self.pending_connects.remove(&fd) {
            Some(p) => p,
            None => return,
        };

        let connect_ok = self.registry.get(fd).map(|c| c.stream.take_error().ok().flatten().is_none()).unwrap_or(false);

        if !connect_ok {
            self.registry.remove(fd);
            out.push(Envelope::new(EnvelopeType::Error, fd, pending.owner, -pending.session, error_payload("", ErrorKind::ConnectFailed)));
            return;
        }

        if pending.wire_mode == WireMode::WebSocket {
            // handshake completion is observed later, via pump_read, once
            // the server's HTTP response bytes arrive.
            self.pending_connects.insert(
                fd,
                PendingConnect {
                    owner: pending.owner,
                    session: pending.session,
                    wire_mode: pending.wire_mode,
                    ws_key: pending.ws_key,
                },
            );
            return;
        }

        out.push(Envelope::new(EnvelopeType::SocketTcp, fd, pending.owner, -pending.session, buffer_from(&fd.to_be_bytes())).with_subtype(subtype::SOCKET_CONNECT));
    }

    fn pump_read(&mut self, fd: u32, now: Instant, out: &mut Vec<Envelope>) {
        let mut scratch = [0u8; 8192];
        loop {
            let read_result = match self.registry.get_mut(fd) {
                Some(conn) => conn.stream.read(&mut scratch),
                None => return,
            };

            match read_result {
                Ok(0) => {
                    self.close_with_reason(fd, None, out);
                    return;
                }
                Ok(n) => {
                    if let Some(conn) = self.registry.get_mut(fd) {
                        conn.recv_buf.write_back(&scratch[..n]);
                        conn.touch_read_deadline(now);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.close_with_reason(fd, None, out);
                    return;
                }
            }
        }

        self.drain_decoded_messages(fd, out);
    }

    fn drain_decoded_messages(&mut self, fd: u32, out: &mut Vec<Envelope>) {
        loop {
            let wire_mode = match self.registry.get(fd) {
                Some(c) => c.wire_mode,
                None => return,
            };

            match wire_mode {
                WireMode::LengthPrefixed => {
                    let decoded = {
                        let conn = match self.registry.get_mut(fd) {
                            Some(c) => c,
                            None => return,
                        };
                        let chunked = conn.has_flag(flags::CHUNKED_RECV);
                        length_prefixed::decode_one(&mut conn.recv_buf, chunked, &mut conn.chunk_assembler)
                    };
                    match decoded {
                        Ok(Some(payload)) => {
                            if let Some(conn) = self.registry.get(fd) {
                                out.push(
                                    Envelope::new(EnvelopeType::SocketTcp, fd, conn.owner, 0, buffer_from(&payload)).with_subtype(subtype::SOCKET_RECV),
                                );
                            }
                        }
                        Ok(None) => return,
                        Err(kind) => {
                            self.close_with_reason(fd, Some(kind), out);
                            return;
                        }
                    }
                }
                WireMode::Delimited => {
                    let satisfied = {
                        let conn = match self.registry.get_mut(fd) {
                            Some(c) => c,
                            None => return,
                        };
                        let pending = match conn.pending_read.take() {
                            Some(p) => p,
                            None => return,
                        };
                        match delimited::try_satisfy(&mut conn.recv_buf, &pending.request) {
                            Some(data) => Some((data, pending.session)),
                            None => {
                                conn.pending_read = Some(pending);
                                None
                            }
                        }
                    };
                    match satisfied {
                        Some((data, session)) => {
                            if let Some(conn) = self.registry.get_mut(fd) {
                                conn.clear_flag(flags::READING_IN_PROGRESS);
                                out.push(
                                    Envelope::new(EnvelopeType::SocketTcp, fd, conn.owner, -session, buffer_from(&data)).with_subtype(subtype::SOCKET_RECV),
                                );
                            }
                            continue;
                        }
                        None => return,
                    }
                }
                WireMode::WebSocket => {
                    if !self.ensure_ws_handshake(fd, out) {
                        return;
                    }
                    self.drain_ws_frames(fd, out);
                    return;
                }
            }
        }
    }

    /// Returns `true` once the handshake for `fd` is complete (or was
    /// already complete); `false` if more bytes are still needed (or the
    /// connection was closed due to a handshake error).
    fn ensure_ws_handshake(&mut self, fd: u32, out: &mut Vec<Envelope>) -> bool {
        let (already_done, role) = match self.registry.get(fd) {
            Some(c) => (c.ws_handshake_done, c.ws_role.unwrap_or(WsRole::Server)),
            None => return false,
        };
        if already_done {
            return true;
        }

        match role {
            WsRole::Server => {
                let result = {
                    let conn = self.registry.get(fd).unwrap();
                    websocket::try_parse_server_handshake(conn.recv_buf.as_slice())
                };
                match result {
                    Ok(Some((consumed, accept))) => {
                        let response = websocket::build_server_handshake_response(&accept);
                        if let Some(conn) = self.registry.get_mut(fd) {
                            conn.recv_buf.consume(consumed);
                            conn.ws_handshake_done = true;
                            let _ = conn.send_queue.push(buffer_from(&response));
                        }
                        true
                    }
                    Ok(None) => false,
                    Err(kind) => {
                        self.close_with_reason(fd, Some(kind), out);
                        false
                    }
                }
            }
            WsRole::Client => {
                let expected_key = self.pending_connects.get(&fd).and_then(|p| p.ws_key.clone());
                let expected_key = match expected_key {
                    Some(k) => k,
                    None => return false,
                };
                let result = {
                    let conn = self.registry.get(fd).unwrap();
                    websocket::try_parse_client_handshake_response(conn.recv_buf.as_slice(), &expected_key)
                };
                match result {
                    Ok(Some(consumed)) => {
                        let pending = self.pending_connects.remove(&fd);
                        if let Some(conn) = self.registry.get_mut(fd) {
                            conn.recv_buf.consume(consumed);
                            conn.ws_handshake_done = true;
                        }
                        if let Some(pending) = pending {
                            out.push(
                                Envelope::new(EnvelopeType::SocketWs, fd, pending.owner, -pending.session, buffer_from(&fd.to_be_bytes()))
                                    .with_subtype(subtype::SOCKET_CONNECT),
                            );
                        }
                        true
                    }
                    Ok(None) => false,
                    Err(kind) => {
                        self.close_with_reason(fd, Some(kind), out);
                        false
                    }
                }
            }
        }
    }

    fn drain_ws_frames(&mut self, fd: u32, out: &mut Vec<Envelope>) {
        loop {
            let role = match self.registry.get(fd) {
                Some(c) => c.ws_role.unwrap_or(WsRole::Server),
                None => return,
            };
            let decoded = {
                let conn = match self.registry.get_mut(fd) {
                    Some(c) => c,
                    None => return,
                };
                websocket::decode_frame(&mut conn.recv_buf, role)
            };

            match decoded {
                Ok(Some(frame)) => {
                    let owner = match self.registry.get(fd) {
                        Some(c) => c.owner,
                        None => return,
                    };
                    match frame.opcode {
                        websocket::Opcode::Text | websocket::Opcode::Binary => {
                            out.push(Envelope::new(EnvelopeType::SocketWs, fd, owner, 0, buffer_from(&frame.payload)).with_subtype(subtype::SOCKET_RECV));
                        }
                        websocket::Opcode::Ping => {
                            out.push(Envelope::new(EnvelopeType::SocketWs, fd, owner, 0, buffer_from(&frame.payload)).with_subtype(subtype::SOCKET_PING));
                        }
                        websocket::Opcode::Pong => {
                            out.push(Envelope::new(EnvelopeType::SocketWs, fd, owner, 0, buffer_from(&frame.payload)).with_subtype(subtype::SOCKET_PONG));
                        }
                        websocket::Opcode::Close => {
                            let (code, reason) = parse_close_payload(&frame.payload);
                            let text = format!("{{\"addr\":\"\",\"code\":{},\"message\":\"{}\"}}", code, reason);
                            out.push(Envelope::new(EnvelopeType::SocketWs, fd, owner, 0, buffer_from(text.as_bytes())).with_subtype(subtype::SOCKET_CLOSE));
                            self.registry.remove(fd);
                            return;
                        }
                        websocket::Opcode::Continuation => unreachable!("decode_frame rejects continuation frames"),
                    }
                }
                Ok(None) => return,
                Err(kind) => {
                    self.close_with_reason(fd, Some(kind), out);
                    return;
                }
            }
        }
    }

    fn pump_write(&mut self, fd: u32, out: &mut Vec<Envelope>) {
        loop {
            let conn = match self.registry.get_mut(fd) {
                Some(c) => c,
                None => return,
            };
            let slice_ptr = match conn.send_queue.front_mut() {
                Some(buf) if !buf.is_empty() => buf.as_slice().as_ptr(),
                Some(_) => {
                    conn.send_queue.notify_written(0);
                    continue;
                }
                None => break,
            };
            let len = conn.send_queue.front_mut().unwrap().len();
            let slice = unsafe { std::slice::from_raw_parts(slice_ptr, len) };

            match conn.stream.write(slice) {
                Ok(0) => break,
                Ok(n) => conn.send_queue.notify_written(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.close_with_reason(fd, None, out);
                    return;
                }
            }
        }

        if let Some(conn) = self.registry.get(fd) {
            if conn.should_close_now() {
                self.registry.remove(fd);
            }
        }
    }

    fn close_with_reason(&mut self, fd: u32, reason: Option<ErrorKind>, out: &mut Vec<Envelope>) {
        let (owner, ws_role) = match self.registry.get(fd) {
            Some(c) => (c.owner, c.ws_role),
            None => return,
        };
        if let Some(kind) = reason {
            if is_ws_policy_violation(kind) {
                self.send_ws_close_frame(fd, 1002, ws_role.unwrap_or(WsRole::Server));
            }
        }
        let payload = error_payload("", reason.unwrap_or(ErrorKind::ProtocolError));
        out.push(Envelope::new(EnvelopeType::SocketTcp, fd, owner, 0, payload).with_subtype(subtype::SOCKET_CLOSE));
        self.registry.remove(fd);
    }

    /// Best-effort: writes a masked/unmasked Close frame carrying `code`
    /// straight to the socket. The connection is about to be dropped from
    /// the registry either way, so a partial write or `WouldBlock` here is
    /// not itself an error worth reporting.
    fn send_ws_close_frame(&mut self, fd: u32, code: u16, role: WsRole) {
        let frame = websocket::encode_frame(&code.to_be_bytes(), websocket::Opcode::Close, role);
        if let Some(conn) = self.registry.get_mut(fd) {
            let _ = conn.stream.write_all(frame.as_slice());
        }
    }

    fn sweep_read_timeouts(&mut self, now: Instant, out: &mut Vec<Envelope>) {
        let timed_out: Vec<u32> = self
            .registry
            .fds()
            .filter(|fd| self.registry.get(*fd).map(|c| c.is_read_timed_out(now)).unwrap_or(false))
            .collect();
        for fd in timed_out {
            self.close_with_reason(fd, Some(ErrorKind::ReadTimeout), out);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Tears every connection and in-flight accept/connect down, emitting
    /// exactly one terminating envelope per pending operation so a caller
    /// waiting on a session never hangs (spec §9 "Open question: graceful
    /// shutdown of in-flight accepts/connects" — resolved by making every
    /// path uniform with the ordinary error path, `close_with_reason`).
    pub fn shutdown(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();

        let pending_accepts: Vec<(u32, u32, i64)> = self
            .listeners
            .iter()
            .filter_map(|(&fd, l)| l.pending_accept.map(|session| (fd, l.owner, session)))
            .collect();
        for (listen_fd, owner, session) in pending_accepts {
            out.push(Envelope::new(EnvelopeType::Error, listen_fd, owner, -session, error_payload("", ErrorKind::ProtocolError)));
        }
        self.listeners.clear();

        let pending_connects: Vec<(u32, u32, i64)> = self.pending_connects.iter().map(|(&fd, p)| (fd, p.owner, p.session)).collect();
        for (fd, owner, session) in pending_connects {
            out.push(Envelope::new(EnvelopeType::Error, fd, owner, -session, error_payload("", ErrorKind::ConnectFailed)));
            self.registry.remove(fd);
        }
        self.pending_connects.clear();

        let live_fds: Vec<u32> = self.registry.fds().collect();
        for fd in live_fds {
            self.close_with_reason(fd, None, &mut out);
        }

        out
    }
}

fn is_ws_policy_violation(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WsBadReservedBits | ErrorKind::WsBadContinuation | ErrorKind::WsBadOpcode | ErrorKind::WsBadLength
    )
}

fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (1005, String::new());
    }
    let code = BigEndian::read_u16(&payload[..2]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (code, reason)
}
