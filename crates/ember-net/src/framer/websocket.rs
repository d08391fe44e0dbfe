//! Mode 3 framing: RFC-6455 opening handshake (server and client roles) and
//! the post-handshake frame codec.
//!
//! The handshake's `Sec-WebSocket-Accept` derivation (`sha1`, `base64`) and
//! the client masking key (`rand`) pull in three extra crates for exactly
//! the purpose a reference WebSocket implementation (`fastwebsockets`) pulls
//! in the same three for.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{BigEndian, ByteOrder};
use ember_core::buffer::Buffer;
use ember_core::error::ErrorKind;
use rand::Rng;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_u8(v: u8) -> Option<Opcode> {
        match v {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub opcode: Opcode,
    pub fin: bool,
    pub payload: Vec<u8>,
}

fn server_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(HANDSHAKE_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_header_block(block: &[u8]) -> Option<HashMap<String, String>> {
    let text = std::str::from_utf8(block).ok()?;
    let mut lines = text.split("\r\n");
    lines.next()?; // request/status line, not needed for header lookups
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some(idx) = line.find(':') {
            let name = line[..idx].trim().to_ascii_lowercase();
            let value = line[idx + 1..].trim().to_string();
            headers.insert(name, value);
        }
    }
    Some(headers)
}

fn header_eq_ignore_case(headers: &HashMap<String, String>, name: &str, expected: &str) -> bool {
    headers.get(name).map(|v| v.eq_ignore_ascii_case(expected)).unwrap_or(false)
}

/// Tries to parse a complete server-side opening handshake out of `buf`.
/// Returns `Ok(None)` if the header block (terminated by `\r\n\r\n`) hasn't
/// fully arrived yet.
pub fn try_parse_server_handshake(buf: &[u8]) -> Result<Option<(usize, String)>, ErrorKind> {
    let end = match find_subslice(buf, b"\r\n\r\n") {
        Some(i) => i,
        None => return Ok(None),
    };
    let consumed = end + 4;
    let headers = parse_header_block(&buf[..consumed]).ok_or(ErrorKind::ProtocolError)?;

    if !header_eq_ignore_case(&headers, "upgrade", "websocket") {
        return Err(ErrorKind::ProtocolError);
    }
    if !headers.get("connection").map(|v| v.to_ascii_lowercase().contains("upgrade")).unwrap_or(false) {
        return Err(ErrorKind::ProtocolError);
    }
    let key = headers.get("sec-websocket-key").ok_or(ErrorKind::ProtocolError)?;

    Ok(Some((consumed, server_accept_key(key))))
}

pub fn build_server_handshake_response(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
    .into_bytes()
}

/// Builds a client-role opening request, returning the request bytes and
/// the key the caller must remember to validate the server's response.
pub fn build_client_handshake_request(host: &str, path: &str) -> (Vec<u8>, String) {
    let mut key_bytes = [0u8; 16];
    rand::thread_rng().fill(&mut key_bytes);
    let key = BASE64.encode(key_bytes);

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        path, host, key
    );
    (request.into_bytes(), key)
}

/// Tries to parse a complete server handshake response, validating the
/// returned accept key against the one generated when the request was sent.
pub fn try_parse_client_handshake_response(buf: &[u8], expected_key: &str) -> Result<Option<usize>, ErrorKind> {
    let end = match find_subslice(buf, b"\r\n\r\n") {
        Some(i) => i,
        None => return Ok(None),
    };
    let consumed = end + 4;
    let header_block = &buf[..consumed];
    let headers = parse_header_block(header_block).ok_or(ErrorKind::ProtocolError)?;

    let status_line_end = header_block.iter().position(|&b| b == b'\r').unwrap_or(consumed);
    let status_line = std::str::from_utf8(&header_block[..status_line_end]).map_err(|_| ErrorKind::ProtocolError)?;
    if !status_line.contains("101") {
        return Err(ErrorKind::ProtocolError);
    }

    let accept = headers.get("sec-websocket-accept").ok_or(ErrorKind::ProtocolError)?;
    if *accept != server_accept_key(expected_key) {
        return Err(ErrorKind::ProtocolError);
    }

    Ok(Some(consumed))
}

/// Decodes one frame from `buf` for a connection playing `role` (i.e. `role`
/// is *our* role — a `Role::Server` decodes frames sent by a client, which
/// per RFC 6455 must be masked).
pub fn decode_frame(buf: &mut Buffer, role: Role) -> Result<Option<Frame>, ErrorKind> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let bytes = buf.as_slice();
    let byte0 = bytes[0];
    let byte1 = bytes[1];

    let fin = byte0 & 0x80 != 0;
    let rsv = byte0 & 0x70;
    if rsv != 0 {
        return Err(ErrorKind::WsBadReservedBits);
    }

    let opcode = Opcode::from_u8(byte0 & 0x0F).ok_or(ErrorKind::WsBadOpcode)?;
    if opcode == Opcode::Continuation {
        return Err(ErrorKind::WsBadContinuation);
    }

    let masked = byte1 & 0x80 != 0;
    let expect_masked = role == Role::Server;
    if masked != expect_masked {
        return Err(ErrorKind::ProtocolError);
    }

    let len7 = byte1 & 0x7F;
    let (header_len, payload_len): (usize, usize) = if len7 < 126 {
        (2, len7 as usize)
    } else if len7 == 126 {
        if bytes.len() < 4 {
            return Ok(None);
        }
        (4, BigEndian::read_u16(&bytes[2..4]) as usize)
    } else {
        if role == Role::Server {
            return Err(ErrorKind::WsBadLength);
        }
        if bytes.len() < 10 {
            return Ok(None);
        }
        (10, BigEndian::read_u64(&bytes[2..10]) as usize)
    };

    if opcode.is_control() && (!fin || payload_len > 125) {
        return Err(ErrorKind::ProtocolError);
    }

    let mask_len = if masked { 4 } else { 0 };
    let total = header_len + mask_len + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let bytes = buf.as_slice();
    let mut payload = bytes[header_len + mask_len..total].to_vec();
    if masked {
        let mask_key = [
            bytes[header_len],
            bytes[header_len + 1],
            bytes[header_len + 2],
            bytes[header_len + 3],
        ];
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask_key[i % 4];
        }
    }

    buf.consume(total);
    Ok(Some(Frame { opcode, fin, payload }))
}

fn build_header(payload_len: usize, opcode: Opcode, mask_key: Option<[u8; 4]>) -> Vec<u8> {
    let mut header = Vec::with_capacity(14);
    header.push(0x80 | opcode as u8);

    let mask_bit: u8 = if mask_key.is_some() { 0x80 } else { 0 };
    if payload_len <= 125 {
        header.push(mask_bit | payload_len as u8);
    } else if payload_len <= 0xFFFF {
        header.push(mask_bit | 126);
        let mut ext = [0u8; 2];
        BigEndian::write_u16(&mut ext, payload_len as u16);
        header.extend_from_slice(&ext);
    } else {
        header.push(mask_bit | 127);
        let mut ext = [0u8; 8];
        BigEndian::write_u64(&mut ext, payload_len as u64);
        header.extend_from_slice(&ext);
    }

    if let Some(key) = mask_key {
        header.extend_from_slice(&key);
    }
    header
}

/// Encodes an outbound frame. `role` is *our* role: `Role::Client` frames
/// are always masked with a fresh random key, `Role::Server` frames never
/// are.
pub fn encode_frame(payload: &[u8], opcode: Opcode, role: Role) -> Buffer {
    let mask_key = match role {
        Role::Client => Some(rand::random::<[u8; 4]>()),
        Role::Server => None,
    };

    let mut body = payload.to_vec();
    if let Some(key) = mask_key {
        for (i, b) in body.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }

    let header = build_header(body.len(), opcode, mask_key);
    let mut buf = Buffer::with_head_reserve(body.len(), header.len().max(16));
    buf.write_back(&body);
    let prepended = buf.write_front(&header);
    debug_assert!(prepended, "websocket header must fit the reserved head room");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s5_server_accept_key_matches_rfc6455_example() {
        let accept = server_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn s5_server_handshake_request_parses_and_responds_with_101() {
        let request = b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let (consumed, accept) = try_parse_server_handshake(request).unwrap().unwrap();
        assert_eq!(consumed, request.len());
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        let response = build_server_handshake_response(&accept);
        let response_text = String::from_utf8(response).unwrap();
        assert!(response_text.starts_with("HTTP/1.1 101"));
        assert!(response_text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn s5_client_text_frame_decodes_to_hello() {
        let wire: [u8; 11] = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut buf = Buffer::new(16);
        buf.write_back(&wire);

        let frame = decode_frame(&mut buf, Role::Server).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.fin);
        assert_eq!(frame.payload, b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_incomplete_header_block_waits_for_more_bytes() {
        let partial = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert!(try_parse_server_handshake(partial).unwrap().is_none());
    }

    #[test]
    fn server_rejects_64_bit_length_frames() {
        let mut buf = Buffer::new(16);
        // byte1 len7 = 127 indicates a 64-bit extended length
        buf.write_back(&[0x82, 0xFF]);
        let err = decode_frame(&mut buf, Role::Server).unwrap_err();
        assert_eq!(err, ErrorKind::WsBadLength);
    }

    #[test]
    fn reserved_bits_set_is_fatal() {
        let mut buf = Buffer::new(16);
        buf.write_back(&[0xB2, 0x80, 0, 0, 0, 0]);
        let err = decode_frame(&mut buf, Role::Server).unwrap_err();
        assert_eq!(err, ErrorKind::WsBadReservedBits);
    }

    #[test]
    fn continuation_opcode_is_rejected() {
        let mut buf = Buffer::new(16);
        buf.write_back(&[0x80, 0x80, 0, 0, 0, 0]);
        let err = decode_frame(&mut buf, Role::Server).unwrap_err();
        assert_eq!(err, ErrorKind::WsBadContinuation);
    }

    #[test]
    fn control_frame_over_125_bytes_is_rejected() {
        let mut header = vec![0x89u8, 0x80 | 126];
        header.extend_from_slice(&200u16.to_be_bytes());
        header.extend_from_slice(&[0u8; 4]);
        let mut buf = Buffer::new(256);
        buf.write_back(&header);
        buf.write_back(&vec![0u8; 200]);
        let err = decode_frame(&mut buf, Role::Server).unwrap_err();
        assert_eq!(err, ErrorKind::ProtocolError);
    }

    #[test]
    fn encode_then_decode_round_trips_binary_payload() {
        let payload = b"round trip payload";
        let mut buf = encode_frame(payload, Opcode::Binary, Role::Client);
        let frame = decode_frame(&mut buf, Role::Server).unwrap().unwrap();
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.opcode, Opcode::Binary);
    }

    #[test]
    fn server_to_client_frames_are_unmasked() {
        let mut buf = encode_frame(b"hi", Opcode::Text, Role::Server);
        assert_eq!(buf.as_slice()[1] & 0x80, 0);
        let frame = decode_frame(&mut buf, Role::Client).unwrap().unwrap();
        assert_eq!(frame.payload, b"hi");
    }
}
