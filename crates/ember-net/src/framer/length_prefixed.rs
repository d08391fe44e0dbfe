//! Mode 1 framing: 2-byte big-endian length prefix, with an optional
//! chunked extension for payloads larger than a single frame can carry.

use byteorder::{BigEndian, ByteOrder};
use ember_core::buffer::Buffer;
use ember_core::error::ErrorKind;

use crate::wire::{CONTINUATION_MARKER, MAX_FRAME_PAYLOAD};

/// Accumulates continuation chunks across calls to `decode_one` until a
/// terminating (non-continuation) frame completes the message.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    pending: Option<Vec<u8>>,
}

impl ChunkAssembler {
    pub fn new() -> ChunkAssembler {
        ChunkAssembler { pending: None }
    }
}

/// Attempts to decode exactly one header+body pair out of `buf`. Returns
/// `Ok(None)` when the buffer doesn't yet hold a full frame — the caller
/// should stop and wait for more bytes. A chunked sequence may require
/// several calls before a payload is finally returned.
pub fn decode_one(buf: &mut Buffer, chunked_recv_enabled: bool, assembler: &mut ChunkAssembler) -> Result<Option<Vec<u8>>, ErrorKind> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let header = BigEndian::read_u16(&buf.as_slice()[..2]);

    if header == CONTINUATION_MARKER {
        if !chunked_recv_enabled {
            return Err(ErrorKind::ReadMessageTooBig);
        }
        let body_len = MAX_FRAME_PAYLOAD;
        if buf.len() < 2 + body_len {
            return Ok(None);
        }
        buf.consume(2);
        let chunk = buf.as_slice()[..body_len].to_vec();
        buf.consume(body_len);
        assembler.pending.get_or_insert_with(Vec::new).extend_from_slice(&chunk);
        return Ok(None);
    }

    let body_len = header as usize;
    if buf.len() < 2 + body_len {
        return Ok(None);
    }
    buf.consume(2);
    let body = buf.as_slice()[..body_len].to_vec();
    buf.consume(body_len);

    match assembler.pending.take() {
        Some(mut acc) => {
            acc.extend_from_slice(&body);
            Ok(Some(acc))
        }
        None => Ok(Some(body)),
    }
}

fn frame(body: &[u8], header: u16) -> Buffer {
    let mut buf = Buffer::with_head_reserve(body.len(), 2);
    buf.write_back(body);
    let mut hdr = [0u8; 2];
    BigEndian::write_u16(&mut hdr, header);
    let prepended = buf.write_front(&hdr);
    debug_assert!(prepended, "2-byte header prepend must always fit the default head reserve");
    buf
}

/// Encodes `payload` into one or more frames ready to push onto the send
/// queue, in wire order. Non-chunked payloads produce exactly one frame.
pub fn encode(payload: &[u8], chunked_send_enabled: bool) -> Result<Vec<Buffer>, ErrorKind> {
    if payload.len() <= MAX_FRAME_PAYLOAD {
        return Ok(vec![frame(payload, payload.len() as u16)]);
    }

    if !chunked_send_enabled {
        return Err(ErrorKind::WriteMessageTooBig);
    }

    let mut frames = Vec::new();
    let mut offset = 0;
    while payload.len() - offset > MAX_FRAME_PAYLOAD {
        let chunk = &payload[offset..offset + MAX_FRAME_PAYLOAD];
        frames.push(frame(chunk, CONTINUATION_MARKER));
        offset += MAX_FRAME_PAYLOAD;
    }

    let last = &payload[offset..];
    frames.push(frame(last, last.len() as u16));

    if last.len() == MAX_FRAME_PAYLOAD {
        frames.push(frame(&[], 0));
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat_wire_bytes(frames: &[Buffer]) -> Vec<u8> {
        let mut out = Vec::new();
        for f in frames {
            out.extend_from_slice(f.as_slice());
        }
        out
    }

    #[test]
    fn s1_echo_frame_matches_exact_wire_bytes() {
        let frames = encode(b"ping", false).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_slice(), &[0x00, 0x04, b'p', b'i', b'n', b'g']);
    }

    #[test]
    fn decode_one_round_trips_small_payload() {
        let mut buf = Buffer::new(16);
        buf.write_back(&[0x00, 0x04, b'p', b'i', b'n', b'g']);
        let mut assembler = ChunkAssembler::new();
        let decoded = decode_one(&mut buf, false, &mut assembler).unwrap();
        assert_eq!(decoded, Some(b"ping".to_vec()));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_one_waits_for_more_bytes() {
        let mut buf = Buffer::new(16);
        buf.write_back(&[0x00, 0x04, b'p', b'i']);
        let mut assembler = ChunkAssembler::new();
        let decoded = decode_one(&mut buf, false, &mut assembler).unwrap();
        assert_eq!(decoded, None);
        // the two-byte header + partial body must still be intact
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn s2_chunked_send_matches_exact_wire_sequence() {
        let payload = vec![0xABu8; 131072]; // exactly 2 * 65534 + 4
        let frames = encode(&payload, true).unwrap();
        let wire = concat_wire_bytes(&frames);

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0xFF, 0xFF]);
        expected.extend_from_slice(&payload[0..65534]);
        expected.extend_from_slice(&[0xFF, 0xFF]);
        expected.extend_from_slice(&payload[65534..131068]);
        expected.extend_from_slice(&[0x00, 0x04]);
        expected.extend_from_slice(&payload[131068..131072]);

        assert_eq!(wire, expected);
    }

    #[test]
    fn chunked_round_trip_reassembles_original_payload() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let frames = encode(&payload, true).unwrap();

        let mut buf = Buffer::new(0);
        for f in &frames {
            buf.write_back(f.as_slice());
        }

        let mut assembler = ChunkAssembler::new();
        let mut decoded = None;
        loop {
            match decode_one(&mut buf, true, &mut assembler).unwrap() {
                Some(full) => {
                    decoded = Some(full);
                    break;
                }
                None if buf.is_empty() => break,
                None => continue,
            }
        }

        assert_eq!(decoded, Some(payload));
    }

    #[test]
    fn trailing_zero_frame_emitted_when_payload_is_exact_chunk_multiple() {
        let payload = vec![0u8; 65534 * 2];
        let frames = encode(&payload, true).unwrap();
        // two continuation chunks plus a trailing 0-length terminator frame
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].as_slice(), &[0x00, 0x00]);
    }

    #[test]
    fn continuation_marker_without_chunking_enabled_is_fatal() {
        let mut buf = Buffer::new(4);
        buf.write_back(&[0xFF, 0xFF]);
        let mut assembler = ChunkAssembler::new();
        let err = decode_one(&mut buf, false, &mut assembler).unwrap_err();
        assert_eq!(err, ErrorKind::ReadMessageTooBig);
    }

    #[test]
    fn oversized_payload_without_chunking_is_rejected_on_send() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let err = encode(&payload, false).unwrap_err();
        assert_eq!(err, ErrorKind::WriteMessageTooBig);
    }
}
