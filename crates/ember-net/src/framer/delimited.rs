//! Mode 2 framing: text/line-delimited or fixed-size reads. Unlike mode 1,
//! a read is an explicit one-shot request from the service — there is no
//! continuous framing loop, just "do I already have this much buffered?".

use ember_core::buffer::Buffer;

/// What a pending `read(fd, ...)` call on a delimited-mode connection is
/// waiting for.
#[derive(Debug, Clone)]
pub enum ReadRequest {
    /// Read up to (and excluding) the first occurrence of `delim`, which is
    /// then stripped from both the returned data and the buffer.
    UntilDelimiter(Vec<u8>),
    /// Read exactly `n` bytes.
    Exactly(usize),
}

/// Tries to satisfy `req` against currently buffered bytes. Consumes from
/// `buf` only on success.
pub fn try_satisfy(buf: &mut Buffer, req: &ReadRequest) -> Option<Vec<u8>> {
    match req {
        ReadRequest::Exactly(n) => {
            if buf.len() < *n {
                return None;
            }
            let data = buf.as_slice()[..*n].to_vec();
            buf.consume(*n);
            Some(data)
        }
        ReadRequest::UntilDelimiter(delim) => {
            let haystack = buf.as_slice();
            let pos = find_subslice(haystack, delim)?;
            let data = haystack[..pos].to_vec();
            buf.consume(pos + delim.len());
            Some(data)
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_read_waits_until_enough_bytes_buffered() {
        let mut buf = Buffer::new(16);
        buf.write_back(b"ab");
        let req = ReadRequest::Exactly(4);
        assert!(try_satisfy(&mut buf, &req).is_none());

        buf.write_back(b"cd");
        let data = try_satisfy(&mut buf, &req).unwrap();
        assert_eq!(data, b"abcd");
        assert!(buf.is_empty());
    }

    #[test]
    fn delimiter_is_stripped_from_result_and_buffer() {
        let mut buf = Buffer::new(32);
        buf.write_back(b"GET / HTTP/1.1\r\nmore-data-after");
        let req = ReadRequest::UntilDelimiter(b"\r\n".to_vec());
        let data = try_satisfy(&mut buf, &req).unwrap();
        assert_eq!(data, b"GET / HTTP/1.1");
        assert_eq!(buf.as_slice(), b"more-data-after");
    }

    #[test]
    fn missing_delimiter_returns_none_without_consuming() {
        let mut buf = Buffer::new(16);
        buf.write_back(b"no delimiter here");
        let req = ReadRequest::UntilDelimiter(b"\n".to_vec());
        assert!(try_satisfy(&mut buf, &req).is_none());
        assert_eq!(buf.as_slice(), b"no delimiter here");
    }

    #[test]
    fn direct_read_result_when_already_buffered() {
        // mirrors spec 4.D mode 2: if already satisfied, synchronous result
        let mut buf = Buffer::new(16);
        buf.write_back(b"12345\n");
        let req = ReadRequest::UntilDelimiter(b"\n".to_vec());
        assert_eq!(try_satisfy(&mut buf, &req), Some(b"12345".to_vec()));
    }
}
