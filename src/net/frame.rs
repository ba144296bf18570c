//! Length prefixed framing for stream connections. Every message is preceded by its length as a
//!  bencoded integer, e.g. `i5ehello`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FrameError {
    #[error("no length header terminator within {0} bytes")]
    HeaderTooLong(usize),
    #[error("malformed length header {0:?}")]
    BadLength(String),
    #[error("message length {len} exceeds maximum of {max}")]
    TooLarge { len: usize, max: usize },
}

pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) {
    buf.put_u8(b'i');
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_u8(b'e');
    buf.put_slice(payload);
}

/// The length of the longest header a message of at most `max_len` bytes can have. If no
///  terminator shows up within that many bytes, the peer is not speaking the protocol.
pub fn max_header_len(max_len: usize) -> usize {
    max_len.to_string().len() + 2
}

/// Incremental decoder: feed it the connection's input buffer whenever new bytes arrive, it
///  consumes complete messages from the front.
#[derive(Debug)]
pub struct FrameDecoder {
    max_len: usize,
    /// length of the message whose header was consumed but whose body is incomplete
    pending_len: Option<usize>,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> FrameDecoder {
        FrameDecoder {
            max_len,
            pending_len: None,
        }
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
    }

    /// returns `Ok(None)` if `buf` does not (yet) hold a complete message
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                let max_header_len = max_header_len(self.max_len);
                let header_window = &buf[..buf.len().min(max_header_len)];
                let end = match header_window.iter().position(|&b| b == b'e') {
                    Some(end) => end,
                    None => {
                        if buf.len() < max_header_len {
                            return Ok(None);
                        }
                        return Err(FrameError::HeaderTooLong(max_header_len));
                    }
                };

                let len = parse_header(&buf[..end])?;
                if len > self.max_len {
                    return Err(FrameError::TooLarge { len, max: self.max_len });
                }
                buf.advance(end + 1);
                self.pending_len = Some(len);
                len
            }
        };

        if buf.len() < len {
            return Ok(None);
        }

        self.pending_len = None;
        Ok(Some(buf.split_to(len).freeze()))
    }
}

fn parse_header(header: &[u8]) -> Result<usize, FrameError> {
    let malformed = || FrameError::BadLength(String::from_utf8_lossy(header).to_string());

    let digits = match header.split_first() {
        Some((b'i', digits)) => digits,
        _ => return Err(malformed()),
    };
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(malformed)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty(b"", b"i0e")]
    #[case::hello(b"hello", b"i5ehello")]
    fn test_encode_frame(#[case] payload: &[u8], #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        encode_frame(payload, &mut buf);
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::single(b"i3eabc", vec![b"abc".to_vec()], b"")]
    #[case::empty_message(b"i0e", vec![vec![]], b"")]
    #[case::two(b"i1eai2ebc", vec![b"a".to_vec(), b"bc".to_vec()], b"")]
    #[case::incomplete_body(b"i5eab", vec![], b"ab")]
    #[case::incomplete_header(b"i12", vec![], b"i12")]
    #[case::trailing_partial(b"i1exi4", vec![b"x".to_vec()], b"i4")]
    fn test_decode(#[case] input: &[u8], #[case] expected: Vec<Vec<u8>>, #[case] remainder: &[u8]) {
        let mut decoder = FrameDecoder::new(100);
        let mut buf = BytesMut::from(input);

        let mut actual = Vec::new();
        while let Some(msg) = decoder.decode(&mut buf).unwrap() {
            actual.push(msg.to_vec());
        }
        assert_eq!(actual, expected);
        assert_eq!(buf.as_ref(), remainder);
    }

    #[test]
    fn test_decode_in_pieces() {
        let mut decoder = FrameDecoder::new(100);
        let mut buf = BytesMut::new();

        for &b in b"i11ehello world".iter() {
            assert_eq!(decoder.decode(&mut buf).unwrap(), None);
            buf.put_u8(b);
        }
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"hello world")));
    }

    #[rstest]
    #[case::no_terminator(b"i12345", FrameError::HeaderTooLong(5))]
    #[case::no_prefix(b"5ehello", FrameError::BadLength("5".to_string()))]
    #[case::negative(b"i-1e", FrameError::BadLength("i-1".to_string()))]
    #[case::no_digits(b"ie", FrameError::BadLength("i".to_string()))]
    #[case::too_large(b"i101e", FrameError::TooLarge { len: 101, max: 100 })]
    fn test_decode_violation(#[case] input: &[u8], #[case] expected: FrameError) {
        let mut decoder = FrameDecoder::new(100);
        let mut buf = BytesMut::from(input);
        assert_eq!(decoder.decode(&mut buf), Err(expected));
    }

    #[test]
    fn test_header_bound_follows_max_len() {
        let mut decoder = FrameDecoder::new(10_000_000_000);
        let mut buf = BytesMut::from(&b"i1000000000e"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        let mut decoder = FrameDecoder::new(100);
        let mut buf = BytesMut::from(&b"i1000e"[..]);
        assert_eq!(decoder.decode(&mut buf), Err(FrameError::HeaderTooLong(5)));
    }

    #[test]
    fn test_max_len_is_inclusive() {
        let mut decoder = FrameDecoder::new(3);
        let mut buf = BytesMut::from(&b"i3eabc"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Bytes::from_static(b"abc")));
    }
}
