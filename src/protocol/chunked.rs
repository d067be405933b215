//! Chunked transfer-coding: chunk-size parsing, a restartable decoder and
//! the matching encoder

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

/// Longest chunk-size line (size plus extensions) we accept
const MAX_CHUNK_LINE: usize = 4096;
/// Upper bound on the trailer section of a chunked body
const MAX_TRAILER_SIZE: usize = 16 * 1024;

/// Result of parsing a chunk-size line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// More bytes are needed before the line can be parsed
    Incomplete,
    /// The line is not a valid chunk-size line
    Malformed,
    /// A chunk of `size` bytes follows; `consumed` bytes of line were read
    Size { size: u64, consumed: usize },
}

/// Parse the chunk-size line at the start of `buf`
pub fn parse_chunk(buf: &[u8]) -> ChunkStatus {
    let line_end = match buf.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None if buf.len() > MAX_CHUNK_LINE => return ChunkStatus::Malformed,
        None => return ChunkStatus::Incomplete,
    };
    if line_end > MAX_CHUNK_LINE {
        return ChunkStatus::Malformed;
    }

    let line = &buf[..line_end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    // Extensions after ';' are ignored
    let size_part = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let digits = trim_ascii(size_part);
    if digits.is_empty() || digits.len() > 16 {
        return ChunkStatus::Malformed;
    }

    let mut size: u64 = 0;
    for &digit in digits {
        let value = match (digit as char).to_digit(16) {
            Some(v) => v as u64,
            None => return ChunkStatus::Malformed,
        };
        size = (size << 4) | value;
    }

    ChunkStatus::Size {
        size,
        consumed: line_end + 1,
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for a chunked body
///
/// Input may be split at any byte boundary; bytes that cannot be decoded yet
/// stay in the caller's buffer for the next call.
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: DecoderState,
    trailers: BytesMut,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::Size,
            trailers: BytesMut::new(),
        }
    }

    /// Raw trailer lines (each ending in CRLF) seen after the last chunk
    pub fn trailers(&self) -> &[u8] {
        &self.trailers
    }

    /// Decode as much of `input` as possible, appending chunk data to `out`
    ///
    /// Returns `true` once the terminating chunk and trailers were consumed.
    /// Bytes following the body are left in `input`.
    pub fn decode(&mut self, input: &mut BytesMut, out: &mut BytesMut) -> Result<bool> {
        loop {
            match self.state {
                DecoderState::Size => match parse_chunk(input) {
                    ChunkStatus::Incomplete => return Ok(false),
                    ChunkStatus::Malformed => {
                        return Err(Error::protocol("malformed chunk size line"));
                    }
                    ChunkStatus::Size { size, consumed } => {
                        input.advance(consumed);
                        self.state = if size == 0 {
                            DecoderState::Trailer
                        } else {
                            DecoderState::Data(size)
                        };
                    }
                },
                DecoderState::Data(remaining) => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = remaining.min(input.len() as u64) as usize;
                    out.extend_from_slice(&input.split_to(take));
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        DecoderState::DataEnd
                    } else {
                        DecoderState::Data(remaining)
                    };
                }
                DecoderState::DataEnd => {
                    if input.starts_with(b"\r\n") {
                        input.advance(2);
                    } else if input.starts_with(b"\n") {
                        input.advance(1);
                    } else if input.is_empty() || &input[..] == b"\r" {
                        return Ok(false);
                    } else {
                        return Err(Error::protocol("chunk data not followed by CRLF"));
                    }
                    self.state = DecoderState::Size;
                }
                DecoderState::Trailer => {
                    let line_end = match input.iter().position(|&b| b == b'\n') {
                        Some(pos) => pos,
                        None if self.trailers.len() + input.len() > MAX_TRAILER_SIZE => {
                            return Err(Error::protocol("chunked trailer section too large"));
                        }
                        None => return Ok(false),
                    };
                    let line = input.split_to(line_end + 1);
                    if line[..] == b"\r\n"[..] || line[..] == b"\n"[..] {
                        self.state = DecoderState::Done;
                    } else {
                        if self.trailers.len() + line.len() > MAX_TRAILER_SIZE {
                            return Err(Error::protocol("chunked trailer section too large"));
                        }
                        self.trailers.extend_from_slice(&line);
                    }
                }
                DecoderState::Done => return Ok(true),
            }
        }
    }
}

/// Append `data` to `out` as one chunk; empty data is skipped so it cannot
/// be mistaken for the terminating chunk
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    let size = format!("{:x}\r\n", data.len());
    out.reserve(size.len() + data.len() + 2);
    out.put_slice(size.as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// Append the terminating chunk with the given raw trailer lines
pub fn encode_last_chunk(trailers: &[u8], out: &mut BytesMut) {
    out.put_slice(b"0\r\n");
    out.put_slice(trailers);
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"4\r\nWiki\r\n5;name=value\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nExpires: never\r\n\r\n";

    fn decode_all(parts: &[&[u8]]) -> (Vec<u8>, Vec<u8>, bool) {
        let mut decoder = ChunkedDecoder::new();
        let mut input = BytesMut::new();
        let mut out = BytesMut::new();
        let mut done = false;
        for part in parts {
            input.extend_from_slice(part);
            done = decoder.decode(&mut input, &mut out).unwrap();
        }
        (out.to_vec(), decoder.trailers().to_vec(), done)
    }

    #[test]
    fn test_parse_chunk() {
        assert_eq!(parse_chunk(b"1a\r\n"), ChunkStatus::Size { size: 26, consumed: 4 });
        assert_eq!(parse_chunk(b"0\r\n\r\n"), ChunkStatus::Size { size: 0, consumed: 3 });
        assert_eq!(parse_chunk(b"5;ext=1\r\nhello"), ChunkStatus::Size { size: 5, consumed: 9 });
        assert_eq!(parse_chunk(b"FF"), ChunkStatus::Incomplete);
        assert_eq!(parse_chunk(b""), ChunkStatus::Incomplete);
        assert_eq!(parse_chunk(b"zz\r\n"), ChunkStatus::Malformed);
        assert_eq!(parse_chunk(b"\r\n"), ChunkStatus::Malformed);
        assert_eq!(parse_chunk(b"11111111111111111\r\n"), ChunkStatus::Malformed);
    }

    #[test]
    fn test_decode_in_one_shot() {
        let (data, trailers, done) = decode_all(&[BODY]);
        assert!(done);
        assert_eq!(data, b"Wikipedia in\r\n\r\nchunks.");
        assert_eq!(trailers, b"Expires: never\r\n");
    }

    #[test]
    fn test_decode_is_split_invariant() {
        let (expected, expected_trailers, _) = decode_all(&[BODY]);

        for first in 0..=BODY.len() {
            for second in first..=BODY.len() {
                let (data, trailers, done) =
                    decode_all(&[&BODY[..first], &BODY[first..second], &BODY[second..]]);
                assert!(done, "split at {}/{}", first, second);
                assert_eq!(data, expected, "split at {}/{}", first, second);
                assert_eq!(trailers, expected_trailers);
            }
        }
    }

    #[test]
    fn test_decode_leaves_following_bytes() {
        let mut decoder = ChunkedDecoder::new();
        let mut input = BytesMut::from(&b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\n"[..]);
        let mut out = BytesMut::new();
        assert!(decoder.decode(&mut input, &mut out).unwrap());
        assert_eq!(&out[..], b"abc");
        assert_eq!(&input[..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_decode_rejects_missing_crlf() {
        let mut decoder = ChunkedDecoder::new();
        let mut input = BytesMut::from(&b"3\r\nabcX\r\n"[..]);
        let mut out = BytesMut::new();
        assert!(decoder.decode(&mut input, &mut out).is_err());
    }

    #[test]
    fn test_decode_bounds_unterminated_trailer() {
        let mut decoder = ChunkedDecoder::new();
        let mut input = BytesMut::from(&b"0\r\n"[..]);
        let mut out = BytesMut::new();
        assert!(!decoder.decode(&mut input, &mut out).unwrap());

        let mut outcome = Ok(false);
        for _ in 0..256 {
            input.extend_from_slice(&[b'a'; 4096]);
            outcome = decoder.decode(&mut input, &mut out);
            if outcome.is_err() {
                break;
            }
        }
        assert!(outcome.is_err());
        assert!(input.len() <= MAX_TRAILER_SIZE + 4096);
    }

    #[test]
    fn test_encode() {
        let mut out = BytesMut::new();
        encode_chunk(b"data", &mut out);
        encode_chunk(b"", &mut out);
        encode_last_chunk(b"", &mut out);
        assert_eq!(&out[..], b"4\r\ndata\r\n0\r\n\r\n");
    }
}
