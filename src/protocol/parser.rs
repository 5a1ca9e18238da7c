//! Incremental reply parser
//!
//! The connection appends socket reads to a `BytesMut`; a reply is removed
//! from it only once every byte of it has arrived.

use bytes::{Buf, Bytes, BytesMut};

use super::Frame;

/// Bounds applied to untrusted replies.
#[derive(Debug, Clone)]
pub struct ParserLimits {
    /// Largest accepted bulk string, 512MB like the server default
    pub max_bulk_string_size: usize,
    pub max_array_elements: usize,
    /// Arrays nested deeper than this are refused
    pub max_nesting_depth: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_bulk_string_size: 512 * 1024 * 1024,
            max_array_elements: 1 << 20,
            max_nesting_depth: 32,
        }
    }
}

/// Why a buffer could not be turned into a frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// More bytes are needed
    #[error("incomplete data")]
    Incomplete,

    #[error("invalid protocol: {0}")]
    Invalid(String),

    #[error("frame too large: {0}")]
    FrameTooLarge(String),
}

/// Parse one reply with the default limits.
///
/// `Ok(None)` means the buffer holds only part of a reply and was left
/// untouched.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
    parse_frame_with_limits(buf, &ParserLimits::default())
}

/// Parse one reply, refusing anything beyond `limits`.
pub fn parse_frame_with_limits(
    buf: &mut BytesMut,
    limits: &ParserLimits,
) -> Result<Option<Frame>, ParseError> {
    let mut reader = Reader {
        input: &buf[..],
        pos: 0,
        limits,
    };
    match reader.frame(0) {
        Ok(frame) => {
            let used = reader.pos;
            buf.advance(used);
            Ok(Some(frame))
        }
        Err(ParseError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
    limits: &'a ParserLimits,
}

impl<'a> Reader<'a> {
    fn frame(&mut self, depth: usize) -> Result<Frame, ParseError> {
        let tag = self.take(1)?[0];
        let frame = match tag {
            b'+' => Frame::Simple(Bytes::copy_from_slice(self.line()?)),
            b'-' => Frame::Error(Bytes::copy_from_slice(self.line()?)),
            b':' => Frame::Integer(self.number()?),
            b'$' => match self.length("bulk string", self.limits.max_bulk_string_size)? {
                None => Frame::Bulk(None),
                Some(len) => {
                    let payload = Bytes::copy_from_slice(self.take(len)?);
                    if self.take(2)? != b"\r\n" {
                        return Err(ParseError::Invalid("expected CRLF".into()));
                    }
                    Frame::Bulk(Some(payload))
                }
            },
            b'*' => match self.length("array", self.limits.max_array_elements)? {
                None => Frame::Array(None),
                Some(count) => {
                    if depth >= self.limits.max_nesting_depth {
                        return Err(ParseError::FrameTooLarge(format!(
                            "arrays nested deeper than {}",
                            self.limits.max_nesting_depth
                        )));
                    }
                    // The count is untrusted until the elements arrive.
                    let mut items = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        items.push(self.frame(depth + 1)?);
                    }
                    Frame::Array(Some(items))
                }
            },
            b'_' => {
                self.line()?;
                Frame::Null
            }
            other => return Err(unexpected_tag(other)),
        };
        Ok(frame)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos + n;
        let Some(slice) = self.input.get(self.pos..end) else {
            return Err(ParseError::Incomplete);
        };
        self.pos = end;
        Ok(slice)
    }

    /// Bytes up to the next CRLF, terminator consumed but not returned.
    fn line(&mut self) -> Result<&'a [u8], ParseError> {
        let rest = &self.input[self.pos..];
        let Some(len) = rest.windows(2).position(|w| w == b"\r\n") else {
            return Err(ParseError::Incomplete);
        };
        self.pos += len + 2;
        Ok(&rest[..len])
    }

    fn number(&mut self) -> Result<i64, ParseError> {
        let raw = self.line()?;
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                ParseError::Invalid(format!("invalid integer: {}", String::from_utf8_lossy(raw)))
            })
    }

    /// Header length of a bulk string or array; `None` for the `-1` nil.
    fn length(&mut self, what: &str, max: usize) -> Result<Option<usize>, ParseError> {
        match self.number()? {
            -1 => Ok(None),
            n if n < 0 => Err(ParseError::Invalid(format!("negative {what} length"))),
            n if n as u64 > max as u64 => Err(ParseError::FrameTooLarge(format!(
                "{what} length {n} exceeds limit {max}"
            ))),
            n => Ok(Some(n as usize)),
        }
    }
}

#[cold]
fn unexpected_tag(byte: u8) -> ParseError {
    ParseError::Invalid(format!("unexpected byte: {byte:02x}"))
}
