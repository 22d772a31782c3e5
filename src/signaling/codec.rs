//! Signaling wire codec
//!
//! Two framings are supported, selected by [`Framing`]:
//!
//! - `Lines`: one JSON object terminated by `\n` (a trailing `\r` is ignored).
//!   This is what aiortc's TCP signaling speaks.
//! - `LengthPrefixed`: variable-length little-endian header, then the body:
//!   - Length <= 0x3F (63): 1-byte header, format `(len << 2)`
//!   - Length <= 0x3FFF (16383): 2-byte header, format `(len << 2) | 0x1`
//!   - Length <= 0x3FFFFF (4194303): 3-byte header, format `(len << 2) | 0x2`
//!   - Length <= 0x3FFFFFFF: 4-byte header, format `(len << 2) | 0x3`
//!
//!   The low 2 bits of the first byte give the header length minus one.
//!
//! A frame is only handed to the JSON parser once it is complete, so a
//! message is either parsed whole or not at all.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::SignalingMessage;
use crate::config::Framing;
use crate::error::AppError;

/// Hard upper bound of the length-prefixed header
const MAX_PREFIXED_LENGTH: usize = 0x3FFFFFFF;

/// Encode the variable-length header for a body of `len` bytes
fn put_length_header(len: usize, buf: &mut BytesMut) -> Result<(), AppError> {
    if len <= 0x3F {
        buf.put_u8((len << 2) as u8);
    } else if len <= 0x3FFF {
        buf.put_u16_le(((len << 2) as u16) | 0x1);
    } else if len <= 0x3FFFFF {
        let h = ((len << 2) as u32) | 0x2;
        buf.put_u16_le((h & 0xFFFF) as u16);
        buf.put_u8((h >> 16) as u8);
    } else if len <= MAX_PREFIXED_LENGTH {
        buf.put_u32_le(((len << 2) as u32) | 0x3);
    } else {
        return Err(AppError::Signaling("Message too large".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Head,
    Data(usize),
}

/// Stateful codec turning a byte stream into [`SignalingMessage`]s
#[derive(Debug, Clone)]
pub struct SignalingCodec {
    framing: Framing,
    max_message_bytes: usize,
    state: DecodeState,
    /// Bytes of the current line already scanned for `\n`
    scanned: usize,
}

impl SignalingCodec {
    pub fn new(framing: Framing, max_message_bytes: usize) -> Self {
        Self {
            framing,
            max_message_bytes,
            state: DecodeState::Head,
            scanned: 0,
        }
    }

    /// Forget any partially decoded message
    fn reset(&mut self) {
        self.state = DecodeState::Head;
        self.scanned = 0;
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, AppError> {
        loop {
            let start = self.scanned.min(src.len());
            let newline = src[start..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = start + offset;
                    self.scanned = 0;
                    let mut line = src.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(end - 1);
                    }
                    if line.iter().all(|b| b.is_ascii_whitespace()) {
                        // Blank keep-alive line
                        continue;
                    }
                    if line.len() > self.max_message_bytes {
                        return Err(AppError::Signaling(format!(
                            "Message too large: {} bytes",
                            line.len()
                        )));
                    }
                    return Ok(Some(line));
                }
                None => {
                    self.scanned = src.len();
                    if src.len() > self.max_message_bytes {
                        return Err(AppError::Signaling(format!(
                            "Message exceeds {} bytes without terminator",
                            self.max_message_bytes
                        )));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<usize>, AppError> {
        if src.is_empty() {
            return Ok(None);
        }

        let head_len = ((src[0] & 0x3) + 1) as usize;
        if src.len() < head_len {
            return Ok(None);
        }

        let mut n = src[0] as usize;
        if head_len > 1 {
            n |= (src[1] as usize) << 8;
        }
        if head_len > 2 {
            n |= (src[2] as usize) << 16;
        }
        if head_len > 3 {
            n |= (src[3] as usize) << 24;
        }
        n >>= 2;

        if n > self.max_message_bytes {
            return Err(AppError::Signaling(format!("Message too large: {} bytes", n)));
        }

        src.advance(head_len);
        Ok(Some(n))
    }

    fn decode_prefixed(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, AppError> {
        let n = match self.state {
            DecodeState::Head => match self.decode_head(src)? {
                Some(n) => {
                    self.state = DecodeState::Data(n);
                    n
                }
                None => return Ok(None),
            },
            DecodeState::Data(n) => n,
        };

        if src.len() < n {
            src.reserve(n - src.len());
            return Ok(None);
        }
        self.state = DecodeState::Head;
        Ok(Some(src.split_to(n)))
    }
}

impl Decoder for SignalingCodec {
    type Item = SignalingMessage;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = match self.framing {
            Framing::Lines => self.decode_line(src),
            Framing::LengthPrefixed => self.decode_prefixed(src),
        };
        let frame = frame.inspect_err(|_| self.reset())?;
        frame
            .map(|body| SignalingMessage::from_json(&body))
            .transpose()
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                self.reset();
                let pending = buf.len();
                let blank = buf.iter().all(|b| b.is_ascii_whitespace());
                buf.clear();
                if blank {
                    Ok(None)
                } else {
                    Err(AppError::Signaling(format!(
                        "Stream closed inside a message ({} bytes pending)",
                        pending
                    )))
                }
            }
        }
    }
}

impl Encoder<SignalingMessage> for SignalingCodec {
    type Error = AppError;

    fn encode(&mut self, item: SignalingMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.to_json()?;
        if body.len() > self.max_message_bytes {
            return Err(AppError::Signaling(format!(
                "Outgoing {} message too large: {} bytes",
                item.name(),
                body.len()
            )));
        }

        match self.framing {
            Framing::Lines => {
                // serde_json escapes control characters, so the body never
                // contains a raw newline
                dst.reserve(body.len() + 1);
                dst.extend_from_slice(body.as_bytes());
                dst.put_u8(b'\n');
            }
            Framing::LengthPrefixed => {
                dst.reserve(body.len() + 4);
                put_length_header(body.len(), dst)?;
                dst.extend_from_slice(body.as_bytes());
            }
        }
        Ok(())
    }
}
