//! Command Channel framing.
//!
//! # Wire format
//!
//! ```text
//! LENGTH-PREFIXED (default):
//!   [8 bytes BE: body_len]
//!   [body_len bytes: UTF-8 JSON object]
//!
//! NEWLINE:
//!   [UTF-8 JSON object without raw 0x0A] [0x0A]
//! ```
//!
//! Both directions use the same framing for the lifetime of a connection.
//! A frame that cannot be parsed is reported and skipped; the stream stays
//! usable. A length header beyond [`MAX_FRAME_LEN`] is fatal because the
//! stream position can no longer be trusted.

use std::fmt;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::{FRAME_DELIMITER, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};

/// Framing mode of the Command Channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    LengthPrefixed,
    Newline,
}

/// Fatal framing errors. The connection must be closed.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversized { len: u64, max: usize },

    #[error("payload contains a raw frame delimiter")]
    EmbeddedDelimiter,

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a complete frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Body is not valid JSON.
    Syntax,
    /// Valid JSON that does not match any known message.
    Unrecognized,
}

/// A complete frame whose body was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    pub kind: MalformedKind,
    pub detail: String,
}

impl fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MalformedKind::Syntax => write!(f, "invalid JSON: {}", self.detail),
            MalformedKind::Unrecognized => write!(f, "unrecognized message: {}", self.detail),
        }
    }
}

/// Outcome of decoding the head of a receive buffer.
#[derive(Debug, PartialEq)]
pub enum DecodeResult<T> {
    /// A message and the number of bytes it occupied.
    Complete { message: T, consumed: usize },
    /// More bytes are needed.
    Incomplete,
    /// A frame was delimited but its body was rejected. `consumed` bytes
    /// must be discarded before decoding continues.
    Invalid {
        consumed: usize,
        error: MalformedFrame,
    },
}

/// Decodes at most one message from the front of `buf`.
pub fn decode_frame<T: DeserializeOwned>(
    framing: Framing,
    buf: &[u8],
) -> Result<DecodeResult<T>, FramingError> {
    match framing {
        Framing::LengthPrefixed => decode_length_prefixed(buf),
        Framing::Newline => decode_newline(buf),
    }
}

fn decode_length_prefixed<T: DeserializeOwned>(
    buf: &[u8],
) -> Result<DecodeResult<T>, FramingError> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Ok(DecodeResult::Incomplete);
    }
    let mut header = [0u8; LENGTH_PREFIX_LEN];
    header.copy_from_slice(&buf[..LENGTH_PREFIX_LEN]);
    let len = u64::from_be_bytes(header);
    if len > MAX_FRAME_LEN as u64 {
        return Err(FramingError::Oversized {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let end = LENGTH_PREFIX_LEN + len as usize;
    if buf.len() < end {
        return Ok(DecodeResult::Incomplete);
    }
    Ok(parse_body(&buf[LENGTH_PREFIX_LEN..end], end))
}

fn decode_newline<T: DeserializeOwned>(buf: &[u8]) -> Result<DecodeResult<T>, FramingError> {
    let Some(pos) = buf.iter().position(|b| *b == FRAME_DELIMITER) else {
        if buf.len() > MAX_FRAME_LEN {
            return Err(FramingError::Oversized {
                len: buf.len() as u64,
                max: MAX_FRAME_LEN,
            });
        }
        return Ok(DecodeResult::Incomplete);
    };

    let line = &buf[..pos];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Ok(parse_body(line, pos + 1))
}

fn parse_body<T: DeserializeOwned>(body: &[u8], consumed: usize) -> DecodeResult<T> {
    // Two steps so that syntax errors and unknown messages can be told apart.
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            return DecodeResult::Invalid {
                consumed,
                error: MalformedFrame {
                    kind: MalformedKind::Syntax,
                    detail: e.to_string(),
                },
            };
        }
    };

    match serde_json::from_value(value) {
        Ok(message) => DecodeResult::Complete { message, consumed },
        Err(e) => DecodeResult::Invalid {
            consumed,
            error: MalformedFrame {
                kind: MalformedKind::Unrecognized,
                detail: e.to_string(),
            },
        },
    }
}

/// Serializes `message` and appends one frame to `dst`.
pub fn encode_frame<T: Serialize>(
    framing: Framing,
    message: &T,
    dst: &mut BytesMut,
) -> Result<(), FramingError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FramingError::Oversized {
            len: body.len() as u64,
            max: MAX_FRAME_LEN,
        });
    }

    match framing {
        Framing::LengthPrefixed => {
            dst.reserve(LENGTH_PREFIX_LEN + body.len());
            dst.put_u64(body.len() as u64);
            dst.put_slice(&body);
        }
        Framing::Newline => {
            if body.contains(&FRAME_DELIMITER) {
                return Err(FramingError::EmbeddedDelimiter);
            }
            dst.reserve(body.len() + 1);
            dst.put_slice(&body);
            dst.put_u8(FRAME_DELIMITER);
        }
    }
    Ok(())
}

/// An item produced by [`MessageCodec`].
#[derive(Debug, PartialEq)]
pub enum Inbound<T> {
    Message(T),
    Malformed(MalformedFrame),
}

/// `tokio_util` codec reading `In` and writing `Out`.
///
/// The Board Agent uses `MessageCodec<Command, Event>`, the Controller the
/// reverse.
pub struct MessageCodec<In, Out> {
    framing: Framing,
    _marker: PhantomData<fn() -> (In, Out)>,
}

impl<In, Out> MessageCodec<In, Out> {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            _marker: PhantomData,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

impl<In, Out> Clone for MessageCodec<In, Out> {
    fn clone(&self) -> Self {
        Self::new(self.framing)
    }
}

impl<In, Out> fmt::Debug for MessageCodec<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("framing", &self.framing)
            .finish()
    }
}

impl<In, Out> Default for MessageCodec<In, Out> {
    fn default() -> Self {
        Self::new(Framing::default())
    }
}

impl<In: DeserializeOwned, Out> Decoder for MessageCodec<In, Out> {
    type Item = Inbound<In>;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_frame::<In>(self.framing, &src[..])? {
            DecodeResult::Complete { message, consumed } => {
                src.advance(consumed);
                Ok(Some(Inbound::Message(message)))
            }
            DecodeResult::Invalid { consumed, error } => {
                src.advance(consumed);
                Ok(Some(Inbound::Malformed(error)))
            }
            DecodeResult::Incomplete => {
                if self.framing == Framing::LengthPrefixed && src.len() >= LENGTH_PREFIX_LEN {
                    let mut header = [0u8; LENGTH_PREFIX_LEN];
                    header.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
                    let needed = LENGTH_PREFIX_LEN + u64::from_be_bytes(header) as usize;
                    src.reserve(needed.saturating_sub(src.len()));
                }
                Ok(None)
            }
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for MessageCodec<In, Out> {
    type Error = FramingError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(self.framing, &item, dst)
    }
}
