//! RESP2/RESP3 wire codec.
//!
//! The decoder is incremental: it parses from a byte slice and reports how
//! many bytes a complete frame consumed, or `None` when the buffer does not
//! yet hold a full frame. Nothing is consumed on `None`, so the caller can
//! retry with the same buffer once more bytes arrive from the socket. The
//! encoder renders commands as arrays of bulk strings and is binary-safe.

use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use thiserror::Error;

pub const TAG_SIMPLE: u8 = b'+';
pub const TAG_ERROR: u8 = b'-';
pub const TAG_INTEGER: u8 = b':';
pub const TAG_BULK: u8 = b'$';
pub const TAG_ARRAY: u8 = b'*';
pub const TAG_MAP: u8 = b'%';
pub const TAG_SET: u8 = b'~';
pub const TAG_ATTRIBUTE: u8 = b'|';
pub const TAG_NULL: u8 = b'_';
pub const TAG_BOOLEAN: u8 = b'#';
pub const TAG_DOUBLE: u8 = b',';
pub const TAG_BIG_NUMBER: u8 = b'(';
pub const TAG_VERBATIM: u8 = b'=';
pub const TAG_PUSH: u8 = b'>';

/// Pre-rendered decimal bytes for 0..=255. Argument counts and bulk lengths
/// are almost always small, so the encoder skips formatting for them.
static SMALL_DECIMALS: Lazy<Vec<Bytes>> =
    Lazy::new(|| (0u16..=255).map(|i| Bytes::from(i.to_string())).collect());

/// Errors raised while decoding a frame. All of them are fatal to the
/// connection that produced the bytes: a desynchronized RESP stream cannot
/// be re-synchronized safely.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RespError {
    #[error("invalid UTF-8 sequence")]
    InvalidUtf8,
    #[error("unknown RESP type tag 0x{0:02x}")]
    UnknownTypeTag(u8),
    #[error("failed to parse integer field")]
    InvalidInteger,
    #[error("length field out of range")]
    LengthOutOfRange,
    #[error("failed to parse double field")]
    InvalidDouble,
    #[error("invalid boolean field")]
    InvalidBoolean,
    #[error("invalid null field")]
    InvalidNull,
    #[error("malformed verbatim string")]
    InvalidVerbatim,
    #[error("bulk payload missing terminator")]
    MissingTerminator,
}

/// A single decoded RESP frame.
///
/// RESP2 aggregates (`*`) and RESP3 aggregates (`%`, `~`, `>`) all decode
/// into this one union so dispatch logic can be matched exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Bulk(Bytes),
    Null,
    Array(Vec<RespValue>),
    Map(Vec<(RespValue, RespValue)>),
    Push(Vec<RespValue>),
    Verbatim { format: String, text: String },
    BigNumber(String),
}

impl RespValue {
    /// Convenience constructor for a bulk string.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::Bulk(data.into())
    }

    /// The leading kind token of an error reply (`MOVED`, `ERR`, ...).
    pub fn error_kind(&self) -> Option<&str> {
        match self {
            RespValue::Error(line) => {
                Some(line.split_once(' ').map(|(kind, _)| kind).unwrap_or(line))
            }
            _ => None,
        }
    }

    /// Byte payload of bulk, simple and verbatim frames.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Bulk(data) => Some(data),
            RespValue::Simple(text) => Some(text.as_bytes()),
            RespValue::Verbatim { text, .. } => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// UTF-8 view of bulk, simple and verbatim frames.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Bulk(data) => std::str::from_utf8(data).ok(),
            RespValue::Simple(text) => Some(text),
            RespValue::Verbatim { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Integer payload, accepting the textual form servers sometimes use.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RespValue::Integer(value) => Some(*value),
            RespValue::Bulk(data) => std::str::from_utf8(data).ok()?.parse().ok(),
            RespValue::Simple(text) => text.parse().ok(),
            _ => None,
        }
    }

    /// Elements of array-shaped frames.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(items) | RespValue::Push(items) => Some(items),
            _ => None,
        }
    }

    /// True for frames that must be routed to pub/sub dispatch instead of
    /// reply correlation: RESP3 push frames always, and RESP2 arrays whose
    /// head is a `message`/`pmessage` marker.
    pub fn is_push_message(&self) -> bool {
        match self {
            RespValue::Push(_) => true,
            RespValue::Array(items) => matches!(
                items.first().and_then(|head| head.as_bytes()),
                Some(b"message") | Some(b"pmessage")
            ),
            _ => false,
        }
    }

    /// Renders this value as wire bytes. Null uses the RESP2 form (`$-1`)
    /// so the output is understood by both protocol generations.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            RespValue::Simple(text) => put_line(dst, TAG_SIMPLE, text.as_bytes()),
            RespValue::Error(line) => put_line(dst, TAG_ERROR, line.as_bytes()),
            RespValue::Integer(value) => put_line(dst, TAG_INTEGER, value.to_string().as_bytes()),
            RespValue::Double(value) => put_line(dst, TAG_DOUBLE, value.to_string().as_bytes()),
            RespValue::Boolean(value) => {
                put_line(dst, TAG_BOOLEAN, if *value { b"t" } else { b"f" })
            }
            RespValue::Bulk(data) => {
                dst.put_u8(TAG_BULK);
                put_decimal(dst, data.len());
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            RespValue::Null => dst.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                dst.put_u8(TAG_ARRAY);
                put_decimal(dst, items.len());
                dst.put_slice(b"\r\n");
                for item in items {
                    item.encode(dst);
                }
            }
            RespValue::Map(pairs) => {
                dst.put_u8(TAG_MAP);
                put_decimal(dst, pairs.len());
                dst.put_slice(b"\r\n");
                for (key, value) in pairs {
                    key.encode(dst);
                    value.encode(dst);
                }
            }
            RespValue::Push(items) => {
                dst.put_u8(TAG_PUSH);
                put_decimal(dst, items.len());
                dst.put_slice(b"\r\n");
                for item in items {
                    item.encode(dst);
                }
            }
            RespValue::Verbatim { format, text } => {
                dst.put_u8(TAG_VERBATIM);
                put_decimal(dst, format.len() + 1 + text.len());
                dst.put_slice(b"\r\n");
                dst.put_slice(format.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(text.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::BigNumber(digits) => put_line(dst, TAG_BIG_NUMBER, digits.as_bytes()),
        }
    }
}

/// Renders a command (sequence of binary-safe arguments) as a RESP array of
/// bulk strings.
pub fn encode_command(args: &[Bytes], dst: &mut BytesMut) {
    dst.put_u8(TAG_ARRAY);
    put_decimal(dst, args.len());
    dst.put_slice(b"\r\n");
    for arg in args {
        dst.put_u8(TAG_BULK);
        put_decimal(dst, arg.len());
        dst.put_slice(b"\r\n");
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}

fn put_line(dst: &mut BytesMut, tag: u8, line: &[u8]) {
    dst.put_u8(tag);
    dst.put_slice(line);
    dst.put_slice(b"\r\n");
}

fn put_decimal(dst: &mut BytesMut, value: usize) {
    if value < SMALL_DECIMALS.len() {
        dst.put_slice(&SMALL_DECIMALS[value]);
    } else {
        dst.put_slice(value.to_string().as_bytes());
    }
}

/// Decodes one complete frame from the front of `buf`.
///
/// Returns `Ok(Some((value, consumed)))` when a full frame is buffered,
/// `Ok(None)` when more bytes are needed (nothing consumed), or a
/// `RespError` when the stream is malformed.
pub fn decode(buf: &[u8]) -> Result<Option<(RespValue, usize)>, RespError> {
    decode_at(buf, 0)
}

fn decode_at(buf: &[u8], start: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(&tag) = buf.get(start) else {
        return Ok(None);
    };
    let Some((line, mut pos)) = take_line(buf, start + 1) else {
        return Ok(None);
    };

    let value = match tag {
        TAG_SIMPLE => RespValue::Simple(line_str(line)?.to_string()),
        TAG_ERROR => RespValue::Error(line_str(line)?.to_string()),
        TAG_INTEGER => RespValue::Integer(parse_i64(line)?),
        TAG_DOUBLE => RespValue::Double(parse_f64(line)?),
        TAG_BOOLEAN => match line {
            b"t" => RespValue::Boolean(true),
            b"f" => RespValue::Boolean(false),
            _ => return Err(RespError::InvalidBoolean),
        },
        TAG_NULL => {
            if !line.is_empty() {
                return Err(RespError::InvalidNull);
            }
            RespValue::Null
        }
        TAG_BIG_NUMBER => RespValue::BigNumber(line_str(line)?.to_string()),
        TAG_BULK => match parse_len(line)? {
            None => RespValue::Null,
            Some(len) => {
                let Some((payload, next)) = take_payload(buf, pos, len)? else {
                    return Ok(None);
                };
                pos = next;
                RespValue::Bulk(Bytes::copy_from_slice(payload))
            }
        },
        TAG_VERBATIM => match parse_len(line)? {
            None => return Err(RespError::InvalidVerbatim),
            Some(len) => {
                let Some((payload, next)) = take_payload(buf, pos, len)? else {
                    return Ok(None);
                };
                pos = next;
                // Payload is `<3-char format>:<text>`.
                if payload.len() < 4 || payload[3] != b':' {
                    return Err(RespError::InvalidVerbatim);
                }
                let format = std::str::from_utf8(&payload[..3])
                    .map_err(|_| RespError::InvalidUtf8)?
                    .to_string();
                let text = std::str::from_utf8(&payload[4..])
                    .map_err(|_| RespError::InvalidUtf8)?
                    .to_string();
                RespValue::Verbatim { format, text }
            }
        },
        TAG_ARRAY | TAG_SET | TAG_PUSH => match parse_len(line)? {
            None if tag == TAG_ARRAY => RespValue::Null,
            None => return Err(RespError::LengthOutOfRange),
            Some(len) => {
                let Some((items, next)) = decode_elements(buf, pos, len)? else {
                    return Ok(None);
                };
                pos = next;
                if tag == TAG_PUSH {
                    RespValue::Push(items)
                } else {
                    RespValue::Array(items)
                }
            }
        },
        TAG_MAP | TAG_ATTRIBUTE => match parse_len(line)? {
            None => return Err(RespError::LengthOutOfRange),
            Some(len) => {
                let Some((items, next)) = decode_elements(buf, pos, len.saturating_mul(2))? else {
                    return Ok(None);
                };
                pos = next;
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    pairs.push((key, value));
                }
                RespValue::Map(pairs)
            }
        },
        other => return Err(RespError::UnknownTypeTag(other)),
    };

    Ok(Some((value, pos)))
}

fn decode_elements(
    buf: &[u8],
    mut pos: usize,
    count: usize,
) -> Result<Option<(Vec<RespValue>, usize)>, RespError> {
    // Capacity is clamped so a hostile length prefix cannot force a huge
    // allocation before any element bytes arrive.
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        match decode_at(buf, pos)? {
            Some((value, next)) => {
                items.push(value);
                pos = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((items, pos)))
}

/// Finds the `\r\n`-terminated line starting at `pos`. Returns the line
/// without its terminator and the position just past it.
fn take_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let hay = buf.get(pos..)?;
    let at = hay.windows(2).position(|window| window == b"\r\n")?;
    Some((&hay[..at], pos + at + 2))
}

fn take_payload(buf: &[u8], pos: usize, len: usize) -> Result<Option<(&[u8], usize)>, RespError> {
    let end = pos.checked_add(len).ok_or(RespError::LengthOutOfRange)?;
    let Some(payload) = buf.get(pos..end) else {
        return Ok(None);
    };
    match buf.get(end..end + 2) {
        Some(b"\r\n") => Ok(Some((payload, end + 2))),
        Some(_) => Err(RespError::MissingTerminator),
        None => Ok(None),
    }
}

fn line_str(line: &[u8]) -> Result<&str, RespError> {
    std::str::from_utf8(line).map_err(|_| RespError::InvalidUtf8)
}

fn parse_i64(line: &[u8]) -> Result<i64, RespError> {
    line_str(line)
        .map_err(|_| RespError::InvalidInteger)?
        .parse::<i64>()
        .map_err(|_| RespError::InvalidInteger)
}

fn parse_f64(line: &[u8]) -> Result<f64, RespError> {
    line_str(line)
        .map_err(|_| RespError::InvalidDouble)?
        .parse::<f64>()
        .map_err(|_| RespError::InvalidDouble)
}

/// Parses a length prefix. `-1` means the null sentinel; any other negative
/// or non-numeric value is a protocol error, as is anything that does not
/// fit the platform's usize.
fn parse_len(line: &[u8]) -> Result<Option<usize>, RespError> {
    let value = parse_i64(line).map_err(|_| RespError::LengthOutOfRange)?;
    match value {
        -1 => Ok(None),
        v if v < 0 => Err(RespError::LengthOutOfRange),
        v => usize::try_from(v)
            .map(Some)
            .map_err(|_| RespError::LengthOutOfRange),
    }
}
