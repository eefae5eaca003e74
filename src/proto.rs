//! The subset of Tarantool's IPROTO binary protocol spoken by the adapter and
//! by the in-memory [`TupleServer`](crate::TupleServer).
//!
//! Every packet is a MessagePack unsigned length prefix followed by a header
//! map and a body map. A connection opens with a fixed size text greeting sent
//! by the server.

use rmp::Marker;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

/// Size of the greeting the server sends on connect.
pub const GREETING_SIZE: usize = 128;
const GREETING_LINE_SIZE: usize = 64;

/// Frames larger than this are rejected before allocating a buffer for them.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// Response codes with this bit set carry an error number in the low bits.
pub const ERROR_FLAG: u64 = 0x8000;

/// Header and body map keys.
pub mod key {
    pub const REQUEST_TYPE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const SCHEMA_VERSION: u64 = 0x05;

    pub const SPACE_ID: u64 = 0x10;
    pub const INDEX_ID: u64 = 0x11;
    pub const LIMIT: u64 = 0x12;
    pub const OFFSET: u64 = 0x13;
    pub const ITERATOR: u64 = 0x14;
    pub const KEY: u64 = 0x20;
    pub const TUPLE: u64 = 0x21;
    pub const DATA: u64 = 0x30;
    pub const ERROR: u64 = 0x31;
}

/// Error numbers used by the store, as reported in the low bits of a response code.
pub mod errcode {
    pub const ILLEGAL_PARAMS: u32 = 1;
    pub const TUPLE_FOUND: u32 = 3;
    pub const FIELD_TYPE: u32 = 23;
    pub const NO_SUCH_INDEX: u32 = 35;
    pub const NO_SUCH_SPACE: u32 = 36;
    pub const UNKNOWN_REQUEST_TYPE: u32 = 48;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Select = 1,
    Insert = 2,
    Replace = 3,
    Delete = 5,
    Ping = 0x40,
}

impl TryFrom<u64> for RequestType {
    type Error = u64;

    fn try_from(code: u64) -> std::result::Result<Self, u64> {
        match code {
            1 => Ok(RequestType::Select),
            2 => Ok(RequestType::Insert),
            3 => Ok(RequestType::Replace),
            5 => Ok(RequestType::Delete),
            0x40 => Ok(RequestType::Ping),
            other => Err(other),
        }
    }
}

/// Comparison used by a select to position itself in an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IteratorType {
    #[default]
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
}

impl TryFrom<u64> for IteratorType {
    type Error = u64;

    fn try_from(code: u64) -> std::result::Result<Self, u64> {
        match code {
            0 => Ok(IteratorType::Eq),
            1 => Ok(IteratorType::Req),
            2 => Ok(IteratorType::All),
            3 => Ok(IteratorType::Lt),
            4 => Ok(IteratorType::Le),
            5 => Ok(IteratorType::Ge),
            6 => Ok(IteratorType::Gt),
            other => Err(other),
        }
    }
}

/// The text greeting a server sends before any request is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub version: String,
    pub salt: String,
}

impl Greeting {
    pub fn parse(buf: &[u8]) -> Result<Greeting> {
        if buf.len() < GREETING_SIZE {
            return Err(Error::Handshake(format!(
                "expected {GREETING_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let line = |range: std::ops::Range<usize>| {
            std::str::from_utf8(&buf[range])
                .map(|s| s.trim_end().to_string())
                .map_err(|e| Error::Handshake(e.to_string()))
        };
        let banner = line(0..GREETING_LINE_SIZE)?;
        let salt = line(GREETING_LINE_SIZE..GREETING_SIZE)?;

        let mut words = banner.split_whitespace();
        if words.next() != Some("Tarantool") {
            return Err(Error::Handshake(format!("unexpected banner '{banner}'")));
        }
        let version = words
            .next()
            .ok_or_else(|| Error::Handshake(format!("no version in banner '{banner}'")))?
            .to_string();
        Ok(Greeting { version, salt })
    }

    /// Render the greeting as the two space padded lines a client expects.
    pub fn encode(&self, instance: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(GREETING_SIZE);
        for text in [
            format!("Tarantool {} (Binary) {}", self.version, instance),
            self.salt.clone(),
        ] {
            let mut line: Vec<u8> = text.into_bytes();
            line.truncate(GREETING_LINE_SIZE - 1);
            line.resize(GREETING_LINE_SIZE - 1, b' ');
            line.push(b'\n');
            out.extend_from_slice(&line);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Select {
        space: u32,
        index: u32,
        key: Vec<Value>,
        iterator: IteratorType,
        limit: u32,
        offset: u32,
    },
    Insert {
        space: u32,
        tuple: Vec<Value>,
    },
    Replace {
        space: u32,
        tuple: Vec<Value>,
    },
    Delete {
        space: u32,
        index: u32,
        key: Vec<Value>,
    },
    Ping,
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::Select { .. } => RequestType::Select,
            Request::Insert { .. } => RequestType::Insert,
            Request::Replace { .. } => RequestType::Replace,
            Request::Delete { .. } => RequestType::Delete,
            Request::Ping => RequestType::Ping,
        }
    }

    /// Encode the request into a complete length prefixed frame.
    pub fn encode(&self, sync: u64) -> Result<Vec<u8>> {
        let header = Value::Map(vec![
            (key::REQUEST_TYPE.into(), (self.request_type() as u64).into()),
            (key::SYNC.into(), sync.into()),
        ]);
        let body: Vec<(Value, Value)> = match self {
            Request::Select {
                space,
                index,
                key: k,
                iterator,
                limit,
                offset,
            } => vec![
                (key::SPACE_ID.into(), (*space).into()),
                (key::INDEX_ID.into(), (*index).into()),
                (key::LIMIT.into(), (*limit).into()),
                (key::OFFSET.into(), (*offset).into()),
                (key::ITERATOR.into(), (*iterator as u64).into()),
                (key::KEY.into(), Value::Array(k.clone())),
            ],
            Request::Insert { space, tuple } | Request::Replace { space, tuple } => vec![
                (key::SPACE_ID.into(), (*space).into()),
                (key::TUPLE.into(), Value::Array(tuple.clone())),
            ],
            Request::Delete {
                space,
                index,
                key: k,
            } => vec![
                (key::SPACE_ID.into(), (*space).into()),
                (key::INDEX_ID.into(), (*index).into()),
                (key::KEY.into(), Value::Array(k.clone())),
            ],
            Request::Ping => vec![],
        };
        encode_frame(&header, &Value::Map(body))
    }

    /// Rebuild a request from a decoded frame. Used on the serving side.
    pub fn from_frame(frame: &Frame) -> Result<Request> {
        let request_type = RequestType::try_from(frame.code).map_err(|code| Error::Store {
            code: errcode::UNKNOWN_REQUEST_TYPE,
            message: format!("Unknown request type {code}"),
        })?;
        let space = || frame.body_u32(key::SPACE_ID);
        let index = frame.body_u32(key::INDEX_ID).unwrap_or(0);
        let array = |k: u64| -> Result<Vec<Value>> {
            match frame.body(k) {
                Some(Value::Array(values)) => Ok(values.clone()),
                Some(other) => Err(illegal(format!("expected array for key {k:#x}, got {other}"))),
                None => Ok(Vec::new()),
            }
        };

        Ok(match request_type {
            RequestType::Select => Request::Select {
                space: space()?,
                index,
                key: array(key::KEY)?,
                iterator: match frame.body(key::ITERATOR).and_then(Value::as_u64) {
                    Some(code) => IteratorType::try_from(code)
                        .map_err(|code| illegal(format!("unknown iterator type {code}")))?,
                    None => IteratorType::Eq,
                },
                limit: frame.body_u32(key::LIMIT).unwrap_or(u32::MAX),
                offset: frame.body_u32(key::OFFSET).unwrap_or(0),
            },
            RequestType::Insert => Request::Insert {
                space: space()?,
                tuple: array(key::TUPLE)?,
            },
            RequestType::Replace => Request::Replace {
                space: space()?,
                tuple: array(key::TUPLE)?,
            },
            RequestType::Delete => Request::Delete {
                space: space()?,
                index,
                key: array(key::KEY)?,
            },
            RequestType::Ping => Request::Ping,
        })
    }
}

fn illegal(message: String) -> Error {
    Error::Store {
        code: errcode::ILLEGAL_PARAMS,
        message,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Tuples returned by the request, possibly none.
    Data(Vec<Value>),
    Error { code: u32, message: String },
}

impl Response {
    pub fn encode(&self, sync: u64) -> Result<Vec<u8>> {
        let (code, body): (u64, Vec<(Value, Value)>) = match self {
            Response::Data(tuples) => (0, vec![(key::DATA.into(), Value::Array(tuples.clone()))]),
            Response::Error { code, message } => (
                ERROR_FLAG | u64::from(*code),
                vec![(key::ERROR.into(), message.as_str().into())],
            ),
        };
        let header = Value::Map(vec![
            (key::REQUEST_TYPE.into(), code.into()),
            (key::SYNC.into(), sync.into()),
            (key::SCHEMA_VERSION.into(), 1u64.into()),
        ]);
        encode_frame(&header, &Value::Map(body))
    }

    pub fn from_frame(frame: Frame) -> Result<Response> {
        if frame.code == 0 {
            return match frame.body(key::DATA) {
                Some(Value::Array(tuples)) => Ok(Response::Data(tuples.clone())),
                Some(other) => Err(Error::MalformedResponse(format!(
                    "expected array of tuples, got {other}"
                ))),
                None => Ok(Response::Data(Vec::new())),
            };
        }
        if frame.code & ERROR_FLAG == 0 {
            return Err(Error::MalformedResponse(format!(
                "unexpected response code {:#x}",
                frame.code
            )));
        }
        let message = frame
            .body(key::ERROR)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Response::Error {
            code: (frame.code & !ERROR_FLAG) as u32,
            message,
        })
    }

    /// Turn an error response into [`Error::Store`].
    pub fn into_result(self) -> Result<Vec<Value>> {
        match self {
            Response::Data(tuples) => Ok(tuples),
            Response::Error { code, message } => Err(Error::Store { code, message }),
        }
    }
}

/// A decoded packet: the request type or response code, its sync, and the body map.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub code: u64,
    pub sync: u64,
    pub body: Vec<(Value, Value)>,
}

impl Frame {
    pub fn decode(mut buf: &[u8]) -> Result<Frame> {
        let header = rmpv::decode::read_value(&mut buf)?;
        let header = match header {
            Value::Map(entries) => entries,
            other => return Err(Error::MalformedFrame(format!("header is not a map: {other}"))),
        };
        let code = lookup(&header, key::REQUEST_TYPE)
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::MalformedFrame("header has no code".to_string()))?;
        let sync = lookup(&header, key::SYNC)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let body = if buf.is_empty() {
            Vec::new()
        } else {
            match rmpv::decode::read_value(&mut buf)? {
                Value::Map(entries) => entries,
                other => return Err(Error::MalformedFrame(format!("body is not a map: {other}"))),
            }
        };
        Ok(Frame { code, sync, body })
    }

    pub fn body(&self, k: u64) -> Option<&Value> {
        lookup(&self.body, k)
    }

    fn body_u32(&self, k: u64) -> Result<u32> {
        self.body(k)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| illegal(format!("missing or invalid unsigned value for key {k:#x}")))
    }
}

fn lookup(map: &[(Value, Value)], k: u64) -> Option<&Value> {
    map.iter()
        .find(|(candidate, _)| candidate.as_u64() == Some(k))
        .map(|(_, value)| value)
}

fn encode_frame(header: &Value, body: &Value) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    rmpv::encode::write_value(&mut payload, header).map_err(|e| Error::Encode(e.to_string()))?;
    rmpv::encode::write_value(&mut payload, body).map_err(|e| Error::Encode(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Encode(format!("frame of {} bytes is too large", payload.len())))?;

    let mut frame = Vec::with_capacity(payload.len() + 5);
    rmp::encode::write_u32(&mut frame, len).map_err(|e| Error::Encode(e.to_string()))?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Locate the payload of the frame at the start of `buf`, as the offsets of its
/// first and one past its last byte. Returns [`None`] while the length prefix
/// itself is incomplete; the payload may still extend past the end of `buf`.
pub fn frame_bounds(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };
    let width = match Marker::from_u8(marker) {
        Marker::FixPos(_) => 1,
        Marker::U8 => 2,
        Marker::U16 => 3,
        Marker::U32 => 5,
        Marker::U64 => 9,
        other => {
            return Err(Error::MalformedFrame(format!(
                "length prefix has marker {other:?}"
            )))
        }
    };
    if buf.len() < width {
        return Ok(None);
    }
    let len = match width {
        1 => u64::from(marker),
        _ => buf[1..width]
            .iter()
            .fold(0u64, |len, byte| len << 8 | u64::from(*byte)),
    };
    if len > MAX_FRAME_SIZE {
        return Err(Error::MalformedFrame(format!("frame of {len} bytes is too large")));
    }
    Ok(Some((width, width + len as usize)))
}

/// Read one length prefixed frame. Returns [`None`] when the peer closed the
/// stream cleanly before the next frame started.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let marker = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = match Marker::from_u8(marker) {
        Marker::FixPos(n) => u64::from(n),
        Marker::U8 => u64::from(reader.read_u8().await?),
        Marker::U16 => u64::from(reader.read_u16().await?),
        Marker::U32 => u64::from(reader.read_u32().await?),
        Marker::U64 => reader.read_u64().await?,
        other => {
            return Err(Error::MalformedFrame(format!(
                "length prefix has marker {other:?}"
            )))
        }
    };
    if len > MAX_FRAME_SIZE {
        return Err(Error::MalformedFrame(format!("frame of {len} bytes is too large")));
    }
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
