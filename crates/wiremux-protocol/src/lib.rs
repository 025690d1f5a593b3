// wiremux-protocol: Channel multiplexer wire format and serialization.
//
// Every frame is `u32 BE header_len || header_json || body_bytes`, where
// `header_json` is a JSON array whose first element is the frame-type tag
// and whose last element is the body-type tag.  The length prefix covers
// the header JSON only; the body is the remaining suffix of the frame and
// carries no internal length prefix of its own.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Frame-type and body-type tags
// ---------------------------------------------------------------------------

/// Frozen numeric frame-type tags (first element of the header array).
///
/// 1xx tags are requests (client -> server within one peer pair); 2xx tags
/// are responses (server -> client).  A receiver drops frames with tags it
/// does not know.
pub mod tags {
    pub const PROMISE: u64 = 100;
    pub const PROMISE_CANCEL: u64 = 101;
    pub const EVENT_LISTEN: u64 = 102;
    pub const EVENT_DISPOSE: u64 = 103;

    pub const INITIALIZE: u64 = 200;
    pub const PROMISE_SUCCESS: u64 = 201;
    pub const PROMISE_ERROR: u64 = 202;
    pub const PROMISE_ERROR_OBJ: u64 = 203;
    pub const EVENT_FIRE: u64 = 204;
}

const BODY_NONE: u64 = 0;
const BODY_TEXT: u64 = 1;
const BODY_BYTES: u64 = 2;
const BODY_VALUE: u64 = 3;

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// A frame body, classified at the send site.
///
/// The wire distinguishes four body classes by tag: 0 = no body, 1 = UTF-8
/// text, 2 = opaque bytes, 3 = a JSON-encoded structured value.  Callers
/// pick the variant explicitly; there is no runtime type sniffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    None,
    Text(String),
    Bytes(Vec<u8>),
    Value(serde_json::Value),
}

impl Body {
    pub fn text(s: impl Into<String>) -> Self {
        Body::Text(s.into())
    }

    /// Wrap any serializable value as a structured body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Body::Value(serde_json::to_value(value)?))
    }

    /// Deserialize a structured body into a concrete type.
    ///
    /// `Body::None` deserializes as JSON `null`; text and byte bodies are
    /// rejected.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, FrameError> {
        let value = match self {
            Body::Value(v) => v.clone(),
            Body::None => serde_json::Value::Null,
            Body::Text(_) | Body::Bytes(_) => {
                return Err(FrameError::Body(
                    "expected a structured body".to_owned(),
                ));
            }
        };
        serde_json::from_value(value).map_err(|e| FrameError::Body(e.to_string()))
    }

    /// Borrow the text payload, if this is a text body.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s),
            _ => None,
        }
    }

    fn to_wire(&self) -> Result<(u64, Vec<u8>), serde_json::Error> {
        Ok(match self {
            Body::None => (BODY_NONE, Vec::new()),
            Body::Text(s) => (BODY_TEXT, s.as_bytes().to_vec()),
            Body::Bytes(b) => (BODY_BYTES, b.clone()),
            Body::Value(v) => (BODY_VALUE, serde_json::to_vec(v)?),
        })
    }

    fn from_wire(tag: u64, bytes: &[u8]) -> Result<Self, FrameError> {
        match tag {
            // Tolerate stray bytes on a tag-0 frame; the body is undefined
            // regardless of what the sender appended.
            BODY_NONE => Ok(Body::None),
            BODY_TEXT => String::from_utf8(bytes.to_vec())
                .map(Body::Text)
                .map_err(|e| FrameError::Body(format!("text body is not UTF-8: {e}"))),
            BODY_BYTES => Ok(Body::Bytes(bytes.to_vec())),
            BODY_VALUE => serde_json::from_slice(bytes)
                .map(Body::Value)
                .map_err(|e| FrameError::Body(format!("structured body is not JSON: {e}"))),
            other => Err(FrameError::Body(format!("unknown body tag {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Error name used for unknown channels and unknown commands.
pub const NOT_IMPLEMENTED: &str = "NotImplemented";

/// A structured error carried in a `PromiseError` body.
///
/// `stack` travels as an array of lines.  Some producers send it as a
/// single string instead; decoding accepts both and splits a string on
/// newlines, without any further normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "stack_lines")]
    pub stack: Vec<String>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            message: message.into(),
            name: name.into(),
            stack: Vec::new(),
        }
    }

    /// The rejection synthesized for unknown channels and commands.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        RemoteError::new(NOT_IMPLEMENTED, message)
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}

fn stack_lines<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StackRepr {
        Lines(Vec<String>),
        Text(String),
    }

    Ok(match Option::<StackRepr>::deserialize(de)? {
        None => Vec::new(),
        Some(StackRepr::Lines(lines)) => lines,
        Some(StackRepr::Text(text)) => text.lines().map(str::to_owned).collect(),
    })
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Request frames, sent by the requesting side of a peer pair.
///
/// `id` is allocated monotonically by the requester and is unique only
/// within one direction of one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Call a command on a named channel.
    Promise {
        id: u64,
        channel: String,
        name: String,
        arg: Body,
    },
    /// Cancel a prior `Promise` by id.  Idempotent; unknown ids are no-ops.
    PromiseCancel { id: u64 },
    /// Subscribe to an event on a named channel.
    EventListen {
        id: u64,
        channel: String,
        name: String,
        arg: Body,
    },
    /// End a subscription by id.  Idempotent; unknown ids are no-ops.
    EventDispose { id: u64 },
}

/// Response frames, sent by the answering side of a peer pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Handshake marker.  Must be the first frame the answering side sends;
    /// it unblocks the requester's buffered outbound queue.
    Initialize,
    /// Terminal: the command completed with a value.
    PromiseSuccess { id: u64, data: Body },
    /// Terminal: the command failed with a structured error.
    PromiseError { id: u64, error: RemoteError },
    /// Terminal: the command rejected with an arbitrary value.
    PromiseErrorObj { id: u64, data: Body },
    /// One event delivery for the subscription `id`.
    EventFire { id: u64, data: Body },
}

/// Either half of the protocol; decoding classifies by the frame-type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Errors from frame encoding/decoding.
///
/// Decode failures mean the frame is dropped; the connection survives.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame shorter than its declared header length")]
    Truncated,
    #[error("malformed frame header: {0}")]
    Header(String),
    #[error("malformed frame body: {0}")]
    Body(String),
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Message {
    /// Encode into `u32 BE header_len || header_json || body_bytes`.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        use serde_json::json;

        let (mut header, (body_tag, body)) = match self {
            Message::Request(Request::Promise {
                id,
                channel,
                name,
                arg,
            }) => (
                vec![json!(tags::PROMISE), json!(id), json!(channel), json!(name)],
                arg.to_wire()?,
            ),
            Message::Request(Request::PromiseCancel { id }) => (
                vec![json!(tags::PROMISE_CANCEL), json!(id)],
                Body::None.to_wire()?,
            ),
            Message::Request(Request::EventListen {
                id,
                channel,
                name,
                arg,
            }) => (
                vec![
                    json!(tags::EVENT_LISTEN),
                    json!(id),
                    json!(channel),
                    json!(name),
                ],
                arg.to_wire()?,
            ),
            Message::Request(Request::EventDispose { id }) => (
                vec![json!(tags::EVENT_DISPOSE), json!(id)],
                Body::None.to_wire()?,
            ),
            Message::Response(Response::Initialize) => {
                (vec![json!(tags::INITIALIZE)], Body::None.to_wire()?)
            }
            Message::Response(Response::PromiseSuccess { id, data }) => (
                vec![json!(tags::PROMISE_SUCCESS), json!(id)],
                data.to_wire()?,
            ),
            Message::Response(Response::PromiseError { id, error }) => (
                vec![json!(tags::PROMISE_ERROR), json!(id)],
                (BODY_VALUE, serde_json::to_vec(error)?),
            ),
            Message::Response(Response::PromiseErrorObj { id, data }) => (
                vec![json!(tags::PROMISE_ERROR_OBJ), json!(id)],
                data.to_wire()?,
            ),
            Message::Response(Response::EventFire { id, data }) => {
                (vec![json!(tags::EVENT_FIRE), json!(id)], data.to_wire()?)
            }
        };

        header.push(serde_json::json!(body_tag));
        let header_bytes = serde_json::to_vec(&header)?;

        let mut frame = Vec::with_capacity(4 + header_bytes.len() + body.len());
        frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode one frame.
    ///
    /// Returns `Ok(None)` for frames whose outer type tag is unknown; the
    /// receiver drops those silently.  Structural problems (short frame,
    /// non-array header, undecodable body) are errors.
    pub fn decode(frame: &[u8]) -> Result<Option<Self>, FrameError> {
        if frame.len() < 4 {
            return Err(FrameError::Truncated);
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&frame[..4]);
        let header_len = u32::from_be_bytes(len) as usize;
        if frame.len() < 4 + header_len {
            return Err(FrameError::Truncated);
        }

        let header: Vec<serde_json::Value> = serde_json::from_slice(&frame[4..4 + header_len])
            .map_err(|e| FrameError::Header(e.to_string()))?;
        let body_bytes = &frame[4 + header_len..];

        let frame_tag = header_u64(&header, 0)?;
        let body_tag = header
            .last()
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| FrameError::Header("missing body tag".to_owned()))?;
        let body = Body::from_wire(body_tag, body_bytes)?;

        let message = match frame_tag {
            tags::PROMISE => Message::Request(Request::Promise {
                id: header_u64(&header, 1)?,
                channel: header_str(&header, 2)?,
                name: header_str(&header, 3)?,
                arg: body,
            }),
            tags::PROMISE_CANCEL => Message::Request(Request::PromiseCancel {
                id: header_u64(&header, 1)?,
            }),
            tags::EVENT_LISTEN => Message::Request(Request::EventListen {
                id: header_u64(&header, 1)?,
                channel: header_str(&header, 2)?,
                name: header_str(&header, 3)?,
                arg: body,
            }),
            tags::EVENT_DISPOSE => Message::Request(Request::EventDispose {
                id: header_u64(&header, 1)?,
            }),
            tags::INITIALIZE => Message::Response(Response::Initialize),
            tags::PROMISE_SUCCESS => Message::Response(Response::PromiseSuccess {
                id: header_u64(&header, 1)?,
                data: body,
            }),
            tags::PROMISE_ERROR => {
                let error = match body {
                    Body::Value(v) => serde_json::from_value(v)
                        .map_err(|e| FrameError::Body(format!("structured error: {e}")))?,
                    _ => {
                        return Err(FrameError::Body(
                            "promise-error body must be structured".to_owned(),
                        ));
                    }
                };
                Message::Response(Response::PromiseError {
                    id: header_u64(&header, 1)?,
                    error,
                })
            }
            tags::PROMISE_ERROR_OBJ => Message::Response(Response::PromiseErrorObj {
                id: header_u64(&header, 1)?,
                data: body,
            }),
            tags::EVENT_FIRE => Message::Response(Response::EventFire {
                id: header_u64(&header, 1)?,
                data: body,
            }),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn header_u64(header: &[serde_json::Value], idx: usize) -> Result<u64, FrameError> {
    header
        .get(idx)
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| FrameError::Header(format!("expected integer at index {idx}")))
}

fn header_str(header: &[serde_json::Value], idx: usize) -> Result<String, FrameError> {
    header
        .get(idx)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| FrameError::Header(format!("expected string at index {idx}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
