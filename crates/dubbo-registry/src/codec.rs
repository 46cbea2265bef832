//! Packet framing
//!
//! Every packet travels as one WebSocket text frame holding a JSON object.
//! Requests and responses are correlated purely by `id`; a heartbeat is an
//! event packet without data.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tungstenite::Message;

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Request handled
    Ok,
    /// The request was malformed or unsupported
    ClientError,
    /// The peer failed while handling the request
    ServerError,
}

/// A framed request or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    /// Request originated by either side
    Request {
        /// Correlation id
        id: u64,
        /// Event requests (heartbeats) carry no business payload
        #[serde(default)]
        event: bool,
        /// Whether the sender expects a response
        #[serde(default = "default_two_way")]
        two_way: bool,
        /// Request payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Answer to a request with the same id
    Response {
        /// Correlation id
        id: u64,
        /// Outcome
        status: Status,
        /// Set on heartbeat answers
        #[serde(default)]
        event: bool,
        /// Response payload
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        /// Failure description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_msg: Option<String>,
    },
}

fn default_two_way() -> bool {
    true
}

impl Packet {
    /// Two-way request carrying `data`
    pub fn request(id: u64, data: Value) -> Self {
        Self::Request {
            id,
            event: false,
            two_way: true,
            data: Some(data),
        }
    }

    /// One-way request carrying `data`, used for server pushes
    pub fn push(id: u64, data: Value) -> Self {
        Self::Request {
            id,
            event: false,
            two_way: false,
            data: Some(data),
        }
    }

    /// Heartbeat request
    pub fn heartbeat(id: u64) -> Self {
        Self::Request {
            id,
            event: true,
            two_way: true,
            data: None,
        }
    }

    /// Successful response
    pub fn ok(id: u64, data: Value) -> Self {
        Self::Response {
            id,
            status: Status::Ok,
            event: false,
            data: Some(data),
            error_msg: None,
        }
    }

    /// Failed response
    pub fn failure(id: u64, status: Status, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            status,
            event: false,
            data: None,
            error_msg: Some(message.into()),
        }
    }

    /// Answer to a heartbeat request
    pub fn heartbeat_response(id: u64) -> Self {
        Self::Response {
            id,
            status: Status::Ok,
            event: true,
            data: None,
            error_msg: None,
        }
    }

    /// Correlation id
    pub fn id(&self) -> u64 {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => *id,
        }
    }

    /// Whether this is a response packet
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    /// Whether this is an event packet
    pub fn is_event(&self) -> bool {
        match self {
            Self::Request { event, .. } | Self::Response { event, .. } => *event,
        }
    }

    /// Event packet with no payload
    pub fn is_heartbeat(&self) -> bool {
        match self {
            Self::Request { event, data, .. } | Self::Response { event, data, .. } => {
                *event && data.is_none()
            }
        }
    }
}

/// Encode a packet into a WebSocket frame
pub fn encode(packet: &Packet) -> Result<Message> {
    let json = serde_json::to_string(packet)?;
    Ok(Message::Text(json.into()))
}

/// Decode a WebSocket frame
///
/// Control frames yield `Ok(None)`; anything that is not a valid packet is a
/// decode error attributed to `address`.
pub fn decode(message: &Message, address: &str) -> Result<Option<Packet>> {
    let bytes: &[u8] = match message {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(data) => data,
        _ => return Ok(None),
    };
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|e| Error::Decode {
            address: address.to_string(),
            reason: e.to_string(),
        })
}
