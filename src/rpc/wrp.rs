//! WRP message model and msgpack wire codec.
//!
//! The device fabric exchanges WRP envelopes serialized as msgpack maps with
//! string keys (`msg_type`, `source`, `dest`, `transaction_uuid`, ...). Only
//! `SimpleRequestResponse` travels the request hot path; `SimpleEvent`
//! deliveries arrive on the webhook endpoint. Unknown fields from peers are
//! tolerated and dropped on decode.

use serde::{Deserialize, Serialize};

/// Content-Type label for binary-framed WRP bodies.
pub const CONTENT_TYPE: &str = "application/msgpack";

/// WRP message type discriminant, encoded as an integer on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Authorization,
    SimpleRequestResponse,
    SimpleEvent,
    ServiceRegistration,
    ServiceAlive,
    #[default]
    Unknown,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::Authorization => 2,
            MessageType::SimpleRequestResponse => 3,
            MessageType::SimpleEvent => 4,
            MessageType::ServiceRegistration => 9,
            MessageType::ServiceAlive => 10,
            MessageType::Unknown => 11,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            2 => Ok(MessageType::Authorization),
            3 => Ok(MessageType::SimpleRequestResponse),
            4 => Ok(MessageType::SimpleEvent),
            9 => Ok(MessageType::ServiceRegistration),
            10 => Ok(MessageType::ServiceAlive),
            11 => Ok(MessageType::Unknown),
            other => Err(format!("unrecognized wrp message type {other}")),
        }
    }
}

/// A WRP envelope. Field names follow the fabric's msgpack convention.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, rename = "dest", skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transaction_uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default, with = "serde_bytes", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

/// Encode one message into its binary framing.
pub fn encode(msg: &Message) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode one message from its binary framing.
pub fn decode(bytes: &[u8]) -> Result<Message, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}
