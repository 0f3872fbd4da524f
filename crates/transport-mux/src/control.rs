//! Messages of the multiplexing protocol carried on a peer's control channel.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::codec::{self, Body, CodecError, Envelope};
use crate::signal::SignalMessage;

/// Asks the remote to shut the connection down; answered with [`CloseAck`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closing {}

impl Body for Closing {
    const KIND: &'static str = "closing";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseAck {}

impl Body for CloseAck {
    const KIND: &'static str = "close-ack";
}

/// Requests a virtual signal channel at `port` for a nested connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub port: u32,
    pub label: String,
}

impl Body for Connect {
    const KIND: &'static str = "connect";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub port: u32,
}

impl Body for Accept {
    const KIND: &'static str = "accept";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub port: u32,
}

impl Body for Reject {
    const KIND: &'static str = "reject";
}

/// A signal message tunnelled to the virtual channel at `port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub port: u32,
    pub message: SignalMessage,
}

impl Body for Signal {
    const KIND: &'static str = "signal";
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Closing(Closing),
    CloseAck(CloseAck),
    Connect(Connect),
    Accept(Accept),
    Reject(Reject),
    Signal(Signal),
}

impl Envelope for ControlMessage {
    fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Closing(_) => Closing::KIND,
            ControlMessage::CloseAck(_) => CloseAck::KIND,
            ControlMessage::Connect(_) => Connect::KIND,
            ControlMessage::Accept(_) => Accept::KIND,
            ControlMessage::Reject(_) => Reject::KIND,
            ControlMessage::Signal(_) => Signal::KIND,
        }
    }

    fn body_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            ControlMessage::Closing(body) => serde_json::to_value(body),
            ControlMessage::CloseAck(body) => serde_json::to_value(body),
            ControlMessage::Connect(body) => serde_json::to_value(body),
            ControlMessage::Accept(body) => serde_json::to_value(body),
            ControlMessage::Reject(body) => serde_json::to_value(body),
            ControlMessage::Signal(body) => serde_json::to_value(body),
        }
    }

    fn from_kind(kind: &str, frame: Value) -> Result<Self, CodecError> {
        match kind {
            Closing::KIND => codec::decode_body(frame).map(ControlMessage::Closing),
            CloseAck::KIND => codec::decode_body(frame).map(ControlMessage::CloseAck),
            Connect::KIND => codec::decode_body(frame).map(ControlMessage::Connect),
            Accept::KIND => codec::decode_body(frame).map(ControlMessage::Accept),
            Reject::KIND => codec::decode_body(frame).map(ControlMessage::Reject),
            Signal::KIND => codec::decode_body(frame).map(ControlMessage::Signal),
            other => Err(CodecError::UnknownKind(other.to_string())),
        }
    }
}

impl Serialize for ControlMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        codec::serialize_flat(self, serializer)
    }
}

impl<'de> Deserialize<'de> for ControlMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        codec::deserialize_flat(deserializer)
    }
}
