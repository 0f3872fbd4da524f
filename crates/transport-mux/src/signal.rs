//! Messages of the outer negotiation protocol.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::codec::{self, Body, CodecError, Envelope};

/// Terminates a negotiation run; `reason` is shown to the remote caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    pub reason: String,
}

impl Body for Abort {
    const KIND: &'static str = "abort";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sdp {
    pub data: RTCSessionDescription,
}

impl Body for Sdp {
    const KIND: &'static str = "sdp";
}

impl PartialEq for Sdp {
    fn eq(&self, other: &Self) -> bool {
        self.data.sdp_type == other.data.sdp_type && self.data.sdp == other.data.sdp
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub data: RTCIceCandidateInit,
}

impl Body for Candidate {
    const KIND: &'static str = "candidate";
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.data.candidate == other.data.candidate
            && self.data.sdp_mid == other.data.sdp_mid
            && self.data.sdp_mline_index == other.data.sdp_mline_index
            && self.data.username_fragment == other.data.username_fragment
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    Abort(Abort),
    Sdp(Sdp),
    Candidate(Candidate),
}

impl SignalMessage {
    pub fn abort(reason: impl Into<String>) -> Self {
        SignalMessage::Abort(Abort {
            reason: reason.into(),
        })
    }
}

impl Envelope for SignalMessage {
    fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Abort(_) => Abort::KIND,
            SignalMessage::Sdp(_) => Sdp::KIND,
            SignalMessage::Candidate(_) => Candidate::KIND,
        }
    }

    fn body_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            SignalMessage::Abort(body) => serde_json::to_value(body),
            SignalMessage::Sdp(body) => serde_json::to_value(body),
            SignalMessage::Candidate(body) => serde_json::to_value(body),
        }
    }

    fn from_kind(kind: &str, frame: Value) -> Result<Self, CodecError> {
        match kind {
            Abort::KIND => codec::decode_body(frame).map(SignalMessage::Abort),
            Sdp::KIND => codec::decode_body(frame).map(SignalMessage::Sdp),
            Candidate::KIND => codec::decode_body(frame).map(SignalMessage::Candidate),
            other => Err(CodecError::UnknownKind(other.to_string())),
        }
    }
}

impl Serialize for SignalMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        codec::serialize_flat(self, serializer)
    }
}

impl<'de> Deserialize<'de> for SignalMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        codec::deserialize_flat(deserializer)
    }
}

impl From<Abort> for SignalMessage {
    fn from(body: Abort) -> Self {
        SignalMessage::Abort(body)
    }
}

impl From<Sdp> for SignalMessage {
    fn from(body: Sdp) -> Self {
        SignalMessage::Sdp(body)
    }
}

impl From<Candidate> for SignalMessage {
    fn from(body: Candidate) -> Self {
        SignalMessage::Candidate(body)
    }
}
