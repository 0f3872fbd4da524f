//! Flat tagged-union framing shared by the signal and control message families.
//!
//! Every frame is a single JSON object whose first field is the string
//! discriminator `kind`, followed by the body's own fields:
//!
//! ```text
//! {"kind":"connect","label":"svc","port":42}
//! {"kind":"closing"}
//! ```
//!
//! Decoding reads `kind` first and picks the body type from a closed table
//! owned by each family, so readers can route a frame without knowing its
//! body type up front.

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

const KIND_FIELD: &str = "kind";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message syntax error: {0}")]
    Syntax(String),
    #[error("unknown message kind: {0:?}")]
    UnknownKind(String),
    #[error("malformed {kind} body: {reason}")]
    MalformedBody { kind: &'static str, reason: String },
    #[error("message body is empty")]
    EmptyBody,
}

/// A concrete message body with its wire discriminator.
pub trait Body: Serialize + DeserializeOwned {
    const KIND: &'static str;
}

/// A closed family of message bodies sharing one envelope format.
pub trait Envelope: Sized {
    /// Wire discriminator of the wrapped body.
    fn kind(&self) -> &'static str;

    /// Serializes the wrapped body on its own, without the discriminator.
    fn body_value(&self) -> Result<Value, serde_json::Error>;

    /// Builds the family member registered for `kind` from the full frame object.
    fn from_kind(kind: &str, frame: Value) -> Result<Self, CodecError>;

    fn encode(&self) -> Result<String, CodecError> {
        let fields = body_fields(self)?;
        serde_json::to_string(&Flat {
            kind: self.kind(),
            fields: &fields,
        })
        .map_err(|err| CodecError::Syntax(err.to_string()))
    }

    fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let value: Value =
            serde_json::from_slice(frame).map_err(|err| CodecError::Syntax(err.to_string()))?;
        from_value(value)
    }
}

/// Decodes an already-parsed frame object.
pub fn from_value<E: Envelope>(frame: Value) -> Result<E, CodecError> {
    let kind = match frame.get(KIND_FIELD) {
        Some(Value::String(kind)) => kind.clone(),
        _ => String::new(),
    };
    E::from_kind(&kind, frame)
}

/// Decodes `frame` into the body registered under `B::KIND`.
pub fn decode_body<B: Body>(frame: Value) -> Result<B, CodecError> {
    serde_json::from_value(frame).map_err(|err| CodecError::MalformedBody {
        kind: B::KIND,
        reason: err.to_string(),
    })
}

/// `Serialize` implementation for envelope types, used when an envelope is
/// nested inside another message.
pub fn serialize_flat<E, S>(envelope: &E, serializer: S) -> Result<S::Ok, S::Error>
where
    E: Envelope,
    S: Serializer,
{
    let fields = body_fields(envelope).map_err(serde::ser::Error::custom)?;
    Flat {
        kind: envelope.kind(),
        fields: &fields,
    }
    .serialize(serializer)
}

/// `Deserialize` implementation for envelope types.
pub fn deserialize_flat<'de, E, D>(deserializer: D) -> Result<E, D::Error>
where
    E: Envelope,
    D: serde::Deserializer<'de>,
{
    let value = <Value as serde::Deserialize>::deserialize(deserializer)?;
    from_value(value).map_err(serde::de::Error::custom)
}

fn body_fields<E: Envelope>(envelope: &E) -> Result<Map<String, Value>, CodecError> {
    match envelope.body_value() {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(CodecError::EmptyBody),
        Err(err) => Err(CodecError::MalformedBody {
            kind: envelope.kind(),
            reason: err.to_string(),
        }),
    }
}

struct Flat<'a> {
    kind: &'static str,
    fields: &'a Map<String, Value>,
}

impl Serialize for Flat<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry(KIND_FIELD, self.kind)?;
        for (name, value) in self.fields {
            if name != KIND_FIELD {
                map.serialize_entry(name, value)?;
            }
        }
        map.end()
    }
}
