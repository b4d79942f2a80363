//! Message envelope: the integer `type` discriminator and its JSON encoding.
//!
//! On the wire every message is a flat JSON object carrying an integer `type`
//! next to the message's own fields:
//!
//! ```text
//! {"type": 7, "player": "steve", "server": 2}
//! ```
//!
//! The codec knows nothing about individual message shapes. Decoding yields an
//! [`Envelope`] with the type pulled out and the remaining fields left as an
//! opaque [`Body`]; whoever handles that type decodes the body further with
//! [`Envelope::body_as`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::NetworkError;

/// Integer tag identifying a message shape.
pub type MessageType = i32;

/// Envelope body: the message fields with `type` removed.
pub type Body = serde_json::Map<String, Value>;

/// Type reserved for the client → server registration message.
pub const CLIENT_REGISTRATION: MessageType = 0;

const TYPE_FIELD: &str = "type";

/// An outbound message with a statically known type.
///
/// Structs usually return a constant. Enums return the type of the active
/// variant, which lets one Rust type cover a family of related messages:
///
/// ```rust
/// use arrival_network::message::{Message, MessageType};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// #[serde(untagged)]
/// enum Lobby {
///     Join { player: String },
///     Leave { player: String },
/// }
///
/// impl Message for Lobby {
///     fn message_type(&self) -> MessageType {
///         match self {
///             Lobby::Join { .. } => 3,
///             Lobby::Leave { .. } => 4,
///         }
///     }
/// }
/// ```
pub trait Message: Serialize {
    /// The wire `type` of this message.
    fn message_type(&self) -> MessageType;
}

/// Serialize a message into wire text.
///
/// The message must serialize to a JSON object (or to `null`, for unit-like
/// messages that carry no fields). Anything else is rejected.
pub fn encode<M: Message>(message: &M) -> Result<String, NetworkError> {
    let message_type = message.message_type();
    let mut body = match serde_json::to_value(message)? {
        Value::Object(fields) => fields,
        Value::Null => Body::new(),
        other => {
            return Err(NetworkError::InvalidMessage(format!(
                "message of type {message_type} must serialize to an object, got {}",
                json_kind(&other)
            )));
        }
    };
    body.insert(TYPE_FIELD.to_string(), Value::from(message_type));
    Ok(serde_json::to_string(&body)?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A decoded inbound message: its type and the untyped remaining fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The integer message type.
    pub message_type: MessageType,
    /// All other fields of the message.
    pub body: Body,
}

impl Envelope {
    /// Build an envelope from parts.
    pub fn new(message_type: MessageType, body: Body) -> Self {
        Self { message_type, body }
    }

    /// Decode wire text into an envelope.
    pub fn decode(text: &str) -> Result<Self, NetworkError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| NetworkError::MalformedEnvelope(format!("Message is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Split an already-parsed JSON value into type and body.
    pub fn from_value(value: Value) -> Result<Self, NetworkError> {
        let Value::Object(mut body) = value else {
            return Err(NetworkError::MalformedEnvelope(
                "Message is not a JSON object".to_string(),
            ));
        };

        let type_value = body.remove(TYPE_FIELD).ok_or_else(|| {
            NetworkError::MalformedEnvelope("Message type is not present".to_string())
        })?;

        let message_type = type_value
            .as_i64()
            .and_then(|n| MessageType::try_from(n).ok())
            .ok_or_else(|| {
                NetworkError::MalformedEnvelope("Message type is not an integer".to_string())
            })?;

        Ok(Self { message_type, body })
    }

    /// Decode the body into the shape expected for this message type.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(s)
    }
}

/// An envelope can be sent back out unchanged.
impl Message for Envelope {
    fn message_type(&self) -> MessageType {
        self.message_type
    }
}

/// Registration sent by a client right after connecting, naming itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    /// The identity the client wants to be addressed by.
    pub client_name: String,
}

impl ClientRegistration {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }
}

impl Message for ClientRegistration {
    fn message_type(&self) -> MessageType {
        CLIENT_REGISTRATION
    }
}

/// A message addressed to (or coming from) one of several game servers that
/// share a single connection. Adds a `server` field beside the wrapped
/// message's own fields; the wire type is the wrapped message's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerScoped<M> {
    /// Which server behind the connection this message concerns.
    pub server: i32,
    #[serde(flatten)]
    pub message: M,
}

impl<M> ServerScoped<M> {
    pub fn new(server: i32, message: M) -> Self {
        Self { server, message }
    }
}

impl<M: Message> Message for ServerScoped<M> {
    fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Chat {
        text: String,
    }

    impl Message for Chat {
        fn message_type(&self) -> MessageType {
            7
        }
    }

    #[derive(Serialize)]
    struct Ping;

    impl Message for Ping {
        fn message_type(&self) -> MessageType {
            12
        }
    }

    #[derive(Serialize)]
    #[serde(untagged)]
    enum Lobby {
        Join { player: String },
        Leave { player: String },
    }

    impl Message for Lobby {
        fn message_type(&self) -> MessageType {
            match self {
                Lobby::Join { .. } => 3,
                Lobby::Leave { .. } => 4,
            }
        }
    }

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_decode_strips_type() {
        let env = Envelope::decode(r#"{"type": 7, "x": 1}"#).unwrap();
        assert_eq!(env.message_type, 7);
        assert_eq!(Value::Object(env.body), json!({"x": 1}));
    }

    #[test]
    fn test_decode_missing_type() {
        let err = Envelope::decode(r#"{"x": 1}"#).unwrap_err();
        assert!(matches!(err, NetworkError::MalformedEnvelope(ref m) if m.contains("not present")));
    }

    #[test]
    fn test_decode_non_integer_type() {
        for text in [r#"{"type": "a"}"#, r#"{"type": 1.5}"#, r#"{"type": null}"#, r#"{"type": 4294967296}"#] {
            let err = Envelope::decode(text).unwrap_err();
            assert!(
                matches!(err, NetworkError::MalformedEnvelope(ref m) if m.contains("not an integer")),
                "{text} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_decode_negative_type() {
        let env = Envelope::decode(r#"{"type": -3}"#).unwrap();
        assert_eq!(env.message_type, -3);
        assert!(env.body.is_empty());
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        for text in ["[1, 2]", "7", "\"hello\"", "not json at all"] {
            assert!(matches!(
                Envelope::decode(text),
                Err(NetworkError::MalformedEnvelope(_))
            ));
        }
    }

    #[test]
    fn test_encode_adds_type() {
        let text = encode(&Chat { text: "hi".into() }).unwrap();
        assert_eq!(parse(&text), json!({"type": 7, "text": "hi"}));
    }

    #[test]
    fn test_encode_unit_message() {
        let text = encode(&Ping).unwrap();
        assert_eq!(parse(&text), json!({"type": 12}));
    }

    #[test]
    fn test_encode_enum_uses_variant_type() {
        let join = encode(&Lobby::Join { player: "alex".into() }).unwrap();
        let leave = encode(&Lobby::Leave { player: "alex".into() }).unwrap();
        assert_eq!(parse(&join), json!({"type": 3, "player": "alex"}));
        assert_eq!(parse(&leave), json!({"type": 4, "player": "alex"}));
    }

    #[test]
    fn test_encode_rejects_scalar_message() {
        #[derive(Serialize)]
        struct Score(u32);
        impl Message for Score {
            fn message_type(&self) -> MessageType {
                9
            }
        }

        let err = encode(&Score(10)).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidMessage(_)));
    }

    #[test]
    fn test_body_as() {
        let env = Envelope::decode(r#"{"type": 7, "text": "hello"}"#).unwrap();
        let chat: Chat = env.body_as().unwrap();
        assert_eq!(chat.text, "hello");

        let wrong = Envelope::decode(r#"{"type": 7, "words": 3}"#).unwrap();
        assert!(matches!(
            wrong.body_as::<Chat>(),
            Err(NetworkError::Serialization(_))
        ));
    }

    #[test]
    fn test_registration_wire_format() {
        let text = encode(&ClientRegistration::new("survival")).unwrap();
        assert_eq!(parse(&text), json!({"type": 0, "clientName": "survival"}));

        let env = Envelope::decode(&text).unwrap();
        assert_eq!(env.message_type, CLIENT_REGISTRATION);
        let registration: ClientRegistration = env.body_as().unwrap();
        assert_eq!(registration.client_name, "survival");
    }

    #[test]
    fn test_server_scoped_outbound() {
        let msg = ServerScoped::new(2, Chat { text: "gg".into() });
        assert_eq!(msg.message_type(), 7);
        let text = encode(&msg).unwrap();
        assert_eq!(parse(&text), json!({"type": 7, "server": 2, "text": "gg"}));
    }

    #[test]
    fn test_server_scoped_inbound() {
        let env = Envelope::decode(r#"{"type": 7, "server": 5, "text": "hey"}"#).unwrap();
        let scoped: ServerScoped<Chat> = env.body_as().unwrap();
        assert_eq!(scoped.server, 5);
        assert_eq!(scoped.message, Chat { text: "hey".into() });
    }

    #[test]
    fn test_envelope_forwarding() {
        let env = Envelope::decode(r#"{"type": 21, "a": [1, 2]}"#).unwrap();
        let text = encode(&env).unwrap();
        assert_eq!(parse(&text), json!({"type": 21, "a": [1, 2]}));
    }
}
