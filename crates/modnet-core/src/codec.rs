//! Text encoding of envelopes.
//!
//! An envelope is one JSON object. The `type` field selects the body shape;
//! the decoder for each `type` comes from a [`MessageRegistry`] that is
//! built once at startup and never changes afterwards.

use crate::message::{Body, Envelope, ProtocolMessage, kinds};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

const TYPE_FIELD: &str = "type";
const ID_FIELD: &str = "uuid";
const REPLY_FIELD: &str = "source_uuid";
const APPLICATION_FIELD: &str = "application_id";

/// Envelope keys an application payload may not use.
pub const RESERVED_FIELDS: [&str; 4] = [TYPE_FIELD, ID_FIELD, REPLY_FIELD, APPLICATION_FIELD];

type Decoder = Arc<dyn Fn(Map<String, Value>) -> Result<Body, serde_json::Error> + Send + Sync>;

/// Error encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no type tag")]
    MissingType,
    #[error("message has no id")]
    MissingId,
    #[error("unregistered message type: {0}")]
    UnknownKind(String),
    #[error("payload uses reserved field `{0}`")]
    ReservedField(&'static str),
}

/// Table of known message types.
#[derive(Clone)]
pub struct MessageRegistry {
    decoders: HashMap<String, Decoder>,
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.decoders.keys().collect();
        kinds.sort();
        f.debug_struct("MessageRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MessageRegistry {
    /// Start a registry with all protocol messages registered.
    pub fn builder() -> MessageRegistryBuilder {
        let mut builder = MessageRegistryBuilder {
            decoders: HashMap::new(),
        };
        for kind in kinds::ALL {
            let decoder: Decoder = Arc::new(move |mut fields: Map<String, Value>| {
                fields.insert(TYPE_FIELD.to_string(), Value::String(kind.to_string()));
                serde_json::from_value::<ProtocolMessage>(Value::Object(fields)).map(Body::Protocol)
            });
            builder.decoders.insert(kind.to_string(), decoder);
        }
        builder
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Encode an envelope to its wire text.
    pub fn encode(&self, envelope: &Envelope) -> Result<String, CodecError> {
        let kind = envelope.body.kind();
        if !self.is_registered(kind) {
            return Err(CodecError::UnknownKind(kind.to_string()));
        }

        let mut fields = match &envelope.body {
            Body::Protocol(msg) => match serde_json::to_value(msg)? {
                Value::Object(map) => map,
                _ => return Err(CodecError::NotAnObject),
            },
            Body::Application { kind, data } => {
                if let Some(field) = RESERVED_FIELDS.iter().find(|f| data.contains_key(**f)) {
                    return Err(CodecError::ReservedField(*field));
                }
                let mut map = data.clone();
                map.insert(TYPE_FIELD.to_string(), Value::String(kind.clone()));
                map
            }
        };

        fields.insert(ID_FIELD.to_string(), serde_json::to_value(envelope.id)?);
        if let Some(reply) = envelope.in_reply_to {
            fields.insert(REPLY_FIELD.to_string(), serde_json::to_value(reply)?);
        }
        if let Some(app) = envelope.application_id {
            fields.insert(APPLICATION_FIELD.to_string(), serde_json::to_value(app)?);
        }

        Ok(serde_json::to_string(&Value::Object(fields))?)
    }

    /// Decode wire text into an envelope.
    pub fn decode(&self, text: &str) -> Result<Envelope, CodecError> {
        let mut fields = match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => map,
            _ => return Err(CodecError::NotAnObject),
        };

        let kind = match fields.remove(TYPE_FIELD) {
            Some(Value::String(kind)) => kind,
            _ => return Err(CodecError::MissingType),
        };
        let decoder = self
            .decoders
            .get(&kind)
            .ok_or(CodecError::UnknownKind(kind))?;

        let id = take_field(&mut fields, ID_FIELD)?.ok_or(CodecError::MissingId)?;
        let in_reply_to = take_field(&mut fields, REPLY_FIELD)?;
        let application_id = take_field(&mut fields, APPLICATION_FIELD)?;
        let body = decoder(fields)?;

        Ok(Envelope {
            id,
            in_reply_to,
            application_id,
            body,
        })
    }
}

fn take_field<T: DeserializeOwned>(
    fields: &mut Map<String, Value>,
    name: &str,
) -> Result<Option<T>, serde_json::Error> {
    match fields.remove(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some),
    }
}

/// Collects application message types before the registry is frozen.
pub struct MessageRegistryBuilder {
    decoders: HashMap<String, Decoder>,
}

impl MessageRegistryBuilder {
    /// Register an application message type whose payload must decode as `T`.
    ///
    /// A kind that is already registered keeps its first decoder.
    pub fn register<T: DeserializeOwned + 'static>(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        if self.decoders.contains_key(&kind) {
            return self;
        }
        let tag = kind.clone();
        let decoder: Decoder = Arc::new(move |fields: Map<String, Value>| {
            serde_json::from_value::<T>(Value::Object(fields.clone()))?;
            Ok(Body::Application {
                kind: tag.clone(),
                data: fields,
            })
        });
        self.decoders.insert(kind, decoder);
        self
    }

    /// Register an application message type accepting any payload.
    pub fn register_untyped(self, kind: impl Into<String>) -> Self {
        self.register::<Map<String, Value>>(kind)
    }

    pub fn build(self) -> MessageRegistry {
        MessageRegistry {
            decoders: self.decoders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApplicationId, ModuleId};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    fn registry() -> MessageRegistry {
        MessageRegistry::builder()
            .register::<Reading>("reading")
            .build()
    }

    #[test]
    fn protocol_message_roundtrip() {
        let registry = registry();
        let hello = Envelope::new(ProtocolMessage::Hello {
            module_id: ModuleId::random(),
            max_frame_length: 65535,
        });
        let text = registry.encode(&hello).unwrap();
        assert!(text.contains("\"type\":\"hello\""));
        assert_eq!(registry.decode(&text).unwrap(), hello);
    }

    #[test]
    fn application_message_keeps_routing_fields() {
        let registry = registry();
        let app = ApplicationId::random();
        let request = Envelope::new(
            Body::application(
                "reading",
                &Reading {
                    sensor: "t1".into(),
                    value: 3.0,
                },
            )
            .unwrap(),
        )
        .with_application(app);
        let reply = request.reply(ProtocolMessage::Ack);

        let decoded = registry.decode(&registry.encode(&request).unwrap()).unwrap();
        assert_eq!(decoded.application_id, Some(app));
        assert_eq!(decoded.kind(), "reading");
        let reading: Reading = decoded.body.decode().unwrap().unwrap();
        assert_eq!(reading.sensor, "t1");

        let decoded = registry.decode(&registry.encode(&reply).unwrap()).unwrap();
        assert_eq!(decoded.in_reply_to, Some(request.id));
    }

    #[test]
    fn unregistered_kind_is_rejected_both_ways() {
        let registry = MessageRegistry::default();
        let msg = Envelope::new(Body::application("reading", &serde_json::json!({})).unwrap());
        assert!(matches!(
            registry.encode(&msg),
            Err(CodecError::UnknownKind(kind)) if kind == "reading"
        ));

        let text = format!(r#"{{"type":"reading","uuid":"{}"}}"#, msg.id);
        assert!(matches!(
            registry.decode(&text),
            Err(CodecError::UnknownKind(_))
        ));
    }

    #[test]
    fn registered_shape_is_validated() {
        let text = format!(
            r#"{{"type":"reading","uuid":"{}","sensor":"t1"}}"#,
            crate::MessageId::random()
        );
        assert!(matches!(registry().decode(&text), Err(CodecError::Json(_))));
    }

    #[test]
    fn payload_cannot_shadow_envelope_fields() {
        let registry = registry();
        for field in RESERVED_FIELDS {
            let payload = serde_json::json!({ field: "spoofed", "sensor": "t1" });
            let msg = Envelope::new(Body::application("reading", &payload).unwrap());
            assert!(
                matches!(registry.encode(&msg), Err(CodecError::ReservedField(f)) if f == field),
                "{field} accepted"
            );
        }
    }

    #[test]
    fn malformed_frames() {
        let registry = registry();
        assert!(matches!(registry.decode("[]"), Err(CodecError::NotAnObject)));
        assert!(matches!(registry.decode("{}"), Err(CodecError::MissingType)));
        assert!(matches!(
            registry.decode(r#"{"type":"ack"}"#),
            Err(CodecError::MissingId)
        ));
        assert!(matches!(registry.decode("{"), Err(CodecError::Json(_))));
    }

    #[test]
    fn first_registration_wins() {
        let registry = MessageRegistry::builder()
            .register::<Reading>("hello")
            .build();
        let hello = Envelope::new(ProtocolMessage::Hello {
            module_id: ModuleId::random(),
            max_frame_length: 10,
        });
        let decoded = registry.decode(&registry.encode(&hello).unwrap()).unwrap();
        assert!(matches!(decoded.body, Body::Protocol(_)));
    }
}
