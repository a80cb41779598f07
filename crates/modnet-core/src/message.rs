//! Protocol messages.
//!
//! A message is an [`Envelope`] around a [`Body`]. The body is either one of
//! the protocol messages this crate knows about, or an application message
//! whose shape was registered with the [`MessageRegistry`](crate::MessageRegistry).

use crate::{ApplicationId, ApplicationInfo, MessageId, ModuleId, ModuleInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

/// Type tags of the protocol messages.
pub mod kinds {
    pub const HELLO: &str = "hello";
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const PEERS: &str = "peers";
    pub const REQUEST_MODULE_INFO: &str = "request_module_info";
    pub const MODULE_INFO: &str = "module_info";
    pub const REQUEST_APPLICATION_LIST: &str = "request_application_list";
    pub const APPLICATION_LIST: &str = "application_list";
    pub const ACK: &str = "ack";
    pub const NAK: &str = "nak";

    pub const ALL: [&str; 9] = [
        HELLO,
        CONNECTION_ESTABLISHED,
        PEERS,
        REQUEST_MODULE_INFO,
        MODULE_INFO,
        REQUEST_APPLICATION_LIST,
        APPLICATION_LIST,
        ACK,
        NAK,
    ];
}

/// Messages spoken by the substrate itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// First frame on every connection.
    Hello {
        module_id: ModuleId,
        max_frame_length: u32,
    },
    /// Sent by the master once it has accepted the connection.
    ConnectionEstablished { module_id: ModuleId },
    /// Address book gossip.
    Peers {
        modules: BTreeMap<ModuleId, BTreeSet<SocketAddr>>,
    },
    RequestModuleInfo,
    ModuleInfo(ModuleInfo),
    RequestApplicationList,
    ApplicationList { applications: Vec<ApplicationInfo> },
    Ack,
    Nak { reason: String },
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => kinds::HELLO,
            Self::ConnectionEstablished { .. } => kinds::CONNECTION_ESTABLISHED,
            Self::Peers { .. } => kinds::PEERS,
            Self::RequestModuleInfo => kinds::REQUEST_MODULE_INFO,
            Self::ModuleInfo(_) => kinds::MODULE_INFO,
            Self::RequestApplicationList => kinds::REQUEST_APPLICATION_LIST,
            Self::ApplicationList { .. } => kinds::APPLICATION_LIST,
            Self::Ack => kinds::ACK,
            Self::Nak { .. } => kinds::NAK,
        }
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Protocol(ProtocolMessage),
    /// Application message. `data` holds every field except the reserved
    /// `type`, `uuid`, `source_uuid` and `application_id` keys.
    Application {
        kind: String,
        data: Map<String, Value>,
    },
}

impl Body {
    /// Build an application body from any serializable struct.
    ///
    /// The payload shares one JSON object with the envelope, so it must not
    /// use the keys in [`RESERVED_FIELDS`](crate::RESERVED_FIELDS); encoding
    /// such a body fails.
    pub fn application<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let data = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(Body::Application {
            kind: kind.into(),
            data,
        })
    }

    /// The type tag written to the wire.
    pub fn kind(&self) -> &str {
        match self {
            Body::Protocol(msg) => msg.kind(),
            Body::Application { kind, .. } => kind,
        }
    }

    /// Decode an application payload into its concrete type.
    ///
    /// Returns `None` for protocol messages.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        match self {
            Body::Protocol(_) => None,
            Body::Application { data, .. } => {
                Some(serde_json::from_value(Value::Object(data.clone())))
            }
        }
    }

    pub fn as_protocol(&self) -> Option<&ProtocolMessage> {
        match self {
            Body::Protocol(msg) => Some(msg),
            Body::Application { .. } => None,
        }
    }
}

impl From<ProtocolMessage> for Body {
    fn from(msg: ProtocolMessage) -> Self {
        Body::Protocol(msg)
    }
}

/// A message as it travels between modules.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Unique id of this message.
    pub id: MessageId,
    /// Set on responses: the id of the request being answered.
    pub in_reply_to: Option<MessageId>,
    /// Routes the message to an application's handler.
    pub application_id: Option<ApplicationId>,
    pub body: Body,
}

impl Envelope {
    /// Create a message with a fresh id.
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            id: MessageId::random(),
            in_reply_to: None,
            application_id: None,
            body: body.into(),
        }
    }

    pub fn with_application(mut self, application_id: ApplicationId) -> Self {
        self.application_id = Some(application_id);
        self
    }

    /// Create the response to this message.
    pub fn reply(&self, body: impl Into<Body>) -> Envelope {
        Envelope {
            id: MessageId::random(),
            in_reply_to: Some(self.id),
            application_id: self.application_id,
            body: body.into(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.in_reply_to.is_some()
    }

    pub fn kind(&self) -> &str {
        self.body.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Temperature {
        celsius: f64,
    }

    #[test]
    fn reply_links_request() {
        let app = ApplicationId::random();
        let request = Envelope::new(ProtocolMessage::RequestModuleInfo).with_application(app);
        let response = request.reply(ProtocolMessage::Ack);
        assert_eq!(response.in_reply_to, Some(request.id));
        assert_eq!(response.application_id, Some(app));
        assert_ne!(response.id, request.id);
        assert!(response.is_response());
        assert!(!request.is_response());
    }

    #[test]
    fn application_body_roundtrips_payload() {
        let body = Body::application("temperature", &Temperature { celsius: 21.5 }).unwrap();
        assert_eq!(body.kind(), "temperature");
        let decoded: Temperature = body.decode().unwrap().unwrap();
        assert_eq!(decoded, Temperature { celsius: 21.5 });
    }

    #[test]
    fn protocol_kinds_match_serde_tags() {
        let msg = ProtocolMessage::ConnectionEstablished {
            module_id: ModuleId::random(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], msg.kind());
        assert!(kinds::ALL.contains(&msg.kind()));
    }
}
