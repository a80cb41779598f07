//! Identifiers.
//!
//! Every identifier is a 128-bit UUID rendered in its hyphenated form on the
//! wire, e.g. `67e55044-10b1-426f-9247-bb680e5fe0c8`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Uuid);

        impl $name {
            /// Create a fresh random identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.hyphenated().fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() {
                    return Err(IdParseError::Empty);
                }
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| IdParseError::Invalid(s.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}

uuid_id! {
    /// Identifies one module process. Chosen once at startup.
    ModuleId
}

uuid_id! {
    /// Identifies an application running across modules.
    ApplicationId
}

uuid_id! {
    /// Identifies one message; responses carry the id of the request they answer.
    MessageId
}

impl ModuleId {
    /// Whether this module drives the handshake with `other`.
    ///
    /// Both ends agree on the same master because the ordering is total.
    pub fn is_master_for(&self, other: &ModuleId) -> bool {
        self < other
    }
}

impl ApplicationId {
    /// Sentinel for "no application"; messages without an application id or
    /// with this one are routed to default handlers.
    pub const DEFAULT: ApplicationId = ApplicationId(Uuid::nil());

    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

/// Error parsing an identifier string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdParseError {
    #[error("identifier cannot be empty")]
    Empty,
    #[error("invalid identifier: {0}")]
    Invalid(String),
}
