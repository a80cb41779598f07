//! Core types for modnet.
//!
//! This crate holds the data model shared by every module: identifiers, the
//! message envelope and its text codec, the beacon datagram and the records
//! modules exchange about themselves. It does no I/O.

mod beacon;
mod codec;
mod ids;
mod info;
pub mod message;

pub use beacon::{Beacon, BeaconDecodeError};
pub use codec::{CodecError, MessageRegistry, MessageRegistryBuilder, RESERVED_FIELDS};
pub use ids::{ApplicationId, IdParseError, MessageId, ModuleId};
pub use info::{ApplicationInfo, BlockInfo, ModuleInfo, MulticastGroup};
pub use message::{Body, Envelope, ProtocolMessage};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server lifecycle state.
///
/// Transitions only along `Stopped -> Starting -> Running -> Stopping -> Stopped`,
/// plus the rollbacks `Starting -> Stopped` and `Stopping -> Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Nothing is running.
    Stopped,
    /// Connection manager and beacon are being set up.
    Starting,
    /// Normal operation.
    Running,
    /// Connection manager and beacon are being torn down.
    Stopping,
}

impl ServerState {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_become(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Running)
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "STOPPED",
            ServerState::Starting => "STARTING",
            ServerState::Running => "RUNNING",
            ServerState::Stopping => "STOPPING",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_cycle() {
        use ServerState::*;
        assert!(Stopped.can_become(Starting));
        assert!(Starting.can_become(Running));
        assert!(Running.can_become(Stopping));
        assert!(Stopping.can_become(Stopped));
        assert!(!Stopped.can_become(Running));
        assert!(!Running.can_become(Starting));
        assert!(!Stopped.can_become(Stopped));
    }
}
