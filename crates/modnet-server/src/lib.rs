//! Running a modnet module.
//!
//! A [`ServerManager`] starts and stops the networking of one module through
//! a [`ServerTransport`], normally [`TcpUdpTransport`]. The
//! [`ModuleDirectory`] and [`ApplicationDirectory`] follow it to keep track
//! of the other modules.

mod config;
mod directory;
mod error;
mod lifecycle;
mod transport;

pub use config::{ConfigError, ServerConfig, derive_announce};
pub use directory::{
    ApplicationDirectory, ApplicationDirectoryListener, ModuleDirectory, ModuleDirectoryListener,
};
pub use error::ServerError;
pub use lifecycle::{ServerManager, ServerStateListener, ServerTransport, Services};
pub use modnet_core::ServerState;
pub use transport::{ApplicationCatalog, NoApplications, TcpUdpTransport};
