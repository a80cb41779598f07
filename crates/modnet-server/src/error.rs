use crate::config::ConfigError;
use modnet_transport::EstablishError;
use thiserror::Error;

/// Why a server failed to start or stop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Establish(#[from] EstablishError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("teardown failed: {0}")]
    Teardown(String),
}
