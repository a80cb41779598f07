use modnet_core::{CodecError, ModuleId, MulticastGroup};
use std::io;
use std::net::SocketAddr;

/// Failure while standing up a channel.
#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("channel worker stopped")]
    WorkerGone,
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("connect to {0} timed out")]
    Timeout(SocketAddr),
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("join {group} failed: {source}")]
    Join {
        group: MulticastGroup,
        #[source]
        source: io::Error,
    },
}

/// Failure reading or writing one frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Failure handing a message to a connection.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("not connected to {0}")]
    NotConnected(ModuleId),
    #[error("connection to {0} is closed")]
    Closed(ModuleId),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Failure waiting for a correlated response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    #[error("connection to {0} was lost")]
    ConnectionLost(ModuleId),
    #[error("no response within the request timeout")]
    TimedOut,
    #[error("response correlator was dropped")]
    Dropped,
    #[error("request could not be sent: {0}")]
    SendFailed(String),
}
