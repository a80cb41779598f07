//! Networking for modnet.
//!
//! Channels are stood up through [`establish`], carry length-prefixed frames
//! ([`frame`]) and are owned by a [`ConnectionManager`]. Modules find each
//! other through a [`MulticastBeacon`] and learn about modules further away
//! through the [`PeerExchanger`].

mod beacon;
mod connection;
mod correlator;
mod dispatch;
mod error;
pub mod establish;
pub mod frame;
mod listeners;
mod peers;
mod shutdown;

pub use beacon::{BeaconListener, MulticastBeacon};
pub use connection::{ConnectionListener, ConnectionManager, ConnectionOptions, Prepared};
pub use correlator::{ResponseCorrelator, ResponseFuture};
pub use dispatch::{Dispatcher, MessageHandler, handler_fn};
pub use error::{EstablishError, FrameError, ResponseError, SendError};
pub use establish::WorkerPool;
pub use listeners::ListenerSet;
pub use peers::{AddressBook, PeerExchanger};
