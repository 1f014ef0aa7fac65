//! Application-layer GATT model for BLE peripherals and centrals.
//!
//! The crate sits on top of an external, event-driven host stack, abstracted
//! by the [`host::Stack`] trait. The [`gatt`] module implements the local
//! server role: an attribute tree of services, characteristics, and
//! descriptors that is compiled into tables, registered with the stack, and
//! served through access callbacks. The [`client`] module implements the
//! central role: discovery of a peer's attribute tree and synchronous
//! read/write/subscribe operations bridged onto the stack's asynchronous
//! completion callbacks.
//!
//! Handles, permissions, and error codes follow the Attribute Protocol
//! ([Vol 3] Part F) and the Generic Attribute Profile ([Vol 3] Part G).

#![warn(missing_debug_implementations)]
#![warn(unused_crate_dependencies)]
#![allow(clippy::enum_glob_use)]

use crate::att::ErrorCode;
use crate::host::Status;

pub mod att;
pub mod client;
pub mod gatt;
pub mod host;
pub mod le;
pub mod uuid;

mod util;

#[cfg(test)]
pub(crate) mod mock;

pub(crate) use util::{impl_display_via_debug, name_of};

/// Error type returned by all fallible operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The client is not connected to the peer.
    #[error("not connected")]
    NotConnected,
    /// The link disconnected while an operation was in flight.
    #[error("link disconnected")]
    Disconnected,
    /// The attribute has not been registered with the host stack yet.
    #[error("attribute handle not assigned")]
    UnassignedHandle,
    /// Another [`gatt::Server`] instance already exists.
    #[error("server already exists")]
    ServerExists,
    /// A previous indication on the connection has not been confirmed.
    #[error("indication pending")]
    IndicationPending,
    /// The characteristic's properties do not allow the requested update.
    #[error("notifications not permitted")]
    NotifyDenied,
    /// The requested attribute was not found.
    #[error("attribute not found")]
    NotFound,
    /// Attribute table registration failed.
    #[error("table registration failed: {0}")]
    Registration(Status),
    /// The peer or local server reported an attribute error.
    #[error("attribute error: {0}")]
    Att(#[from] ErrorCode),
    /// The host stack rejected or failed an operation.
    #[error("host stack error: {0}")]
    Stack(Status),
}

impl From<Status> for Error {
    fn from(st: Status) -> Self {
        match st {
            Status::Disconnected => Self::Disconnected,
            Status::Att(e) => Self::Att(e),
            st => Self::Stack(st),
        }
    }
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;
