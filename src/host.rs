//! Host-stack boundary.
//!
//! The crate does not implement the ATT/GATT wire protocol. It models the
//! application layer on top of an external, single-threaded, event-driven
//! host stack represented by the [`Stack`] trait. A platform binding
//! implements [`Stack`] and delivers protocol events back into the crate:
//! GAP/server events through [`Server::handle_event`], per-attribute access
//! through the table's access callbacks, and per-operation completion through
//! the [`OpCallback`] given at submission time.
//!
//! All callbacks run on the stack's event thread (the "host context") and
//! must never block. Application threads block only inside the client's
//! synchronous operation bridge.
//!
//! [`Server::handle_event`]: crate::gatt::Server::handle_event

use std::fmt::{Debug, Formatter};

use crate::att::{ConnSec, ErrorCode, Handle, HandleRange, Prop};
use crate::gatt::TableDef;
use crate::le::Addr;
use crate::uuid::Uuid;

/// Connection identifier assigned by the host stack.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnHandle(u16);

impl ConnHandle {
    /// Wraps a raw connection identifier.
    #[inline]
    #[must_use]
    pub const fn new(h: u16) -> Self {
        Self(h)
    }
}

impl Debug for ConnHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06X})", crate::name_of!(ConnHandle), self.0)
    }
}

crate::impl_display_via_debug! { ConnHandle }

impl From<ConnHandle> for u16 {
    #[inline]
    fn from(h: ConnHandle) -> Self {
        h.0
    }
}

/// Snapshot of an established connection's state.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct ConnInfo {
    pub conn: ConnHandle,
    pub peer: Addr,
    pub mtu: u16,
    pub sec: ConnSec,
    pub bonded: bool,
}

impl ConnInfo {
    /// Returns whether the link is encrypted.
    #[inline]
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.sec.contains(ConnSec::ENCRYPTED)
    }
}

/// Completion status of a submitted client operation or server notification.
///
/// [`Status::Done`] is the success terminal. Any other variant is a failure;
/// the same type doubles as the immediate submission error, which is surfaced
/// to the caller without waiting for a callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Status {
    /// Operation completed.
    #[error("done")]
    Done,
    /// The peer or local server reported an attribute error.
    #[error("attribute error: {0}")]
    Att(ErrorCode),
    /// The link disconnected before the operation completed.
    #[error("link disconnected")]
    Disconnected,
    /// Another operation is still in progress on this connection.
    #[error("operation already in progress")]
    Busy,
    /// The stack could not allocate resources for the operation.
    #[error("insufficient resources")]
    Memory,
    /// The stack does not support the requested operation.
    #[error("operation not supported")]
    Unsupported,
    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,
    /// Unclassified host stack failure.
    #[error("host stack failure")]
    Failed,
}

impl Status {
    /// Returns the attribute error code, if any.
    #[inline]
    #[must_use]
    pub const fn att(self) -> Option<ErrorCode> {
        match self {
            Self::Att(e) => Some(e),
            _ => None,
        }
    }

    /// Returns whether a link security upgrade may allow the operation to
    /// succeed on retry.
    #[inline]
    #[must_use]
    pub const fn is_security(self) -> bool {
        matches!(self, Self::Att(e) if e.is_security())
    }
}

/// Submission result for operations handed to the stack.
pub type SubmitResult = std::result::Result<(), Status>;

/// One callback delivery for an in-flight client operation.
#[derive(Debug)]
pub struct ClientEvent {
    /// Connection the event belongs to. The bridge discards events for any
    /// other connection.
    pub conn: ConnHandle,
    pub event: OpEvent,
}

/// Progress of an in-flight client operation.
#[derive(Debug)]
pub enum OpEvent {
    /// Non-terminal delivery: one value fragment or one discovered attribute.
    /// The operation remains in flight and the callback stays registered.
    Item(OpData),
    /// Terminal delivery: the operation finished with the given status and
    /// the callback is released.
    Complete(Status),
}

/// Payload of a non-terminal operation callback.
#[derive(Clone, Debug)]
pub enum OpData {
    /// One fragment of a (long) read.
    Fragment(Vec<u8>),
    /// One discovered service.
    Service {
        uuid: Uuid,
        range: HandleRange,
    },
    /// One discovered characteristic.
    Characteristic {
        uuid: Uuid,
        decl: Handle,
        value: Handle,
        props: Prop,
    },
    /// One discovered descriptor.
    Descriptor {
        uuid: Uuid,
        hdl: Handle,
    },
}

/// Completion callback registered with the stack for one operation. Invoked
/// on the host context zero or more times with non-terminal events and
/// exactly once with a terminal event, unless submission itself failed.
pub type OpCallback = Box<dyn FnMut(ClientEvent) + Send>;

/// Application reply to a pairing passkey event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PasskeyReply {
    /// Six-digit passkey entered or displayed by the application.
    Passkey(u32),
    /// Numeric-comparison confirmation.
    Confirm(bool),
}

/// Interface to the external host stack.
///
/// Server-side methods mirror a two-phase attribute registration model: the
/// stack first validates and sizes a [`TableDef`] (`count_table`), then
/// commits it (`add_table`) and returns the assigned handles, one per
/// non-sentinel entry in flattening order.
pub trait Stack: Send + Sync {
    // Server side.

    /// Validates a compiled attribute table and reserves resources for it.
    fn count_table(&self, table: &TableDef) -> SubmitResult;

    /// Commits a previously counted table, assigning attribute handles.
    fn add_table(&self, table: &TableDef) -> Result<Vec<Handle>, Status>;

    /// Discards all registered tables so they can be rebuilt.
    fn reset_tables(&self) -> SubmitResult;

    /// Returns the declaration handle of a registered service.
    fn find_service(&self, uuid: Uuid) -> Option<Handle>;

    /// Shows or hides a registered service without unregistering it.
    fn set_visibility(&self, hdl: Handle, visible: bool) -> SubmitResult;

    /// Signals peers that the attribute database changed.
    fn signal_changed(&self);

    /// Sends a notification (`indicate == false`) or indication to a peer.
    fn notify(&self, conn: ConnHandle, hdl: Handle, val: &[u8], indicate: bool) -> SubmitResult;

    // Connections and security.

    /// Returns the state of an established connection.
    fn connection(&self, conn: ConnHandle) -> Option<ConnInfo>;

    /// Starts a link security upgrade (encryption/pairing).
    fn initiate_security(&self, conn: ConnHandle) -> SubmitResult;

    /// Delivers the application's reply to a pairing passkey event.
    fn inject_passkey(&self, conn: ConnHandle, reply: PasskeyReply) -> SubmitResult;

    /// Terminates a connection.
    fn terminate(&self, conn: ConnHandle) -> SubmitResult;

    /// (Re)starts advertising. Used after failed connects and optionally on
    /// disconnect.
    fn start_advertising(&self) {}

    /// Stops advertising.
    fn stop_advertising(&self) {}

    // Client side.

    /// Discovers services, optionally filtered by UUID.
    fn discover_services(&self, conn: ConnHandle, uuid: Option<Uuid>, cb: OpCallback)
        -> SubmitResult;

    /// Discovers characteristics within a handle range, optionally filtered
    /// by UUID.
    fn discover_characteristics(
        &self,
        conn: ConnHandle,
        range: HandleRange,
        uuid: Option<Uuid>,
        cb: OpCallback,
    ) -> SubmitResult;

    /// Discovers descriptors between a characteristic's value handle and its
    /// end handle.
    fn discover_descriptors(&self, conn: ConnHandle, range: HandleRange, cb: OpCallback)
        -> SubmitResult;

    /// Reads an attribute value starting at `offset`, continuing with blob
    /// reads as needed. The value arrives as one or more
    /// [`OpData::Fragment`]s.
    fn read_long(&self, conn: ConnHandle, hdl: Handle, offset: u16, cb: OpCallback)
        -> SubmitResult;

    /// Writes an attribute value in a single acknowledged request. The value
    /// must fit within `MTU - 3` bytes.
    fn write(&self, conn: ConnHandle, hdl: Handle, val: &[u8], cb: OpCallback) -> SubmitResult;

    /// Writes an attribute value of any length using the prepare/execute
    /// write procedure.
    fn write_long(&self, conn: ConnHandle, hdl: Handle, val: &[u8], cb: OpCallback)
        -> SubmitResult;

    /// Writes an attribute value without response. No callback is invoked.
    fn write_no_rsp(&self, conn: ConnHandle, hdl: Handle, val: &[u8]) -> SubmitResult;
}
