use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::att::{Access, AttValue, ErrorCode, Handle, Prop};
use crate::host::{ConnHandle, ConnInfo, Stack, Status};
use crate::uuid::Uuid;
use crate::{Error, Result};

use super::{AccessReq, AttState, Descriptor, IoResult, Service, SubMode};

/// Application callbacks for local characteristic access and state. All
/// methods run on the host context with default no-op bodies and must not
/// block.
pub trait ChrHandler: Send + Sync {
    /// Called before the stored value is returned for a fresh read, giving
    /// the application a chance to update it.
    fn on_read(&self, chr: &Characteristic, conn: &ConnInfo) {
        let _ = (chr, conn);
    }

    /// Called after a completed write has replaced the stored value.
    fn on_write(&self, chr: &Characteristic, conn: &ConnInfo) {
        let _ = (chr, conn);
    }

    /// Called before a notification or indication is submitted for a
    /// subscribed peer.
    fn on_notify(&self, chr: &Characteristic) {
        let _ = chr;
    }

    /// Called with the delivery status of a notification or indication:
    /// submission failures, and for indications the peer's confirmation or
    /// its absence.
    fn on_status(&self, chr: &Characteristic, conn: ConnHandle, status: Status) {
        let _ = (chr, conn, status);
    }

    /// Called when a peer changes its subscription state.
    fn on_subscribe(&self, chr: &Characteristic, conn: &ConnInfo, sub: SubMode) {
        let _ = (chr, conn, sub);
    }
}

/// Local GATT characteristic ([Vol 3] Part G, Section 3.3).
pub struct Characteristic {
    uuid: Uuid,
    props: Prop,
    val: AttValue,
    hdl: Mutex<Option<Handle>>,
    svc: Mutex<Weak<Service>>,
    dscs: Mutex<Vec<Arc<Descriptor>>>,
    subs: Mutex<SmallVec<[(ConnHandle, SubMode); 4]>>,
    state: Mutex<AttState>,
    handler: Mutex<Option<Arc<dyn ChrHandler>>>,
    /// Reassembly scratch for in-progress fragmented writes.
    pending: Mutex<Vec<u8>>,
}

impl Characteristic {
    pub(super) fn new(uuid: Uuid, props: Prop, max_len: usize) -> Self {
        Self {
            uuid,
            props,
            val: AttValue::new(max_len),
            hdl: Mutex::new(None),
            svc: Mutex::new(Weak::new()),
            dscs: Mutex::new(Vec::new()),
            subs: Mutex::new(SmallVec::new()),
            state: Mutex::new(AttState::Active),
            handler: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Returns the characteristic type.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the property bitmask.
    #[inline]
    #[must_use]
    pub const fn properties(&self) -> Prop {
        self.props
    }

    /// Returns the stack-assigned value handle. Fails until the owning
    /// service has been started.
    #[inline]
    pub fn handle(&self) -> Result<Handle> {
        self.hdl.lock().ok_or(Error::UnassignedHandle)
    }

    /// Returns a copy of the stored value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> Vec<u8> {
        self.val.value()
    }

    /// Replaces the stored value without notifying subscribers.
    #[inline]
    pub fn set_value(&self, v: &[u8]) -> Result<()> {
        Ok(self.val.set(v)?)
    }

    /// Returns the owning service, if it still exists.
    #[inline]
    #[must_use]
    pub fn service(&self) -> Option<Arc<Service>> {
        self.svc.lock().upgrade()
    }

    /// Registers the access handler.
    #[inline]
    pub fn set_handler(&self, h: Arc<dyn ChrHandler>) {
        *self.handler.lock() = Some(h);
    }

    /// Creates a new descriptor owned by this characteristic. Duplicate
    /// UUIDs are permitted but usually a mistake.
    pub fn create_descriptor(
        self: &Arc<Self>,
        uuid: Uuid,
        props: Prop,
        max_len: usize,
    ) -> Arc<Descriptor> {
        if self.descriptor(uuid).is_some() {
            warn!("Duplicate descriptor {uuid} in characteristic {}", self.uuid);
        }
        let dsc = Arc::new(Descriptor::new(uuid, props, max_len));
        dsc.set_chr(Arc::downgrade(self));
        self.dscs.lock().push(Arc::clone(&dsc));
        self.changed();
        dsc
    }

    /// Re-adds a previously removed descriptor.
    pub fn add_descriptor(self: &Arc<Self>, dsc: &Arc<Descriptor>) {
        let mut dscs = self.dscs.lock();
        if let Some(known) = dscs.iter().find(|d| Arc::ptr_eq(d, dsc)) {
            if !known.is_active() {
                known.set_state(AttState::Active);
                drop(dscs);
                self.changed();
            }
            return;
        }
        dsc.set_chr(Arc::downgrade(self));
        dscs.push(Arc::clone(dsc));
        drop(dscs);
        self.changed();
    }

    /// Removes a descriptor from the registered table. With `delete == false`
    /// the descriptor is only hidden and can be re-added later; with
    /// `delete == true` it is dropped from the tree at the next safe table
    /// rebuild.
    pub fn remove_descriptor(&self, dsc: &Arc<Descriptor>, delete: bool) {
        let dscs = self.dscs.lock();
        let Some(known) = dscs.iter().find(|d| Arc::ptr_eq(d, dsc)) else {
            return;
        };
        let st = if delete {
            AttState::PendingDelete
        } else {
            AttState::Hidden
        };
        if known.state() == st {
            return;
        }
        known.set_state(st);
        drop(dscs);
        self.changed();
    }

    /// Returns the first descriptor with the given UUID.
    #[must_use]
    pub fn descriptor(&self, uuid: Uuid) -> Option<Arc<Descriptor>> {
        (self.dscs.lock().iter())
            .find(|d| d.uuid() == uuid)
            .map(Arc::clone)
    }

    /// Returns all descriptors, including hidden ones.
    #[inline]
    #[must_use]
    pub fn descriptors(&self) -> Vec<Arc<Descriptor>> {
        self.dscs.lock().clone()
    }

    /// Returns a peer's subscription state.
    #[must_use]
    pub fn subscribed(&self, conn: ConnHandle) -> SubMode {
        (self.subs.lock().iter())
            .find_map(|&(c, s)| (c == conn).then_some(s))
            .unwrap_or(SubMode::NONE)
    }

    /// Returns all current subscribers.
    #[inline]
    #[must_use]
    pub fn subscribers(&self) -> SmallVec<[(ConnHandle, SubMode); 4]> {
        self.subs.lock().clone()
    }

    /// Updates a peer's subscription state, returning the previous state.
    pub(crate) fn set_subscription(&self, conn: ConnHandle, sub: SubMode) -> SubMode {
        let mut subs = self.subs.lock();
        let prev = match subs.iter().position(|&(c, _)| c == conn) {
            Some(i) => {
                let prev = subs[i].1;
                if sub.is_none() {
                    subs.swap_remove(i);
                } else {
                    subs[i].1 = sub;
                }
                prev
            }
            None => {
                if !sub.is_none() {
                    subs.push((conn, sub));
                }
                SubMode::NONE
            }
        };
        trace!("Characteristic {} subscription {conn}: {sub:?}", self.uuid);
        prev
    }

    /// Drops a disconnected peer's subscription.
    #[inline]
    pub(crate) fn remove_subscription(&self, conn: ConnHandle) {
        self.subs.lock().retain(|&mut (c, _)| c != conn);
    }

    pub(super) fn set_svc(&self, svc: Weak<Service>) {
        *self.svc.lock() = svc;
    }

    #[inline]
    pub(super) fn set_handle(&self, hdl: Handle) {
        *self.hdl.lock() = Some(hdl);
    }

    #[inline]
    pub(super) fn state(&self) -> AttState {
        *self.state.lock()
    }

    #[inline]
    pub(super) fn set_state(&self, st: AttState) {
        *self.state.lock() = st;
    }

    #[inline]
    pub(super) fn is_active(&self) -> bool {
        self.state() == AttState::Active
    }

    /// Drops descriptors marked for deletion.
    pub(super) fn compact_descriptors(&self) {
        (self.dscs.lock()).retain(|d| d.state() != AttState::PendingDelete);
    }

    pub(super) fn handler(&self) -> Option<Arc<dyn ChrHandler>> {
        self.handler.lock().clone()
    }

    /// Propagates a structural change up to the server.
    fn changed(&self) {
        if let Some(svc) = self.svc.lock().upgrade() {
            svc.changed();
        }
    }

    /// Handles a peer access request from the registered table.
    pub(super) fn access(&self, stack: &Arc<dyn Stack>, req: AccessReq) -> IoResult {
        let ci = (stack.connection(req.conn_handle())).ok_or(ErrorCode::UnlikelyError)?;
        match req {
            AccessReq::Read(r) => {
                self.props.test(Access::Read, ci.sec)?;
                super::read_access(&self.val, &ci, r, |ci| {
                    if let Some(h) = self.handler() {
                        h.on_read(self, ci);
                    }
                })
            }
            AccessReq::Write(w) => {
                self.props.test(Access::Write, ci.sec)?;
                trace!(
                    "Characteristic {} write of {} bytes at offset {}",
                    self.uuid,
                    w.value().len(),
                    w.offset()
                );
                super::write_access(&self.val, &self.pending, w)?;
                if w.is_complete() {
                    if let Some(h) = self.handler() {
                        h.on_write(self, &ci);
                    }
                }
                Ok(())
            }
        }
    }
}

impl Debug for Characteristic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(crate::name_of!(Characteristic))
            .field("uuid", &self.uuid)
            .field("props", &self.props)
            .field("hdl", &*self.hdl.lock())
            .field("dscs", &self.dscs.lock().len())
            .finish_non_exhaustive()
    }
}
