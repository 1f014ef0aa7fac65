use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::att::{Access, AttValue, ErrorCode, Handle, Prop};
use crate::host::{ConnInfo, Stack};
use crate::uuid::Uuid;
use crate::{Error, Result};

use super::{AccessReq, AttState, Characteristic, IoResult};

/// Application callbacks for local descriptor access. All methods run on the
/// host context with default no-op bodies and must not block.
pub trait DescHandler: Send + Sync {
    /// Called before the stored value is returned for a fresh read, giving
    /// the application a chance to update it.
    fn on_read(&self, dsc: &Descriptor, conn: &ConnInfo) {
        let _ = (dsc, conn);
    }

    /// Called after a completed write has replaced the stored value.
    fn on_write(&self, dsc: &Descriptor, conn: &ConnInfo) {
        let _ = (dsc, conn);
    }
}

/// Local characteristic descriptor ([Vol 3] Part G, Section 3.3.3).
pub struct Descriptor {
    uuid: Uuid,
    props: Prop,
    val: AttValue,
    hdl: Mutex<Option<Handle>>,
    chr: Mutex<Weak<Characteristic>>,
    state: Mutex<AttState>,
    handler: Mutex<Option<Arc<dyn DescHandler>>>,
    /// Reassembly scratch for in-progress fragmented writes.
    pending: Mutex<Vec<u8>>,
}

impl Descriptor {
    pub(super) fn new(uuid: Uuid, props: Prop, max_len: usize) -> Self {
        Self {
            uuid,
            props,
            val: AttValue::new(max_len),
            hdl: Mutex::new(None),
            chr: Mutex::new(Weak::new()),
            state: Mutex::new(AttState::Active),
            handler: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Returns the descriptor type.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the permission bitmask.
    #[inline]
    #[must_use]
    pub const fn properties(&self) -> Prop {
        self.props
    }

    /// Returns the stack-assigned attribute handle. Fails until the owning
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

    /// Replaces the stored value.
    #[inline]
    pub fn set_value(&self, v: &[u8]) -> Result<()> {
        Ok(self.val.set(v)?)
    }

    /// Returns the owning characteristic, if it still exists.
    #[inline]
    #[must_use]
    pub fn characteristic(&self) -> Option<Arc<Characteristic>> {
        self.chr.lock().upgrade()
    }

    /// Registers the access handler.
    #[inline]
    pub fn set_handler(&self, h: Arc<dyn DescHandler>) {
        *self.handler.lock() = Some(h);
    }

    #[inline]
    pub(super) fn set_chr(&self, chr: Weak<Characteristic>) {
        *self.chr.lock() = chr;
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

    /// Handles a peer access request from the registered table.
    pub(super) fn access(&self, stack: &Arc<dyn Stack>, req: AccessReq) -> IoResult {
        let ci = (stack.connection(req.conn_handle())).ok_or(ErrorCode::UnlikelyError)?;
        match req {
            AccessReq::Read(r) => {
                self.props.test(Access::Read, ci.sec)?;
                super::read_access(&self.val, &ci, r, |ci| {
                    if let Some(h) = self.handler.lock().clone() {
                        h.on_read(self, ci);
                    }
                })
            }
            AccessReq::Write(w) => {
                self.props.test(Access::Write, ci.sec)?;
                trace!("Descriptor {} write of {} bytes", self.uuid, w.value().len());
                super::write_access(&self.val, &self.pending, w)?;
                if w.is_complete() {
                    if let Some(h) = self.handler.lock().clone() {
                        h.on_write(self, &ci);
                    }
                }
                Ok(())
            }
        }
    }
}

impl Debug for Descriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(crate::name_of!(Descriptor))
            .field("uuid", &self.uuid)
            .field("props", &self.props)
            .field("hdl", &*self.hdl.lock())
            .finish_non_exhaustive()
    }
}
