use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::att::{Handle, Prop};
use crate::host::{Stack, Status};
use crate::uuid::Uuid;
use crate::{Error, Result};

use super::{AccessFn, AttState, Characteristic, Server, TableDef, TableEntry};

/// Local GATT service ([Vol 3] Part G, Section 3.1).
///
/// A service owns its characteristics and caches the compiled [`TableDef`]
/// produced from them. Any structural change invalidates the cache through
/// the server's change flag; the next (re)registration rebuilds it.
pub struct Service {
    uuid: Uuid,
    hdl: Mutex<Option<Handle>>,
    chrs: Mutex<Vec<Arc<Characteristic>>>,
    state: Mutex<AttState>,
    srv: Mutex<Weak<Server>>,
    table: Mutex<Option<Arc<TableDef>>>,
}

impl Service {
    pub(super) fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            hdl: Mutex::new(None),
            chrs: Mutex::new(Vec::new()),
            state: Mutex::new(AttState::Active),
            srv: Mutex::new(Weak::new()),
            table: Mutex::new(None),
        }
    }

    /// Returns the service type.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the stack-assigned declaration handle. Fails until the
    /// service has been started.
    #[inline]
    pub fn handle(&self) -> Result<Handle> {
        self.hdl.lock().ok_or(Error::UnassignedHandle)
    }

    /// Returns the owning server, if it still exists.
    #[inline]
    #[must_use]
    pub fn server(&self) -> Option<Arc<Server>> {
        self.srv.lock().upgrade()
    }

    /// Creates a new characteristic owned by this service. Duplicate UUIDs
    /// are permitted but usually a mistake.
    pub fn create_characteristic(
        self: &Arc<Self>,
        uuid: Uuid,
        props: Prop,
        max_len: usize,
    ) -> Arc<Characteristic> {
        if self.characteristic(uuid).is_some() {
            warn!("Duplicate characteristic {uuid} in service {}", self.uuid);
        }
        let chr = Arc::new(Characteristic::new(uuid, props, max_len));
        chr.set_svc(Arc::downgrade(self));
        self.chrs.lock().push(Arc::clone(&chr));
        self.changed();
        chr
    }

    /// Re-adds a previously removed characteristic.
    pub fn add_characteristic(self: &Arc<Self>, chr: &Arc<Characteristic>) {
        let mut chrs = self.chrs.lock();
        if let Some(known) = chrs.iter().find(|c| Arc::ptr_eq(c, chr)) {
            if !known.is_active() {
                known.set_state(AttState::Active);
                drop(chrs);
                self.changed();
            }
            return;
        }
        chr.set_svc(Arc::downgrade(self));
        chrs.push(Arc::clone(chr));
        drop(chrs);
        self.changed();
    }

    /// Removes a characteristic from the registered table. With
    /// `delete == false` the characteristic is only hidden and can be
    /// re-added later; with `delete == true` it is dropped from the tree at
    /// the next safe table rebuild.
    pub fn remove_characteristic(&self, chr: &Arc<Characteristic>, delete: bool) {
        let chrs = self.chrs.lock();
        let Some(known) = chrs.iter().find(|c| Arc::ptr_eq(c, chr)) else {
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
        drop(chrs);
        self.changed();
    }

    /// Returns the first characteristic with the given UUID.
    #[inline]
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<Arc<Characteristic>> {
        self.characteristic_at(uuid, 0)
    }

    /// Returns the `instance`th characteristic with the given UUID, for
    /// services containing deliberate duplicates.
    #[must_use]
    pub fn characteristic_at(&self, uuid: Uuid, instance: usize) -> Option<Arc<Characteristic>> {
        (self.chrs.lock().iter())
            .filter(|c| c.uuid() == uuid)
            .nth(instance)
            .map(Arc::clone)
    }

    /// Returns the characteristic with the given value handle.
    #[must_use]
    pub fn characteristic_by_handle(&self, hdl: Handle) -> Option<Arc<Characteristic>> {
        (self.chrs.lock().iter())
            .find(|c| c.handle().is_ok_and(|h| h == hdl))
            .map(Arc::clone)
    }

    /// Returns all characteristics, including hidden ones.
    #[inline]
    #[must_use]
    pub fn characteristics(&self) -> Vec<Arc<Characteristic>> {
        self.chrs.lock().clone()
    }

    pub(super) fn set_srv(&self, srv: Weak<Server>) {
        *self.srv.lock() = srv;
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

    /// Drops the cached table so the next [`Self::compile`] rebuilds it.
    #[inline]
    pub(crate) fn invalidate(&self) {
        *self.table.lock() = None;
    }

    /// Propagates a structural change up to the server.
    pub(super) fn changed(&self) {
        self.invalidate();
        if let Some(srv) = self.srv.lock().upgrade() {
            srv.service_changed();
        }
    }

    /// Returns the cached compiled table, rebuilding it if a structural
    /// change invalidated the cache. Rebuilding compacts the tree: children
    /// marked for deletion are dropped, hidden children stay in the tree but
    /// are omitted from the flattened entries.
    pub(crate) fn compile(self: &Arc<Self>, stack: &Arc<dyn Stack>) -> Arc<TableDef> {
        if let Some(t) = self.table.lock().clone() {
            return t;
        }
        let mut chrs = self.chrs.lock();
        chrs.retain(|c| c.state() != AttState::PendingDelete);
        let mut def = TableDef::new();
        def.push(TableEntry::Service { uuid: self.uuid });
        for c in chrs.iter().filter(|c| c.is_active()) {
            c.compact_descriptors();
            let access = {
                let chr = Arc::clone(c);
                let stack = Arc::clone(stack);
                AccessFn::new(move |req| chr.access(&stack, req))
            };
            def.push(TableEntry::Characteristic {
                uuid: c.uuid(),
                props: c.properties(),
                access,
            });
            for d in c.descriptors().into_iter().filter(|d| d.is_active()) {
                let access = {
                    let stack = Arc::clone(stack);
                    let dsc = Arc::clone(&d);
                    AccessFn::new(move |req| dsc.access(&stack, req))
                };
                def.push(TableEntry::Descriptor {
                    uuid: d.uuid(),
                    props: d.properties(),
                    access,
                });
            }
        }
        drop(chrs);
        def.finish();
        let def = Arc::new(def);
        *self.table.lock() = Some(Arc::clone(&def));
        def
    }

    /// Compiles and registers the service with the host stack, then writes
    /// the assigned handles back into the tree. Registration is two-phase;
    /// a failure in either phase leaves nothing registered.
    pub(crate) fn start(self: &Arc<Self>, stack: &Arc<dyn Stack>) -> Result<()> {
        let def = self.compile(stack);
        stack.count_table(&def).map_err(Error::Registration)?;
        let handles = stack.add_table(&def).map_err(Error::Registration)?;
        if handles.len() != def.attr_count() {
            return Err(Error::Registration(Status::Failed));
        }
        let mut it = handles.into_iter();
        if let Some(h) = it.next() {
            *self.hdl.lock() = Some(h);
        }
        for c in self.chrs.lock().iter().filter(|c| c.is_active()) {
            let Some(h) = it.next() else {
                return Err(Error::Registration(Status::Failed));
            };
            c.set_handle(h);
            for d in c.descriptors().into_iter().filter(|d| d.is_active()) {
                let Some(h) = it.next() else {
                    return Err(Error::Registration(Status::Failed));
                };
                d.set_handle(h);
            }
        }
        // The stack's service lookup is authoritative for the declaration
        // handle
        if let Some(h) = stack.find_service(self.uuid) {
            *self.hdl.lock() = Some(h);
        }
        debug!("Service {} registered at {:?}", self.uuid, self.hdl.lock());
        Ok(())
    }
}

impl Debug for Service {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(crate::name_of!(Service))
            .field("uuid", &self.uuid)
            .field("hdl", &*self.hdl.lock())
            .field("chrs", &self.chrs.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use crate::mock::MockStack;
    use crate::uuid::Uuid;

    use super::*;

    fn heart_rate() -> Arc<Service> {
        let svc = Arc::new(Service::new(Uuid::U16(0x180D)));
        let hrm = svc.create_characteristic(
            Uuid::U16(0x2A37),
            Prop::READ | Prop::NOTIFY,
            2,
        );
        hrm.create_descriptor(Uuid::CLIENT_CHR_CONFIG, Prop::READ | Prop::WRITE, 2);
        svc.create_characteristic(Uuid::U16(0x2A38), Prop::READ, 1);
        svc
    }

    #[test]
    fn compile_flattens_and_terminates() {
        let stack: Arc<dyn Stack> = MockStack::new();
        let svc = heart_rate();
        let t = svc.compile(&stack);
        assert_eq!(t.attr_count(), 4);
        assert_matches!(t.entries().last(), Some(TableEntry::End));
        assert_eq!(t.attrs()[0].uuid(), Some(Uuid::U16(0x180D)));
        assert_eq!(t.attrs()[2].uuid(), Some(Uuid::CLIENT_CHR_CONFIG));
    }

    #[test]
    fn compile_is_cached_and_idempotent() {
        let stack: Arc<dyn Stack> = MockStack::new();
        let svc = heart_rate();
        let a = svc.compile(&stack);
        assert!(Arc::ptr_eq(&a, &svc.compile(&stack)));
        svc.invalidate();
        let b = svc.compile(&stack);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(*a, *b);
    }

    #[test]
    fn compile_filters_removed_attributes() {
        let stack: Arc<dyn Stack> = MockStack::new();
        let svc = heart_rate();
        let hrm = svc.characteristic(Uuid::U16(0x2A37)).unwrap();
        svc.remove_characteristic(&hrm, false);
        let t = svc.compile(&stack);
        assert_eq!(t.attr_count(), 2); // Service + 0x2A38
        assert!(svc.characteristics().iter().any(|c| Arc::ptr_eq(c, &hrm)));

        let other = svc.characteristic(Uuid::U16(0x2A38)).unwrap();
        svc.remove_characteristic(&other, true);
        let t = svc.compile(&stack);
        assert_eq!(t.attr_count(), 1);
        // PendingDelete children are dropped from the tree at compile time
        assert!(!svc.characteristics().iter().any(|c| Arc::ptr_eq(c, &other)));
    }

    #[test]
    fn start_assigns_handles_in_table_order() {
        let stack: Arc<dyn Stack> = MockStack::new();
        let svc = heart_rate();
        svc.start(&stack).unwrap();
        assert_eq!(svc.handle().unwrap(), Handle::MIN);
        let hrm = svc.characteristic(Uuid::U16(0x2A37)).unwrap();
        assert_eq!(u16::from(hrm.handle().unwrap()), 2);
        let cccd = hrm.descriptor(Uuid::CLIENT_CHR_CONFIG).unwrap();
        assert_eq!(u16::from(cccd.handle().unwrap()), 3);
        let other = svc.characteristic(Uuid::U16(0x2A38)).unwrap();
        assert_eq!(u16::from(other.handle().unwrap()), 4);
    }

    #[test]
    fn start_fails_without_registering() {
        let mock = MockStack::new();
        mock.fail_count_table(Status::Memory);
        let stack: Arc<dyn Stack> = mock.clone();
        let svc = heart_rate();
        assert_matches!(svc.start(&stack), Err(Error::Registration(Status::Memory)));
        assert_matches!(svc.handle(), Err(Error::UnassignedHandle));
        assert!(mock.registered().is_empty());

        let mock = MockStack::new();
        mock.fail_add_table(Status::Failed);
        let stack: Arc<dyn Stack> = mock.clone();
        let svc = heart_rate();
        assert_matches!(svc.start(&stack), Err(Error::Registration(Status::Failed)));
        assert!(mock.registered().is_empty());
    }
}
