use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use structbuf::{Pack, StructBuf};
use tracing::trace;

use crate::att::{AttValue, Handle, HandleRange, Prop, MAX_VAL_LEN};
use crate::host::{OpData, Status};
use crate::uuid::Uuid;
use crate::{Error, Result};

use super::bridge::OpRecord;
use super::Client;

/// Callback invoked on the host context for notifications and indications
/// received for a subscribed characteristic.
pub type NotifyFn = Box<dyn FnMut(&RemoteCharacteristic, &[u8], bool) + Send>;

/// Discovered projection of a service on the peer.
pub struct RemoteService {
    client: Weak<Client>,
    uuid: Uuid,
    range: HandleRange,
    chrs: Mutex<Vec<Arc<RemoteCharacteristic>>>,
    /// Set once an unfiltered characteristic discovery has completed.
    fetched: AtomicBool,
}

impl RemoteService {
    pub(super) fn new(client: Weak<Client>, uuid: Uuid, range: HandleRange) -> Arc<Self> {
        Arc::new(Self {
            client,
            uuid,
            range,
            chrs: Mutex::new(Vec::new()),
            fetched: AtomicBool::new(false),
        })
    }

    /// Returns the service type.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the service's handle range on the peer.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> HandleRange {
        self.range
    }

    /// Returns the owning client.
    pub fn client(&self) -> Result<Arc<Client>> {
        self.client.upgrade().ok_or(Error::NotConnected)
    }

    /// Returns the service's characteristics, discovering them on first use
    /// or when `refresh` is set.
    pub fn characteristics(self: &Arc<Self>, refresh: bool) -> Result<Vec<Arc<RemoteCharacteristic>>> {
        if refresh {
            self.chrs.lock().clear();
            self.fetched.store(false, Ordering::Release);
        }
        if !self.fetched.load(Ordering::Acquire) {
            self.retrieve_characteristics(None)?;
        }
        Ok(self.chrs.lock().clone())
    }

    /// Returns the characteristic with the given UUID, discovering it if
    /// not cached, with one retry using the alternate UUID form.
    pub fn characteristic(self: &Arc<Self>, uuid: Uuid) -> Result<Option<Arc<RemoteCharacteristic>>> {
        if let Some(c) = self.cached_characteristic(uuid) {
            return Ok(Some(c));
        }
        self.retrieve_characteristics(Some(uuid))?;
        if let Some(c) = self.cached_characteristic(uuid) {
            return Ok(Some(c));
        }
        if let Some(alt) = uuid.alternate_form() {
            trace!("Characteristic {uuid} not found, retrying as {alt}");
            self.retrieve_characteristics(Some(alt))?;
            if let Some(c) = self.cached_characteristic(alt) {
                return Ok(Some(c));
            }
        }
        Ok(None)
    }

    /// Runs one characteristic discovery within the service's handle range
    /// and merges the results into the cache. An unfiltered discovery also
    /// back-fills each characteristic's end handle from its successor's
    /// declaration handle; the last one ends at the service's end handle.
    pub(super) fn retrieve_characteristics(self: &Arc<Self>, filter: Option<Uuid>) -> Result<()> {
        let client = self.client()?;
        let conn = client.conn_handle()?;
        let rec = OpRecord::new(conn);
        client.register_op(&rec);
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&found);
        let cb = rec.item_callback(move |d| {
            if let OpData::Characteristic {
                uuid,
                decl,
                value,
                props,
            } = d
            {
                sink.lock().push((uuid, decl, value, props));
            }
        });
        (client.stack()).discover_characteristics(conn, self.range, filter, cb)?;
        match rec.wait() {
            Status::Done => {}
            st => return Err(st.into()),
        }
        let mut chrs = self.chrs.lock();
        for (uuid, decl, value, props) in found.lock().drain(..) {
            if chrs.iter().any(|c| c.val_hdl == value) {
                continue;
            }
            trace!("Discovered characteristic {uuid} at {value}");
            chrs.push(Arc::new(RemoteCharacteristic {
                svc: Arc::downgrade(self),
                client: Weak::clone(&self.client),
                uuid,
                decl,
                val_hdl: value,
                end: Mutex::new(self.range.end()),
                props,
                val: AttValue::new(MAX_VAL_LEN),
                dscs: Mutex::new(Vec::new()),
                fetched: AtomicBool::new(false),
                notify_cb: Mutex::new(None),
            }));
        }
        if filter.is_none() {
            chrs.sort_by_key(|c| c.decl);
            for i in 0..chrs.len() {
                let end = match chrs.get(i + 1) {
                    Some(next) => next.decl.prev().unwrap_or(next.decl),
                    None => self.range.end(),
                };
                *chrs[i].end.lock() = end;
            }
            self.fetched.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub(super) fn cached_characteristic_by_handle(
        &self,
        hdl: Handle,
    ) -> Option<Arc<RemoteCharacteristic>> {
        (self.chrs.lock().iter())
            .find(|c| c.val_hdl == hdl)
            .map(Arc::clone)
    }

    fn cached_characteristic(&self, uuid: Uuid) -> Option<Arc<RemoteCharacteristic>> {
        (self.chrs.lock().iter())
            .find(|c| c.uuid == uuid)
            .map(Arc::clone)
    }
}

impl Debug for RemoteService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(crate::name_of!(RemoteService))
            .field("uuid", &self.uuid)
            .field("range", &self.range)
            .field("chrs", &self.chrs.lock().len())
            .finish_non_exhaustive()
    }
}

/// Discovered projection of a characteristic on the peer. The cached value
/// holds the last read or notified value.
pub struct RemoteCharacteristic {
    svc: Weak<RemoteService>,
    client: Weak<Client>,
    uuid: Uuid,
    decl: Handle,
    val_hdl: Handle,
    /// Last handle belonging to this characteristic. Back-filled after an
    /// unfiltered discovery; until then the owning service's end handle.
    end: Mutex<Handle>,
    props: Prop,
    val: AttValue,
    dscs: Mutex<Vec<Arc<RemoteDescriptor>>>,
    fetched: AtomicBool,
    notify_cb: Mutex<Option<NotifyFn>>,
}

impl RemoteCharacteristic {
    /// Returns the characteristic type.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the value handle.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.val_hdl
    }

    /// Returns the declaration handle.
    #[inline]
    #[must_use]
    pub const fn declaration_handle(&self) -> Handle {
        self.decl
    }

    /// Returns the last handle belonging to this characteristic.
    #[inline]
    #[must_use]
    pub fn end_handle(&self) -> Handle {
        *self.end.lock()
    }

    /// Returns the property bitmask reported by the peer.
    #[inline]
    #[must_use]
    pub const fn properties(&self) -> Prop {
        self.props
    }

    /// Returns the owning service, if it still exists.
    #[inline]
    #[must_use]
    pub fn service(&self) -> Option<Arc<RemoteService>> {
        self.svc.upgrade()
    }

    /// Returns the cached value from the last read or notification.
    #[inline]
    #[must_use]
    pub fn last_value(&self) -> Vec<u8> {
        self.val.value()
    }

    /// Reads the current value from the peer and updates the cache.
    pub fn read_value(&self) -> Result<Vec<u8>> {
        let v = self.client()?.read_attr(self.val_hdl)?;
        self.val.set(&v)?;
        Ok(v)
    }

    /// Writes the value, with (`response == true`) or without a response.
    pub fn write_value(&self, v: &[u8], response: bool) -> Result<()> {
        self.client()?.write_attr(self.val_hdl, v, response)
    }

    /// Returns the descriptors, discovering them on first use or when
    /// `refresh` is set.
    pub fn descriptors(self: &Arc<Self>, refresh: bool) -> Result<Vec<Arc<RemoteDescriptor>>> {
        if refresh {
            self.dscs.lock().clear();
            self.fetched.store(false, Ordering::Release);
        }
        if !self.fetched.load(Ordering::Acquire) {
            self.retrieve_descriptors()?;
        }
        Ok(self.dscs.lock().clone())
    }

    /// Returns the descriptor with the given UUID, discovering descriptors
    /// if not yet cached.
    pub fn descriptor(self: &Arc<Self>, uuid: Uuid) -> Result<Option<Arc<RemoteDescriptor>>> {
        if let Some(d) = self.cached_descriptor(uuid) {
            return Ok(Some(d));
        }
        self.retrieve_descriptors()?;
        Ok(self.cached_descriptor(uuid))
    }

    /// Subscribes to value updates by writing the Client Characteristic
    /// Configuration descriptor: notifications when the characteristic
    /// supports them and `notifications` is set, indications otherwise.
    /// `cb` receives every update until [`Self::unsubscribe`].
    pub fn subscribe(self: &Arc<Self>, notifications: bool, cb: NotifyFn) -> Result<()> {
        let mode = if notifications {
            if !self.props.contains(Prop::NOTIFY) {
                return Err(Error::NotifyDenied);
            }
            0x0001_u16
        } else {
            if !self.props.contains(Prop::INDICATE) {
                return Err(Error::NotifyDenied);
            }
            0x0002_u16
        };
        *self.notify_cb.lock() = Some(cb);
        if let Err(e) = self.write_cccd(mode) {
            *self.notify_cb.lock() = None;
            return Err(e);
        }
        Ok(())
    }

    /// Cancels the subscription and drops the update callback.
    pub fn unsubscribe(self: &Arc<Self>) -> Result<()> {
        *self.notify_cb.lock() = None;
        self.write_cccd(0)
    }

    /// Delivers an incoming notification or indication: updates the cached
    /// value and invokes the subscription callback.
    pub(super) fn notified(self: &Arc<Self>, data: &[u8], indicate: bool) {
        let _ = self.val.set(data);
        let mut cb = self.notify_cb.lock();
        if let Some(f) = cb.as_mut() {
            f(self, data, indicate);
        }
    }

    /// Runs one descriptor discovery between the value handle and the end
    /// handle.
    fn retrieve_descriptors(self: &Arc<Self>) -> Result<()> {
        let end = self.end_handle();
        let Some(start) = self.val_hdl.next().filter(|&s| s <= end) else {
            // No room for descriptors
            self.fetched.store(true, Ordering::Release);
            return Ok(());
        };
        let client = self.client()?;
        let conn = client.conn_handle()?;
        let rec = OpRecord::new(conn);
        client.register_op(&rec);
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&found);
        let cb = rec.item_callback(move |d| {
            if let OpData::Descriptor { uuid, hdl } = d {
                sink.lock().push((uuid, hdl));
            }
        });
        (client.stack()).discover_descriptors(conn, HandleRange::new(start, end), cb)?;
        match rec.wait() {
            Status::Done => {}
            st => return Err(st.into()),
        }
        let mut dscs = self.dscs.lock();
        for (uuid, hdl) in found.lock().drain(..) {
            if dscs.iter().any(|d| d.hdl == hdl) {
                continue;
            }
            trace!("Discovered descriptor {uuid} at {hdl}");
            dscs.push(Arc::new(RemoteDescriptor {
                chr: Arc::downgrade(self),
                client: Weak::clone(&self.client),
                uuid,
                hdl,
            }));
        }
        self.fetched.store(true, Ordering::Release);
        Ok(())
    }

    fn write_cccd(self: &Arc<Self>, mode: u16) -> Result<()> {
        let dsc = (self.descriptor(Uuid::CLIENT_CHR_CONFIG)?).ok_or(Error::NotFound)?;
        let mut b = StructBuf::new(2);
        b.append().u16(mode);
        dsc.write_value(b.as_ref(), true)
    }

    fn cached_descriptor(&self, uuid: Uuid) -> Option<Arc<RemoteDescriptor>> {
        (self.dscs.lock().iter())
            .find(|d| d.uuid == uuid)
            .map(Arc::clone)
    }

    fn client(&self) -> Result<Arc<Client>> {
        self.client.upgrade().ok_or(Error::NotConnected)
    }
}

impl Debug for RemoteCharacteristic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(crate::name_of!(RemoteCharacteristic))
            .field("uuid", &self.uuid)
            .field("hdl", &self.val_hdl)
            .field("end", &*self.end.lock())
            .field("props", &self.props)
            .finish_non_exhaustive()
    }
}

/// Discovered projection of a descriptor on the peer.
pub struct RemoteDescriptor {
    chr: Weak<RemoteCharacteristic>,
    client: Weak<Client>,
    uuid: Uuid,
    hdl: Handle,
}

impl RemoteDescriptor {
    /// Returns the descriptor type.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the attribute handle.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the owning characteristic, if it still exists.
    #[inline]
    #[must_use]
    pub fn characteristic(&self) -> Option<Arc<RemoteCharacteristic>> {
        self.chr.upgrade()
    }

    /// Reads the descriptor value from the peer.
    pub fn read_value(&self) -> Result<Vec<u8>> {
        self.client()?.read_attr(self.hdl)
    }

    /// Writes the descriptor value.
    pub fn write_value(&self, v: &[u8], response: bool) -> Result<()> {
        self.client()?.write_attr(self.hdl, v, response)
    }

    fn client(&self) -> Result<Arc<Client>> {
        self.client.upgrade().ok_or(Error::NotConnected)
    }
}

impl Debug for RemoteDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(crate::name_of!(RemoteDescriptor))
            .field("uuid", &self.uuid)
            .field("hdl", &self.hdl)
            .finish_non_exhaustive()
    }
}
