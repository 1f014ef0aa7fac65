//! Remote GATT model (central role).
//!
//! [`Client`] mirrors a peer server's attribute tree as read-only
//! projections ([`RemoteService`], [`RemoteCharacteristic`],
//! [`RemoteDescriptor`]) populated by discovery, and bridges the
//! application's synchronous calls onto the host stack's asynchronous
//! operations: each call submits an operation with a completion callback,
//! then blocks on an operation record until the terminal status arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::att::{mtu_payload, ErrorCode, Handle};
use crate::host::{ConnHandle, OpData, Stack, Status};
use crate::le::Addr;
use crate::uuid::Uuid;
use crate::{Error, Result};

use bridge::OpRecord;
pub use remote::*;

mod bridge;
mod remote;

/// Application callbacks for client connection state. Methods run on the
/// host context with default no-op bodies and must not block.
pub trait ClientHandler: Send + Sync {
    /// Called when the connection to the peer is established.
    fn on_connect(&self) {}

    /// Called when the connection is terminated with the HCI reason code.
    fn on_disconnect(&self, reason: u8) {
        let _ = reason;
    }
}

/// GATT client for one peer connection.
pub struct Client {
    stack: Arc<dyn Stack>,
    peer: Addr,
    conn: Mutex<Option<ConnHandle>>,
    svcs: Mutex<Vec<Arc<RemoteService>>>,
    /// Set once an unfiltered service discovery has completed.
    fetched: AtomicBool,
    /// Outstanding operation records, completed synthetically on disconnect.
    ops: Mutex<Vec<Weak<OpRecord>>>,
    handler: Mutex<Option<Arc<dyn ClientHandler>>>,
}

impl Client {
    /// Creates a client for the given peer. The connection itself is
    /// established by the host binding, which reports it via
    /// [`Self::attach`].
    #[must_use]
    pub fn new(stack: Arc<dyn Stack>, peer: Addr) -> Arc<Self> {
        Arc::new(Self {
            stack,
            peer,
            conn: Mutex::new(None),
            svcs: Mutex::new(Vec::new()),
            fetched: AtomicBool::new(false),
            ops: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
        })
    }

    /// Returns the peer address.
    #[inline]
    #[must_use]
    pub const fn peer(&self) -> Addr {
        self.peer
    }

    /// Registers the event handler.
    #[inline]
    pub fn set_handler(&self, h: Arc<dyn ClientHandler>) {
        *self.handler.lock() = Some(h);
    }

    /// Returns whether the connection is established.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Returns the connection handle or fails fast when disconnected.
    #[inline]
    pub fn conn_handle(&self) -> Result<ConnHandle> {
        self.conn.lock().ok_or(Error::NotConnected)
    }

    /// Returns the negotiated ATT MTU.
    pub fn mtu(&self) -> Result<u16> {
        let conn = self.conn_handle()?;
        (self.stack.connection(conn)).map_or(Err(Error::NotConnected), |ci| Ok(ci.mtu))
    }

    /// Reports an established connection. Called by the host binding.
    pub fn attach(&self, conn: ConnHandle) {
        debug!("Client for {} attached to {conn}", self.peer);
        *self.conn.lock() = Some(conn);
        if let Some(h) = self.handler() {
            h.on_connect();
        }
    }

    /// Reports connection loss. Every outstanding operation completes with
    /// [`Status::Disconnected`], unblocking its waiter. Called by the host
    /// binding; also invoked internally when the stack reports the loss
    /// through an operation callback.
    pub fn handle_disconnect(&self, reason: u8) {
        debug!("Client for {} disconnected (reason {reason:#04X})", self.peer);
        *self.conn.lock() = None;
        for w in self.ops.lock().drain(..) {
            if let Some(rec) = w.upgrade() {
                rec.complete(Status::Disconnected);
            }
        }
        if let Some(h) = self.handler() {
            h.on_disconnect(reason);
        }
    }

    /// Routes an incoming notification or indication to the cached
    /// characteristic with the given value handle. Called by the host
    /// binding.
    pub fn handle_notify(&self, hdl: Handle, data: &[u8], indicate: bool) {
        let chr = (self.svcs.lock().iter()).find_map(|s| s.cached_characteristic_by_handle(hdl));
        match chr {
            Some(chr) => chr.notified(data, indicate),
            None => trace!("Dropping notification for unknown handle {hdl}"),
        }
    }

    /// Upgrades link security (encryption/pairing), blocking until the
    /// procedure finishes.
    pub fn secure_connection(&self) -> Result<()> {
        let conn = self.conn_handle()?;
        debug!("Initiating security upgrade on {conn}");
        self.stack.initiate_security(conn).map_err(Error::from)
    }

    /// Terminates the connection. Cleanup happens when the binding reports
    /// the disconnect.
    pub fn disconnect(&self) -> Result<()> {
        self.stack.terminate(self.conn_handle()?).map_err(Error::from)
    }

    /// Returns the peer's services, discovering them on first use or when
    /// `refresh` is set.
    pub fn services(self: &Arc<Self>, refresh: bool) -> Result<Vec<Arc<RemoteService>>> {
        if refresh {
            self.delete_services();
        }
        if !self.fetched.load(Ordering::Acquire) {
            self.retrieve_services(None)?;
        }
        Ok(self.svcs.lock().clone())
    }

    /// Returns the peer's service with the given UUID, discovering it if
    /// not cached. A filtered discovery miss is retried once with the
    /// alternate UUID form (16/32-bit vs base-derived 128-bit) since peers
    /// may store either.
    pub fn service(self: &Arc<Self>, uuid: Uuid) -> Result<Option<Arc<RemoteService>>> {
        if let Some(s) = self.cached_service(uuid) {
            return Ok(Some(s));
        }
        self.retrieve_services(Some(uuid))?;
        if let Some(s) = self.cached_service(uuid) {
            return Ok(Some(s));
        }
        if let Some(alt) = uuid.alternate_form() {
            trace!("Service {uuid} not found, retrying as {alt}");
            self.retrieve_services(Some(alt))?;
            if let Some(s) = self.cached_service(alt) {
                return Ok(Some(s));
            }
        }
        Ok(None)
    }

    /// Discovers the peer's complete attribute tree: all services, their
    /// characteristics, and their descriptors.
    pub fn discover_attributes(self: &Arc<Self>) -> Result<()> {
        for svc in self.services(true)? {
            for chr in svc.characteristics(true)? {
                chr.descriptors(true)?;
            }
        }
        Ok(())
    }

    /// Reads the value of the characteristic identified by service and
    /// characteristic UUID.
    pub fn get_value(self: &Arc<Self>, svc: Uuid, chr: Uuid) -> Result<Vec<u8>> {
        let svc = self.service(svc)?.ok_or(Error::NotFound)?;
        let chr = svc.characteristic(chr)?.ok_or(Error::NotFound)?;
        chr.read_value()
    }

    /// Writes the value of the characteristic identified by service and
    /// characteristic UUID.
    pub fn set_value(self: &Arc<Self>, svc: Uuid, chr: Uuid, v: &[u8]) -> Result<()> {
        let svc = self.service(svc)?.ok_or(Error::NotFound)?;
        let chr = svc.characteristic(chr)?.ok_or(Error::NotFound)?;
        chr.write_value(v, true)
    }

    /// Returns the cached characteristic with the given value handle.
    #[must_use]
    pub fn characteristic(&self, hdl: Handle) -> Option<Arc<RemoteCharacteristic>> {
        (self.svcs.lock().iter()).find_map(|s| s.cached_characteristic_by_handle(hdl))
    }

    /// Clears the discovered attribute cache.
    pub fn delete_services(&self) {
        self.svcs.lock().clear();
        self.fetched.store(false, Ordering::Release);
    }

    /// Removes one service from the discovered attribute cache.
    pub fn delete_service(&self, uuid: Uuid) {
        self.svcs.lock().retain(|s| s.uuid() != uuid);
        self.fetched.store(false, Ordering::Release);
    }

    pub(super) fn stack(&self) -> &Arc<dyn Stack> {
        &self.stack
    }

    /// Registers an operation record for synthetic completion on disconnect.
    pub(super) fn register_op(&self, rec: &Arc<OpRecord>) {
        let mut ops = self.ops.lock();
        ops.retain(|w| w.strong_count() > 0);
        ops.push(Arc::downgrade(rec));
    }

    /// Reads attribute `hdl`, assembling long values from fragments.
    ///
    /// Status routing: a peer that rejects blob reads (`AttributeNotLong`)
    /// terminates the read successfully with whatever was already received;
    /// a security failure gets exactly one link upgrade and retry.
    pub(super) fn read_attr(&self, hdl: Handle) -> Result<Vec<u8>> {
        let conn = self.conn_handle()?;
        let mut secured = false;
        loop {
            let rec = OpRecord::new(conn);
            self.register_op(&rec);
            let cb = rec.value_callback();
            self.stack.read_long(conn, hdl, 0, cb)?;
            match rec.wait() {
                Status::Done => return Ok(rec.take_data()),
                Status::Att(ErrorCode::AttributeNotLong) => {
                    trace!("Peer rejects blob reads for {hdl}, keeping the partial value");
                    return Ok(rec.take_data());
                }
                st if st.is_security() && !secured => {
                    self.secure_connection()?;
                    secured = true;
                }
                st => return Err(st.into()),
            }
        }
    }

    /// Writes attribute `hdl`. The write strategy follows the negotiated
    /// MTU: a value that fits one packet uses a flat (or no-response) write,
    /// longer values use the prepare/execute procedure.
    ///
    /// Status routing mirrors [`Self::read_attr`]: `AttributeNotLong` falls
    /// back once to a flat write truncated to the MTU, and a security
    /// failure gets exactly one link upgrade and retry.
    pub(super) fn write_attr(&self, hdl: Handle, val: &[u8], response: bool) -> Result<()> {
        let conn = self.conn_handle()?;
        let fit = mtu_payload(self.mtu()?);
        if !response && val.len() <= fit {
            return self.stack.write_no_rsp(conn, hdl, val).map_err(Error::from);
        }
        let mut truncate = false;
        let mut secured = false;
        loop {
            let rec = OpRecord::new(conn);
            self.register_op(&rec);
            let cb = rec.value_callback();
            if truncate {
                self.stack.write(conn, hdl, &val[..val.len().min(fit)], cb)?;
            } else if val.len() > fit {
                self.stack.write_long(conn, hdl, val, cb)?;
            } else {
                self.stack.write(conn, hdl, val, cb)?;
            }
            match rec.wait() {
                Status::Done => return Ok(()),
                Status::Att(ErrorCode::AttributeNotLong) if !truncate && val.len() > fit => {
                    trace!("Peer rejects long writes for {hdl}, truncating to the MTU");
                    truncate = true;
                }
                st if st.is_security() && !secured => {
                    self.secure_connection()?;
                    secured = true;
                }
                st => return Err(st.into()),
            }
        }
    }

    /// Runs one service discovery and merges the results into the cache.
    fn retrieve_services(self: &Arc<Self>, filter: Option<Uuid>) -> Result<()> {
        let conn = self.conn_handle()?;
        let rec = OpRecord::new(conn);
        self.register_op(&rec);
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&found);
        let cb = rec.item_callback(move |d| {
            if let OpData::Service { uuid, range } = d {
                sink.lock().push((uuid, range));
            }
        });
        self.stack.discover_services(conn, filter, cb)?;
        match rec.wait() {
            Status::Done => {
                let mut svcs = self.svcs.lock();
                for (uuid, range) in found.lock().drain(..) {
                    if svcs.iter().any(|s| s.range() == range) {
                        continue;
                    }
                    trace!("Discovered service {uuid} at {range:?}");
                    svcs.push(RemoteService::new(Arc::downgrade(self), uuid, range));
                }
                if filter.is_none() {
                    self.fetched.store(true, Ordering::Release);
                }
                Ok(())
            }
            st => Err(st.into()),
        }
    }

    fn cached_service(&self, uuid: Uuid) -> Option<Arc<RemoteService>> {
        (self.svcs.lock().iter())
            .find(|s| s.uuid() == uuid)
            .map(Arc::clone)
    }

    fn handler(&self) -> Option<Arc<dyn ClientHandler>> {
        self.handler.lock().clone()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(crate::name_of!(Client))
            .field("peer", &self.peer)
            .field("conn", &*self.conn.lock())
            .field("svcs", &self.svcs.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use matches::assert_matches;

    use crate::att::HandleRange;
    use crate::host::{OpEvent, Status};
    use crate::mock::{MockStack, Op, Reply};

    use super::*;

    const CONN: ConnHandle = ConnHandle::new(1);

    fn hdl(h: u16) -> Handle {
        Handle::new(h).unwrap()
    }

    fn frag(v: &[u8]) -> OpEvent {
        OpEvent::Item(OpData::Fragment(v.to_vec()))
    }

    fn connect() -> (Arc<MockStack>, Arc<Client>) {
        let mock = MockStack::new();
        let client = Client::new(mock.clone(), Addr::default());
        mock.connect(CONN, 23);
        client.attach(CONN);
        (mock, client)
    }

    #[test]
    fn long_read_assembly() {
        let (mock, client) = connect();
        mock.script(Reply::done(vec![frag(&[1; 20]), frag(&[2; 10])]));
        let v = client.read_attr(hdl(5)).unwrap();
        assert_eq!(v[..20], [1; 20]);
        assert_eq!(v[20..], [2; 10]);
        assert_eq!(mock.take_log(), [Op::ReadLong(hdl(5), 0)]);
    }

    #[test]
    fn rejected_blob_read_keeps_partial_value() {
        let (mock, client) = connect();
        mock.script(Reply::Events(vec![
            frag(&[1; 20]),
            OpEvent::Complete(Status::Att(ErrorCode::AttributeNotLong)),
        ]));
        // The first fragment is the whole value; no second request is made
        assert_eq!(client.read_attr(hdl(5)).unwrap(), [1; 20]);
        assert_eq!(mock.take_log(), [Op::ReadLong(hdl(5), 0)]);
    }

    #[test]
    fn security_retry_once() {
        let (mock, client) = connect();
        mock.secure_on_request();
        mock.script(Reply::fail(Status::Att(ErrorCode::InsufficientAuthentication)));
        mock.script(Reply::done(vec![frag(&[9])]));
        assert_eq!(client.read_attr(hdl(5)).unwrap(), [9]);
        assert_eq!(
            mock.take_log(),
            [Op::ReadLong(hdl(5), 0), Op::Security(CONN), Op::ReadLong(hdl(5), 0)]
        );

        // A second security failure is final
        mock.script(Reply::fail(Status::Att(ErrorCode::InsufficientEncryption)));
        mock.script(Reply::fail(Status::Att(ErrorCode::InsufficientEncryption)));
        assert_matches!(
            client.read_attr(hdl(5)),
            Err(Error::Att(ErrorCode::InsufficientEncryption))
        );
        let log = mock.take_log();
        assert_eq!(log.iter().filter(|op| matches!(op, Op::Security(_))).count(), 1);
    }

    #[test]
    fn write_strategy_follows_mtu() {
        let (mock, client) = connect();
        client.write_attr(hdl(5), &[1, 2, 3], false).unwrap();
        mock.script(Reply::done(Vec::new()));
        client.write_attr(hdl(5), &[4, 5], true).unwrap();
        mock.script(Reply::done(Vec::new()));
        client.write_attr(hdl(5), &[6; 50], true).unwrap();
        assert_eq!(
            mock.take_log(),
            [
                Op::WriteNoRsp(hdl(5), vec![1, 2, 3]),
                Op::Write(hdl(5), vec![4, 5]),
                Op::WriteLong(hdl(5), vec![6; 50]),
            ]
        );
    }

    #[test]
    fn long_write_truncation_fallback() {
        let (mock, client) = connect();
        mock.script(Reply::fail(Status::Att(ErrorCode::AttributeNotLong)));
        mock.script(Reply::done(Vec::new()));
        client.write_attr(hdl(5), &[3; 50], true).unwrap();
        assert_eq!(
            mock.take_log(),
            [Op::WriteLong(hdl(5), vec![3; 50]), Op::Write(hdl(5), vec![3; 20])]
        );
    }

    #[test]
    fn submission_failure_is_immediate() {
        let (mock, client) = connect();
        mock.script(Reply::Submit(Status::Busy));
        assert_matches!(client.read_attr(hdl(5)), Err(Error::Stack(Status::Busy)));
    }

    #[test]
    fn disconnect_unblocks_waiters() {
        let (_mock, client) = connect();
        // No scripted reply, so the read blocks until the disconnect
        let reader = Arc::clone(&client);
        let t = std::thread::spawn(move || reader.read_attr(hdl(5)));
        std::thread::sleep(Duration::from_millis(50));
        client.handle_disconnect(0x13);
        assert_matches!(t.join().unwrap(), Err(Error::Disconnected));
        assert!(!client.is_connected());
        assert_matches!(client.read_attr(hdl(5)), Err(Error::NotConnected));
    }

    #[test]
    fn service_lookup_retries_alternate_form() {
        let (mock, client) = connect();
        let uuid = Uuid::U16(0x180D);
        mock.script(Reply::done(Vec::new())); // Peer stores the 128-bit form
        mock.script(Reply::done(vec![OpEvent::Item(OpData::Service {
            uuid: uuid.widen(),
            range: HandleRange::new(hdl(1), hdl(10)),
        })]));
        let svc = client.service(uuid).unwrap().unwrap();
        assert_eq!(svc.uuid(), uuid.widen());
        assert_eq!(
            mock.take_log(),
            [
                Op::DiscoverServices(Some(uuid)),
                Op::DiscoverServices(Some(uuid.widen())),
            ]
        );
        // Found services are cached
        assert!(client.service(uuid.widen()).unwrap().is_some());
        assert!(mock.take_log().is_empty());
    }
}
