use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::att::{mtu_payload, Handle, Prop};
use crate::host::{ConnHandle, ConnInfo, PasskeyReply, Stack, Status};
use crate::uuid::Uuid;
use crate::{Error, Result};

use super::{AttState, Characteristic, Service, SubMode};

/// Passkey reported when the application does not override the pairing
/// callbacks.
const DEFAULT_PASSKEY: u32 = 123_456;

/// Set while a [`Server`] instance exists. The registered attribute tables
/// and the host stack's GAP state are process-wide, so a second server would
/// fight the first over them.
static SERVER_EXISTS: AtomicBool = AtomicBool::new(false);

/// Application callbacks for server-wide events. All methods run on the host
/// context with default no-op bodies and must not block.
pub trait ServerHandler: Send + Sync {
    /// Called when a peer connects.
    fn on_connect(&self, conn: &ConnInfo) {
        let _ = conn;
    }

    /// Called when a peer disconnects with the HCI reason code.
    fn on_disconnect(&self, conn: &ConnInfo, reason: u8) {
        let _ = (conn, reason);
    }

    /// Called when the ATT MTU is (re)negotiated.
    fn on_mtu_change(&self, conn: &ConnInfo, mtu: u16) {
        let _ = (conn, mtu);
    }

    /// Called when link encryption is established or pairing completes.
    fn on_authentication_complete(&self, conn: &ConnInfo) {
        let _ = conn;
    }

    /// Returns the passkey to display or enter during pairing.
    fn on_passkey_request(&self) -> u32 {
        DEFAULT_PASSKEY
    }

    /// Confirms a numeric-comparison passkey.
    fn on_confirm_passkey(&self, pin: u32) -> bool {
        let _ = pin;
        true
    }
}

/// GAP/GATT event delivered by the host-stack binding to
/// [`Server::handle_event`], always on the host context.
#[derive(Debug)]
#[non_exhaustive]
pub enum ServerEvent {
    /// Connection attempt finished. A non-[`Status::Done`] status means the
    /// connection failed to establish.
    Connect { conn: ConnHandle, status: Status },
    /// Connection terminated.
    Disconnect { conn: ConnHandle, reason: u8 },
    /// ATT MTU (re)negotiated.
    MtuChange { conn: ConnHandle, mtu: u16 },
    /// Peer rewrote a Client Characteristic Configuration descriptor for the
    /// characteristic with value handle `hdl`.
    Subscribe {
        conn: ConnHandle,
        hdl: Handle,
        sub: SubMode,
    },
    /// Delivery status for a notification or indication. For indications
    /// this is the terminal report: [`Status::Done`] when the peer
    /// confirmed, an error otherwise. Either way the connection's indication
    /// slot is released.
    NotifyTx {
        conn: ConnHandle,
        hdl: Handle,
        indicate: bool,
        status: Status,
    },
    /// Link encryption state changed.
    EncryptionChange { conn: ConnHandle, status: Status },
    /// Pairing requires a passkey to display or enter.
    PasskeyRequest { conn: ConnHandle },
    /// Pairing requires numeric comparison of `pin`.
    PasskeyConfirm { conn: ConnHandle, pin: u32 },
}

/// Per-connection server state. `ind_pending` holds the value handle of the
/// one indication allowed in flight per connection.
#[derive(Debug)]
struct ConnRecord {
    conn: ConnHandle,
    ind_pending: Option<Handle>,
}

/// Local GATT server: owns the service tree, dispatches host events, and
/// gates attribute-table rebuilds on the connection count.
///
/// At most one instance may exist per process.
pub struct Server {
    stack: Arc<dyn Stack>,
    svcs: Mutex<Vec<Arc<Service>>>,
    conns: Mutex<SmallVec<[ConnRecord; 2]>>,
    started: AtomicBool,
    changed: AtomicBool,
    adv_on_disconnect: AtomicBool,
    handler: Mutex<Option<Arc<dyn ServerHandler>>>,
}

impl Server {
    /// Creates the server. Fails with [`Error::ServerExists`] if another
    /// instance is alive.
    pub fn new(stack: Arc<dyn Stack>) -> Result<Arc<Self>> {
        if SERVER_EXISTS.swap(true, Ordering::SeqCst) {
            return Err(Error::ServerExists);
        }
        Ok(Arc::new(Self {
            stack,
            svcs: Mutex::new(Vec::new()),
            conns: Mutex::new(SmallVec::new()),
            started: AtomicBool::new(false),
            changed: AtomicBool::new(false),
            adv_on_disconnect: AtomicBool::new(false),
            handler: Mutex::new(None),
        }))
    }

    /// Registers the event handler.
    #[inline]
    pub fn set_handler(&self, h: Arc<dyn ServerHandler>) {
        *self.handler.lock() = Some(h);
    }

    /// Controls whether advertising restarts automatically after a
    /// disconnect or failed connection attempt.
    #[inline]
    pub fn advertise_on_disconnect(&self, enable: bool) {
        self.adv_on_disconnect.store(enable, Ordering::Relaxed);
    }

    /// Creates a new service owned by this server.
    pub fn create_service(self: &Arc<Self>, uuid: Uuid) -> Arc<Service> {
        let svc = Arc::new(Service::new(uuid));
        svc.set_srv(Arc::downgrade(self));
        self.svcs.lock().push(Arc::clone(&svc));
        if self.is_started() {
            self.service_changed();
        }
        svc
    }

    /// Re-adds a previously removed service.
    pub fn add_service(self: &Arc<Self>, svc: &Arc<Service>) {
        let mut svcs = self.svcs.lock();
        let known = svcs.iter().find(|s| Arc::ptr_eq(s, svc));
        match known.map(|s| s.state()) {
            Some(AttState::Active) => return,
            Some(AttState::Hidden) => {
                svc.set_state(AttState::Active);
                // Hidden services stay registered, so visibility can be
                // flipped without a table rebuild
                if let Ok(h) = svc.handle() {
                    if let Err(e) = self.stack.set_visibility(h, true) {
                        warn!("Failed to unhide service {}: {e}", svc.uuid());
                    }
                }
            }
            Some(AttState::PendingDelete) => svc.set_state(AttState::Active),
            None => {
                svc.set_srv(Arc::downgrade(self));
                svcs.push(Arc::clone(svc));
            }
        }
        drop(svcs);
        self.service_changed();
    }

    /// Removes a service. With `delete == false` the service is only hidden
    /// and can be re-added later; with `delete == true` it is dropped from
    /// the tree at the next safe table rebuild.
    pub fn remove_service(&self, svc: &Arc<Service>, delete: bool) {
        let svcs = self.svcs.lock();
        let Some(known) = svcs.iter().find(|s| Arc::ptr_eq(s, svc)) else {
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
        drop(svcs);
        if st == AttState::Hidden {
            if let Ok(h) = svc.handle() {
                if let Err(e) = self.stack.set_visibility(h, false) {
                    warn!("Failed to hide service {}: {e}", svc.uuid());
                }
            }
        }
        self.service_changed();
    }

    /// Returns the first service with the given UUID.
    #[must_use]
    pub fn service(&self, uuid: Uuid) -> Option<Arc<Service>> {
        (self.svcs.lock().iter())
            .find(|s| s.uuid() == uuid)
            .map(Arc::clone)
    }

    /// Returns all services, including hidden ones.
    #[inline]
    #[must_use]
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.svcs.lock().clone()
    }

    /// Compiles and registers all active services with the host stack.
    /// Attribute handles are assigned here; idempotent once started.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let svcs = self.svcs.lock().clone();
        for svc in svcs.iter().filter(|s| s.is_active()) {
            svc.start(&self.stack)?;
        }
        info!("GATT server started with {} service(s)", svcs.len());
        Ok(())
    }

    /// Returns whether [`Self::start`] has been called.
    #[inline]
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns the number of connected peers.
    #[inline]
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Returns the state of a connected peer.
    #[inline]
    #[must_use]
    pub fn peer_info(&self, conn: ConnHandle) -> Option<ConnInfo> {
        self.stack.connection(conn)
    }

    /// Terminates a connection.
    pub fn disconnect(&self, conn: ConnHandle) -> Result<()> {
        self.stack.terminate(conn).map_err(Error::from)
    }

    /// Sends the characteristic value as a notification to all subscribed
    /// peers, truncated to each connection's MTU. `val` overrides the stored
    /// value without replacing it. Returns the number of peers notified.
    #[inline]
    pub fn notify(&self, chr: &Arc<Characteristic>, val: Option<&[u8]>) -> Result<usize> {
        self.send_update(chr, val, false)
    }

    /// Sends the characteristic value as an indication to all subscribed
    /// peers. At most one indication may be unconfirmed per connection;
    /// a second one fails with [`Error::IndicationPending`].
    #[inline]
    pub fn indicate(&self, chr: &Arc<Characteristic>, val: Option<&[u8]>) -> Result<usize> {
        self.send_update(chr, val, true)
    }

    fn send_update(
        &self,
        chr: &Arc<Characteristic>,
        val: Option<&[u8]>,
        indicate: bool,
    ) -> Result<usize> {
        let props = chr.properties();
        let allowed = if indicate {
            props.contains(Prop::INDICATE)
        } else {
            props.contains(Prop::NOTIFY)
        };
        if !allowed {
            return Err(Error::NotifyDenied);
        }
        let hdl = chr.handle()?;
        let data = val.map_or_else(|| chr.value(), <[u8]>::to_vec);
        let peers: Vec<ConnHandle> = (chr.subscribers().into_iter())
            .filter_map(|(conn, sub)| {
                (if indicate { sub.indicate } else { sub.notify }).then_some(conn)
            })
            .collect();
        let mut sent = 0;
        for conn in peers.iter().copied() {
            if indicate {
                if let Err(e) = self.begin_indication(conn, hdl) {
                    // A busy peer does not abort the broadcast to the rest
                    if peers.len() == 1 {
                        return Err(e);
                    }
                    debug!("Indication for {hdl} on {conn} still unconfirmed, skipping");
                    if let Some(h) = chr.handler() {
                        h.on_status(chr, conn, Status::Busy);
                    }
                    continue;
                }
            }
            if let Some(h) = chr.handler() {
                h.on_notify(chr);
            }
            let mtu = self.stack.connection(conn).map_or(23, |ci| ci.mtu);
            let frame = &data[..data.len().min(mtu_payload(mtu))];
            match self.stack.notify(conn, hdl, frame, indicate) {
                Ok(()) => sent += 1,
                Err(st) => {
                    warn!("Notify submission for {hdl} on {conn} failed: {st}");
                    if indicate {
                        self.end_indication(conn);
                    }
                    if let Some(h) = chr.handler() {
                        h.on_status(chr, conn, st);
                    }
                }
            }
        }
        Ok(sent)
    }

    /// Handles one host event. Must be called from the host context.
    pub fn handle_event(&self, ev: ServerEvent) {
        match ev {
            ServerEvent::Connect { conn, status } => self.handle_connect(conn, status),
            ServerEvent::Disconnect { conn, reason } => self.handle_disconnect(conn, reason),
            ServerEvent::MtuChange { conn, mtu } => {
                debug!("MTU for {conn} is now {mtu}");
                if let Some(ci) = self.stack.connection(conn) {
                    if let Some(h) = self.handler() {
                        h.on_mtu_change(&ci, mtu);
                    }
                }
            }
            ServerEvent::Subscribe { conn, hdl, sub } => self.handle_subscribe(conn, hdl, sub),
            ServerEvent::NotifyTx {
                conn,
                hdl,
                indicate,
                status,
            } => {
                if indicate {
                    self.end_indication(conn);
                }
                if let Some(chr) = self.characteristic_by_handle(hdl) {
                    if let Some(h) = chr.handler() {
                        h.on_status(&chr, conn, status);
                    }
                }
            }
            ServerEvent::EncryptionChange { conn, status } => {
                if status != Status::Done {
                    warn!("Security upgrade on {conn} failed: {status}");
                }
                if let Some(ci) = self.stack.connection(conn) {
                    if let Some(h) = self.handler() {
                        h.on_authentication_complete(&ci);
                    }
                }
            }
            ServerEvent::PasskeyRequest { conn } => {
                let pin = self.handler().map_or(DEFAULT_PASSKEY, |h| h.on_passkey_request());
                if let Err(e) = self.stack.inject_passkey(conn, PasskeyReply::Passkey(pin)) {
                    warn!("Passkey injection on {conn} failed: {e}");
                }
            }
            ServerEvent::PasskeyConfirm { conn, pin } => {
                let ok = self.handler().map_or(true, |h| h.on_confirm_passkey(pin));
                if let Err(e) = self.stack.inject_passkey(conn, PasskeyReply::Confirm(ok)) {
                    warn!("Passkey confirmation on {conn} failed: {e}");
                }
            }
        }
    }

    fn handle_connect(&self, conn: ConnHandle, status: Status) {
        if status != Status::Done {
            warn!("Connection {conn} failed to establish: {status}");
            if self.adv_on_disconnect.load(Ordering::Relaxed) {
                self.stack.start_advertising();
            }
            return;
        }
        debug!("Peer connected on {conn}");
        self.conns.lock().push(ConnRecord {
            conn,
            ind_pending: None,
        });
        if let Some(ci) = self.stack.connection(conn) {
            if let Some(h) = self.handler() {
                h.on_connect(&ci);
            }
        }
    }

    fn handle_disconnect(&self, conn: ConnHandle, reason: u8) {
        debug!("Peer on {conn} disconnected (reason {reason:#04X})");
        let ci = self.stack.connection(conn);
        self.conns.lock().retain(|c| c.conn != conn);
        for svc in self.svcs.lock().iter() {
            for chr in svc.characteristics() {
                chr.remove_subscription(conn);
            }
        }
        if let (Some(ci), Some(h)) = (ci, self.handler()) {
            h.on_disconnect(&ci, reason);
        }
        // A deferred table rebuild becomes safe once the last peer is gone
        self.try_reset();
        if self.adv_on_disconnect.load(Ordering::Relaxed) {
            self.stack.start_advertising();
        }
    }

    fn handle_subscribe(&self, conn: ConnHandle, hdl: Handle, sub: SubMode) {
        let Some(chr) = self.characteristic_by_handle(hdl) else {
            return;
        };
        if !chr.properties().intersects(Prop::NOTIFY | Prop::INDICATE) {
            return;
        }
        let Some(ci) = self.stack.connection(conn) else {
            return;
        };
        if chr.properties().read_secure() && !ci.is_encrypted() {
            if let Err(e) = self.stack.initiate_security(conn) {
                warn!("Security upgrade for subscription on {conn} failed: {e}");
            }
        }
        let prev = chr.set_subscription(conn, sub);
        if prev != sub {
            if let Some(h) = chr.handler() {
                h.on_subscribe(&chr, &ci, sub);
            }
        }
    }

    /// Records a structural change. While peers are connected the rebuild is
    /// deferred and the database-changed signal is raised; otherwise the
    /// tables are rebuilt immediately.
    pub(crate) fn service_changed(&self) {
        if !self.is_started() {
            return;
        }
        self.changed.store(true, Ordering::SeqCst);
        self.stack.signal_changed();
        self.try_reset();
    }

    /// Re-registers all services if a change is pending and no peer is
    /// connected. No-op otherwise, so callers can invoke it freely.
    fn try_reset(&self) {
        if !self.is_started() || !self.conns.lock().is_empty() {
            return;
        }
        if !self.changed.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("Rebuilding attribute tables");
        self.stack.stop_advertising();
        if let Err(e) = self.stack.reset_tables() {
            warn!("Attribute table reset failed: {e}");
            self.changed.store(true, Ordering::SeqCst);
            return;
        }
        let svcs = {
            let mut svcs = self.svcs.lock();
            svcs.retain(|s| s.state() != AttState::PendingDelete);
            svcs.clone()
        };
        for svc in &svcs {
            svc.invalidate();
            if let Err(e) = svc.start(&self.stack) {
                warn!("Service {} re-registration failed: {e}", svc.uuid());
                continue;
            }
            if svc.state() == AttState::Hidden {
                if let Ok(h) = svc.handle() {
                    if let Err(e) = self.stack.set_visibility(h, false) {
                        warn!("Failed to hide service {}: {e}", svc.uuid());
                    }
                }
            }
        }
    }

    /// Returns the characteristic with the given value handle.
    #[must_use]
    pub fn characteristic_by_handle(&self, hdl: Handle) -> Option<Arc<Characteristic>> {
        (self.svcs.lock().iter()).find_map(|s| s.characteristic_by_handle(hdl))
    }

    fn begin_indication(&self, conn: ConnHandle, hdl: Handle) -> Result<()> {
        let mut conns = self.conns.lock();
        let Some(rec) = conns.iter_mut().find(|c| c.conn == conn) else {
            return Err(Error::NotConnected);
        };
        if rec.ind_pending.is_some() {
            return Err(Error::IndicationPending);
        }
        rec.ind_pending = Some(hdl);
        Ok(())
    }

    fn end_indication(&self, conn: ConnHandle) {
        if let Some(rec) = self.conns.lock().iter_mut().find(|c| c.conn == conn) {
            rec.ind_pending = None;
        }
    }

    fn handler(&self) -> Option<Arc<dyn ServerHandler>> {
        self.handler.lock().clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        SERVER_EXISTS.store(false, Ordering::SeqCst);
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(crate::name_of!(Server))
            .field("svcs", &self.svcs.lock().len())
            .field("conns", &self.conns.lock().len())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use crate::mock::{serialize_server_tests, MockStack, Op};
    use crate::uuid::Uuid;

    use super::*;

    const HEART_RATE: Uuid = Uuid::U16(0x180D);
    const HR_MEASUREMENT: Uuid = Uuid::U16(0x2A37);
    const CONN: ConnHandle = ConnHandle::new(1);

    fn server(mock: &Arc<MockStack>) -> Arc<Server> {
        let srv = Server::new(mock.clone()).unwrap();
        let svc = srv.create_service(HEART_RATE);
        svc.create_characteristic(
            HR_MEASUREMENT,
            Prop::READ | Prop::NOTIFY | Prop::INDICATE,
            2,
        );
        srv
    }

    fn connect(mock: &Arc<MockStack>, srv: &Server, conn: ConnHandle) {
        mock.connect(conn, 23);
        srv.handle_event(ServerEvent::Connect {
            conn,
            status: Status::Done,
        });
    }

    #[test]
    fn single_instance() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = Server::new(mock.clone()).unwrap();
        assert_matches!(Server::new(mock.clone()), Err(Error::ServerExists));
        drop(srv);
        assert!(Server::new(mock).is_ok());
    }

    #[test]
    fn start_registers_services() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = server(&mock);
        let extra = srv.create_service(Uuid::U16(0x180F));
        extra.create_characteristic(Uuid::U16(0x2A19), Prop::READ, 1);
        srv.start().unwrap();
        srv.start().unwrap(); // Idempotent

        let reg = mock.registered();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg[0].0, HEART_RATE);
        // Handles are distinct and assigned in registration order
        assert_eq!(u16::from(reg[0].1), 1);
        assert_eq!(u16::from(reg[1].1), 3);
        assert_eq!(u16::from(extra.handle().unwrap()), 3);
    }

    #[test]
    fn notify_and_indicate() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = server(&mock);
        srv.start().unwrap();
        connect(&mock, &srv, CONN);

        let chr = srv.service(HEART_RATE).unwrap().characteristic(HR_MEASUREMENT).unwrap();
        let hdl = chr.handle().unwrap();
        chr.set_value(&[0x00, 72]).unwrap();

        // No update is sent without a subscription
        assert_eq!(srv.notify(&chr, None).unwrap(), 0);
        srv.handle_event(ServerEvent::Subscribe {
            conn: CONN,
            hdl,
            sub: SubMode {
                notify: true,
                indicate: true,
            },
        });
        assert_eq!(chr.subscribed(CONN).to_cccd(), 0x0003);

        assert_eq!(srv.notify(&chr, None).unwrap(), 1);
        assert_eq!(srv.indicate(&chr, Some(&[0x00, 80])).unwrap(), 1);
        // One unconfirmed indication per connection
        assert_matches!(srv.indicate(&chr, None), Err(Error::IndicationPending));
        assert_eq!(srv.notify(&chr, None).unwrap(), 1); // Notifications still flow
        srv.handle_event(ServerEvent::NotifyTx {
            conn: CONN,
            hdl,
            indicate: true,
            status: Status::Done,
        });
        assert_eq!(srv.indicate(&chr, None).unwrap(), 1);

        let sent: Vec<_> = (mock.take_log().into_iter())
            .filter_map(|op| match op {
                Op::Notify(h, v, ind) => Some((h, v, ind)),
                _ => None,
            })
            .collect();
        assert_eq!(sent[0], (hdl, vec![0x00, 72], false));
        assert_eq!(sent[1], (hdl, vec![0x00, 80], true));
        assert_eq!(sent.len(), 4);
    }

    #[test]
    fn failed_indication_releases_slot() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = server(&mock);
        srv.start().unwrap();
        connect(&mock, &srv, CONN);
        let chr = srv.service(HEART_RATE).unwrap().characteristic(HR_MEASUREMENT).unwrap();
        srv.handle_event(ServerEvent::Subscribe {
            conn: CONN,
            hdl: chr.handle().unwrap(),
            sub: SubMode::INDICATE,
        });

        mock.fail_notify(Status::Memory);
        assert_eq!(srv.indicate(&chr, Some(&[1])).unwrap(), 0);
        // The failed submission must not leave the indication pending
        assert_matches!(srv.indicate(&chr, Some(&[2])), Ok(0));
    }

    #[test]
    fn busy_peer_does_not_abort_broadcast() {
        const CONN2: ConnHandle = ConnHandle::new(2);
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = server(&mock);
        srv.start().unwrap();
        connect(&mock, &srv, CONN);
        connect(&mock, &srv, CONN2);
        let chr = srv.service(HEART_RATE).unwrap().characteristic(HR_MEASUREMENT).unwrap();
        let hdl = chr.handle().unwrap();
        for conn in [CONN, CONN2] {
            srv.handle_event(ServerEvent::Subscribe {
                conn,
                hdl,
                sub: SubMode::INDICATE,
            });
        }

        assert_eq!(srv.indicate(&chr, Some(&[1])).unwrap(), 2);
        srv.handle_event(ServerEvent::NotifyTx {
            conn: CONN2,
            hdl,
            indicate: true,
            status: Status::Done,
        });
        // The unconfirmed indication on the first peer only skips that peer
        mock.take_log();
        assert_eq!(srv.indicate(&chr, Some(&[2])).unwrap(), 1);
        assert_eq!(mock.take_log(), [Op::Notify(hdl, vec![2], true)]);
    }

    #[test]
    fn notify_requires_property() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = server(&mock);
        let ro = (srv.service(HEART_RATE).unwrap())
            .create_characteristic(Uuid::U16(0x2A38), Prop::READ, 1);
        srv.start().unwrap();
        assert_matches!(srv.notify(&ro, None), Err(Error::NotifyDenied));
        assert_matches!(srv.indicate(&ro, None), Err(Error::NotifyDenied));
    }

    #[test]
    fn subscribe_initiates_security() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = Server::new(mock.clone()).unwrap();
        let svc = srv.create_service(HEART_RATE);
        let chr = svc.create_characteristic(
            HR_MEASUREMENT,
            Prop::READ | Prop::READ_ENC | Prop::NOTIFY,
            2,
        );
        srv.start().unwrap();
        connect(&mock, &srv, CONN);
        mock.take_log();

        srv.handle_event(ServerEvent::Subscribe {
            conn: CONN,
            hdl: chr.handle().unwrap(),
            sub: SubMode::NOTIFY,
        });
        assert!(mock.take_log().contains(&Op::Security(CONN)));
        assert_eq!(chr.subscribed(CONN), SubMode::NOTIFY);
    }

    #[test]
    fn rebuild_deferred_until_disconnect() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = server(&mock);
        srv.start().unwrap();
        connect(&mock, &srv, CONN);
        mock.take_log();

        // Structural changes while a peer is connected only raise the
        // database-changed signal
        let extra = srv.create_service(Uuid::U16(0x180F));
        extra.create_characteristic(Uuid::U16(0x2A19), Prop::READ, 1);
        let log = mock.take_log();
        assert!(log.contains(&Op::SignalChanged));
        assert!(!log.contains(&Op::ResetTables));
        assert_matches!(extra.handle(), Err(Error::UnassignedHandle));

        mock.drop_conn(CONN);
        srv.handle_event(ServerEvent::Disconnect {
            conn: CONN,
            reason: 0x13,
        });
        assert!(mock.take_log().contains(&Op::ResetTables));
        assert_eq!(mock.registered().len(), 2);
        assert!(extra.handle().is_ok());
    }

    #[test]
    fn removed_service_states() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = server(&mock);
        let extra = srv.create_service(Uuid::U16(0x180F));
        extra.create_characteristic(Uuid::U16(0x2A19), Prop::READ, 1);
        srv.start().unwrap();
        let h = extra.handle().unwrap();

        // Hiding flips visibility without a rebuild while idle tables allow
        // an immediate reset
        srv.remove_service(&extra, false);
        assert!((mock.take_log().iter())
            .any(|op| matches!(*op, Op::SetVisibility(_, false))));
        assert!(srv.service(Uuid::U16(0x180F)).is_some());

        srv.add_service(&extra);
        assert!((mock.take_log().iter())
            .any(|op| matches!(*op, Op::SetVisibility(_, true))));
        let _ = h;

        // Deletion drops the service at the rebuild
        srv.remove_service(&extra, true);
        mock.take_log();
        assert!(srv.service(Uuid::U16(0x180F)).is_none());
        assert_eq!(mock.registered().len(), 1);
    }

    #[test]
    fn disconnect_clears_subscriptions() {
        let _lock = serialize_server_tests();
        let mock = MockStack::new();
        let srv = server(&mock);
        srv.start().unwrap();
        connect(&mock, &srv, CONN);
        let chr = srv.service(HEART_RATE).unwrap().characteristic(HR_MEASUREMENT).unwrap();
        srv.handle_event(ServerEvent::Subscribe {
            conn: CONN,
            hdl: chr.handle().unwrap(),
            sub: SubMode::NOTIFY,
        });
        assert_eq!(srv.connected_count(), 1);
        mock.drop_conn(CONN);
        srv.handle_event(ServerEvent::Disconnect {
            conn: CONN,
            reason: 0x08,
        });
        assert_eq!(srv.connected_count(), 0);
        assert!(chr.subscribed(CONN).is_none());
    }
}
