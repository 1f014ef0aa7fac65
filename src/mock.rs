//! Scripted in-memory host stack for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::att::{ConnSec, Handle, HandleRange};
use crate::gatt::{TableDef, TableEntry};
use crate::host::{
    ClientEvent, ConnHandle, ConnInfo, OpCallback, OpEvent, PasskeyReply, Stack, Status,
    SubmitResult,
};
use crate::le::Addr;
use crate::uuid::Uuid;

/// Serializes tests that create a [`crate::gatt::Server`], which is a
/// process-wide singleton.
static SERIAL: Mutex<()> = Mutex::new(());

pub(crate) fn serialize_server_tests() -> MutexGuard<'static, ()> {
    init_logging();
    SERIAL.lock()
}

/// Enables log output for tests run with `--nocapture`.
pub(crate) fn init_logging() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// One operation submitted to the mock, as recorded in the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Op {
    DiscoverServices(Option<Uuid>),
    DiscoverChrs(HandleRange, Option<Uuid>),
    DiscoverDscs(HandleRange),
    ReadLong(Handle, u16),
    Write(Handle, Vec<u8>),
    WriteLong(Handle, Vec<u8>),
    WriteNoRsp(Handle, Vec<u8>),
    Notify(Handle, Vec<u8>, bool),
    Security(ConnHandle),
    ResetTables,
    SignalChanged,
    SetVisibility(Handle, bool),
    Terminate(ConnHandle),
}

/// Scripted reply for the next submitted client operation.
#[derive(Debug)]
pub(crate) enum Reply {
    /// Submission itself fails.
    Submit(Status),
    /// Submission succeeds and these events fire synchronously.
    Events(Vec<OpEvent>),
}

impl Reply {
    /// Shorthand for an operation that completes immediately.
    pub fn done(items: Vec<OpEvent>) -> Self {
        let mut evs = items;
        evs.push(OpEvent::Complete(Status::Done));
        Self::Events(evs)
    }

    /// Shorthand for an operation that fails after submission.
    pub fn fail(st: Status) -> Self {
        Self::Events(vec![OpEvent::Complete(st)])
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_handle: u16,
    svcs: Vec<(Uuid, Handle)>,
    conns: Vec<ConnInfo>,
    script: VecDeque<Reply>,
    log: Vec<Op>,
    fail_count: Option<Status>,
    fail_add: Option<Status>,
    fail_notify: Option<Status>,
    secure_on_request: bool,
}

/// [`Stack`] implementation that assigns handles sequentially, tracks
/// connections, logs every submitted operation, and answers client
/// operations from a script. Events fire synchronously during submission
/// with the internal lock released, like a stack whose replies are already
/// queued.
#[derive(Debug)]
pub(crate) struct MockStack(Mutex<Inner>);

impl MockStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Inner {
            next_handle: 1,
            ..Inner::default()
        })))
    }

    /// Establishes a connection with the given MTU.
    pub fn connect(&self, conn: ConnHandle, mtu: u16) {
        self.0.lock().conns.push(ConnInfo {
            conn,
            peer: Addr::default(),
            mtu,
            sec: ConnSec::empty(),
            bonded: false,
        });
    }

    /// Drops a connection without going through a disconnect event.
    pub fn drop_conn(&self, conn: ConnHandle) {
        self.0.lock().conns.retain(|ci| ci.conn != conn);
    }

    /// Marks a connection's link as encrypted.
    pub fn set_encrypted(&self, conn: ConnHandle) {
        if let Some(ci) = (self.0.lock().conns.iter_mut()).find(|ci| ci.conn == conn) {
            ci.sec |= ConnSec::ENCRYPTED;
        }
    }

    /// Makes [`Stack::initiate_security`] encrypt the link synchronously.
    pub fn secure_on_request(&self) {
        self.0.lock().secure_on_request = true;
    }

    /// Queues the reply for the next submitted client operation.
    pub fn script(&self, reply: Reply) {
        self.0.lock().script.push_back(reply);
    }

    pub fn fail_count_table(&self, st: Status) {
        self.0.lock().fail_count = Some(st);
    }

    pub fn fail_add_table(&self, st: Status) {
        self.0.lock().fail_add = Some(st);
    }

    pub fn fail_notify(&self, st: Status) {
        self.0.lock().fail_notify = Some(st);
    }

    /// Takes the log of submitted operations.
    pub fn take_log(&self) -> Vec<Op> {
        std::mem::take(&mut self.0.lock().log)
    }

    /// Returns the registered services and their declaration handles.
    pub fn registered(&self) -> Vec<(Uuid, Handle)> {
        self.0.lock().svcs.clone()
    }

    /// Logs the operation and plays back the next scripted reply.
    fn run(&self, conn: ConnHandle, op: Op, cb: Option<OpCallback>) -> SubmitResult {
        let reply = {
            let mut st = self.0.lock();
            st.log.push(op);
            st.script.pop_front()
        };
        match (reply, cb) {
            (Some(Reply::Submit(st)), _) => Err(st),
            (Some(Reply::Events(evs)), Some(mut cb)) => {
                for event in evs {
                    cb(ClientEvent { conn, event });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Stack for MockStack {
    fn count_table(&self, table: &TableDef) -> SubmitResult {
        let _ = table;
        self.0.lock().fail_count.map_or(Ok(()), Err)
    }

    fn add_table(&self, table: &TableDef) -> Result<Vec<Handle>, Status> {
        let mut st = self.0.lock();
        if let Some(e) = st.fail_add {
            return Err(e);
        }
        let mut handles = Vec::with_capacity(table.attr_count());
        for _ in 0..table.attr_count() {
            let h = Handle::new(st.next_handle).ok_or(Status::Memory)?;
            st.next_handle += 1;
            handles.push(h);
        }
        if let (Some(uuid), Some(&h)) = (
            table.attrs().first().and_then(TableEntry::uuid),
            handles.first(),
        ) {
            st.svcs.push((uuid, h));
        }
        Ok(handles)
    }

    fn reset_tables(&self) -> SubmitResult {
        let mut st = self.0.lock();
        st.log.push(Op::ResetTables);
        st.svcs.clear();
        st.next_handle = 1;
        Ok(())
    }

    fn find_service(&self, uuid: Uuid) -> Option<Handle> {
        (self.0.lock().svcs.iter()).find_map(|&(u, h)| (u == uuid).then_some(h))
    }

    fn set_visibility(&self, hdl: Handle, visible: bool) -> SubmitResult {
        self.0.lock().log.push(Op::SetVisibility(hdl, visible));
        Ok(())
    }

    fn signal_changed(&self) {
        self.0.lock().log.push(Op::SignalChanged);
    }

    fn notify(&self, conn: ConnHandle, hdl: Handle, val: &[u8], indicate: bool) -> SubmitResult {
        let _ = conn;
        let mut st = self.0.lock();
        st.log.push(Op::Notify(hdl, val.to_vec(), indicate));
        st.fail_notify.map_or(Ok(()), Err)
    }

    fn connection(&self, conn: ConnHandle) -> Option<ConnInfo> {
        (self.0.lock().conns.iter().copied()).find(|ci| ci.conn == conn)
    }

    fn initiate_security(&self, conn: ConnHandle) -> SubmitResult {
        let mut st = self.0.lock();
        st.log.push(Op::Security(conn));
        if st.secure_on_request {
            if let Some(ci) = st.conns.iter_mut().find(|ci| ci.conn == conn) {
                ci.sec |= ConnSec::ENCRYPTED;
            }
        }
        Ok(())
    }

    fn inject_passkey(&self, conn: ConnHandle, reply: PasskeyReply) -> SubmitResult {
        let _ = (conn, reply);
        Ok(())
    }

    fn terminate(&self, conn: ConnHandle) -> SubmitResult {
        self.0.lock().log.push(Op::Terminate(conn));
        Ok(())
    }

    fn discover_services(
        &self,
        conn: ConnHandle,
        uuid: Option<Uuid>,
        cb: OpCallback,
    ) -> SubmitResult {
        self.run(conn, Op::DiscoverServices(uuid), Some(cb))
    }

    fn discover_characteristics(
        &self,
        conn: ConnHandle,
        range: HandleRange,
        uuid: Option<Uuid>,
        cb: OpCallback,
    ) -> SubmitResult {
        self.run(conn, Op::DiscoverChrs(range, uuid), Some(cb))
    }

    fn discover_descriptors(
        &self,
        conn: ConnHandle,
        range: HandleRange,
        cb: OpCallback,
    ) -> SubmitResult {
        self.run(conn, Op::DiscoverDscs(range), Some(cb))
    }

    fn read_long(
        &self,
        conn: ConnHandle,
        hdl: Handle,
        offset: u16,
        cb: OpCallback,
    ) -> SubmitResult {
        self.run(conn, Op::ReadLong(hdl, offset), Some(cb))
    }

    fn write(&self, conn: ConnHandle, hdl: Handle, val: &[u8], cb: OpCallback) -> SubmitResult {
        self.run(conn, Op::Write(hdl, val.to_vec()), Some(cb))
    }

    fn write_long(
        &self,
        conn: ConnHandle,
        hdl: Handle,
        val: &[u8],
        cb: OpCallback,
    ) -> SubmitResult {
        self.run(conn, Op::WriteLong(hdl, val.to_vec()), Some(cb))
    }

    fn write_no_rsp(&self, conn: ConnHandle, hdl: Handle, val: &[u8]) -> SubmitResult {
        self.run(conn, Op::WriteNoRsp(hdl, val.to_vec()), None)
    }
}
