//! Local GATT server model ([Vol 3] Part G).
//!
//! Services own characteristics, which own descriptors, all via [`Arc`] with
//! [`Weak`] back-references up the tree. Starting the server flattens the
//! tree into a [`TableDef`] that the host stack registers and assigns
//! attribute handles to. Removal is mark-then-compact: attributes are marked
//! while peers may still reference the registered table and physically
//! dropped at the next safe rebuild.
//!
//! [`Arc`]: std::sync::Arc
//! [`Weak`]: std::sync::Weak

use parking_lot::Mutex;

use crate::att::{mtu_payload, AttValue, ErrorCode};
use crate::host::ConnInfo;

pub use {chr::*, desc::*, io::*, server::*, service::*, table::*};

mod chr;
mod desc;
mod io;
mod server;
mod service;
mod table;

/// Shared read path for characteristic and descriptor access callbacks:
/// fires `on_read` for fresh reads and fills the response fragment.
///
/// A read is fresh (not a long-read continuation) when it starts at offset 0
/// or when the whole value fits in a single packet at the connection's MTU.
fn read_access(
    val: &AttValue,
    ci: &ConnInfo,
    r: &mut ReadReq,
    on_read: impl FnOnce(&ConnInfo),
) -> IoResult {
    if r.offset() == 0 || val.len() <= mtu_payload(ci.mtu) {
        on_read(ci);
    }
    r.complete(val.value())
}

/// Shared write path: accumulates fragments in `pending`, bounded by the
/// value's maximum length, and swaps the stored value on the final fragment.
/// Any failure discards the partial write and leaves the stored value
/// unchanged.
fn write_access(val: &AttValue, pending: &Mutex<Vec<u8>>, w: &WriteReq) -> IoResult {
    let mut buf = pending.lock();
    if w.offset() == 0 {
        buf.clear();
    } else if w.offset() != buf.len() {
        buf.clear();
        return Err(ErrorCode::InvalidOffset);
    }
    if buf.len() + w.value().len() > val.max_len() {
        buf.clear();
        return Err(ErrorCode::InvalidAttributeValueLength);
    }
    buf.extend_from_slice(w.value());
    if w.is_complete() {
        let data = std::mem::take(&mut *buf);
        drop(buf);
        val.set(&data)?;
    }
    Ok(())
}

/// Removal state of a local attribute.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum AttState {
    /// Present in the tree and in the registered table.
    #[default]
    Active,
    /// Present in the tree but omitted from the registered table. The
    /// attribute can be re-added later.
    Hidden,
    /// Marked for removal. Dropped from the tree at the next table rebuild.
    PendingDelete,
}

/// Peer subscription state for one characteristic, mirroring the Client
/// Characteristic Configuration descriptor value
/// ([Vol 3] Part G, Section 3.3.3.3).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SubMode {
    pub notify: bool,
    pub indicate: bool,
}

impl SubMode {
    pub const NONE: Self = Self {
        notify: false,
        indicate: false,
    };
    pub const NOTIFY: Self = Self {
        notify: true,
        indicate: false,
    };
    pub const INDICATE: Self = Self {
        notify: false,
        indicate: true,
    };

    /// Returns whether the peer is unsubscribed.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        !self.notify && !self.indicate
    }

    /// Converts a written CCCD value to a subscription state.
    #[inline]
    #[must_use]
    pub const fn from_cccd(v: u16) -> Self {
        Self {
            notify: v & 0x0001 != 0,
            indicate: v & 0x0002 != 0,
        }
    }

    /// Returns the CCCD wire value.
    #[inline]
    #[must_use]
    pub const fn to_cccd(self) -> u16 {
        self.notify as u16 | (self.indicate as u16) << 1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::att::Prop;
    use crate::host::{ConnHandle, Stack};
    use crate::mock::MockStack;
    use crate::uuid::Uuid;

    use super::*;

    const CONN: ConnHandle = ConnHandle::new(1);

    fn one_chr(props: Prop, max_len: usize) -> (Arc<MockStack>, Arc<Characteristic>, AccessFn) {
        let mock = MockStack::new();
        mock.connect(CONN, 23);
        let stack: Arc<dyn Stack> = mock.clone();
        let svc = Arc::new(Service::new(Uuid::U16(0x1815)));
        let chr = svc.create_characteristic(Uuid::U16(0x2A56), props, max_len);
        let def = svc.compile(&stack);
        let access = def.attrs()[1].access().unwrap().clone();
        (mock, chr, access)
    }

    fn write(access: &AccessFn, off: u16, val: &[u8], complete: bool) -> IoResult {
        access.call(AccessReq::Write(&WriteReq::new(CONN, off, val, complete)))
    }

    #[test]
    fn long_write_reassembly() {
        let (_mock, chr, access) = one_chr(Prop::READ | Prop::WRITE, 64);
        write(&access, 0, &[1; 20], false).unwrap();
        write(&access, 20, &[2; 10], true).unwrap();
        let mut want = vec![1_u8; 20];
        want.extend_from_slice(&[2; 10]);
        assert_eq!(chr.value(), want);

        // An offset gap discards the partial write
        write(&access, 0, &[9; 4], false).unwrap();
        assert_eq!(write(&access, 8, &[9; 4], true), Err(ErrorCode::InvalidOffset));
        assert_eq!(chr.value(), want);

        // So does overflowing the value's maximum length
        write(&access, 0, &[0; 60], false).unwrap();
        assert_eq!(
            write(&access, 60, &[0; 10], true),
            Err(ErrorCode::InvalidAttributeValueLength)
        );
        assert_eq!(chr.value(), want);
    }

    #[test]
    fn offset_reads_fire_on_read_once() {
        struct Counter(AtomicUsize);
        impl ChrHandler for Counter {
            fn on_read(&self, _: &Characteristic, _: &ConnInfo) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (_mock, chr, access) = one_chr(Prop::READ, 64);
        chr.set_value(&[7; 50]).unwrap();
        let reads = Arc::new(Counter(AtomicUsize::new(0)));
        chr.set_handler(reads.clone());

        // One long read: a fresh request followed by blob continuations
        for (off, want) in [(0, 20), (20, 20), (40, 10)] {
            let mut r = ReadReq::new(CONN, 23, off);
            access.call(AccessReq::Read(&mut r)).unwrap();
            assert_eq!(r.response().len(), want);
        }
        assert_eq!(reads.0.load(Ordering::SeqCst), 1);

        let mut r = ReadReq::new(CONN, 23, 51);
        assert_eq!(access.call(AccessReq::Read(&mut r)), Err(ErrorCode::InvalidOffset));
    }

    #[test]
    fn access_enforces_permissions() {
        let (mock, chr, access) = one_chr(
            Prop::READ | Prop::READ_ENC | Prop::WRITE | Prop::WRITE_AUTHN,
            8,
        );
        let mut r = ReadReq::new(CONN, 23, 0);
        assert_eq!(
            access.call(AccessReq::Read(&mut r)),
            Err(ErrorCode::InsufficientEncryption)
        );
        assert_eq!(write(&access, 0, &[1], true), Err(ErrorCode::InsufficientAuthentication));

        mock.set_encrypted(CONN);
        access.call(AccessReq::Read(&mut r)).unwrap();
        assert!(chr.value().is_empty());
    }
}
