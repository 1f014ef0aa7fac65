use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use structbuf::StructBuf;

use crate::att::{mtu_payload, ErrorCode};
use crate::host::ConnHandle;
use crate::name_of;

/// Attribute access callback result type.
pub type IoResult = std::result::Result<(), ErrorCode>;

/// Attribute access callback wired into a compiled table entry. The host
/// binding invokes it on the host context for every peer read or write of
/// the entry's attribute.
#[derive(Clone)]
#[repr(transparent)]
pub struct AccessFn(Arc<dyn for<'a> Fn(AccessReq<'a>) -> IoResult + Send + Sync>);

impl AccessFn {
    #[inline(always)]
    pub(super) fn new(f: impl for<'a> Fn(AccessReq<'a>) -> IoResult + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Executes the access request.
    #[inline(always)]
    pub fn call(&self, req: AccessReq) -> IoResult {
        (self.0)(req)
    }
}

impl Debug for AccessFn {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        (f.debug_tuple(name_of!(AccessFn)).field(&Arc::as_ptr(&self.0))).finish()
    }
}

/// Attribute access request.
#[derive(Debug)]
#[non_exhaustive]
pub enum AccessReq<'a> {
    Read(&'a mut ReadReq),
    Write(&'a WriteReq<'a>),
}

impl AccessReq<'_> {
    /// Returns the connection performing the access.
    #[inline]
    #[must_use]
    pub fn conn_handle(&self) -> ConnHandle {
        match self {
            Self::Read(r) => r.conn,
            Self::Write(w) => w.conn,
        }
    }
}

/// Peer read request. The callback fills `buf` with the response fragment;
/// the buffer is sized to the payload that fits one packet at the
/// connection's MTU.
#[derive(Debug)]
pub struct ReadReq {
    pub(super) conn: ConnHandle,
    pub(super) off: u16,
    pub(super) buf: StructBuf,
}

impl ReadReq {
    /// Creates a read request at value offset `off` for a connection with
    /// the given MTU.
    #[inline]
    #[must_use]
    pub fn new(conn: ConnHandle, mtu: u16, off: u16) -> Self {
        Self {
            conn,
            off,
            buf: StructBuf::new(mtu_payload(mtu)),
        }
    }

    /// Returns the value offset.
    #[inline(always)]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.off as _
    }

    /// Provides the complete attribute value with automatic offset and MTU
    /// handling.
    #[inline]
    pub fn complete(&mut self, v: impl AsRef<[u8]>) -> IoResult {
        self.partial((v.as_ref().get(self.offset()..)).ok_or(ErrorCode::InvalidOffset)?)
    }

    /// Provides the attribute value starting at the requested offset. The
    /// value may be truncated to fit within the MTU.
    #[inline]
    pub fn partial(&mut self, v: impl AsRef<[u8]>) -> IoResult {
        let v = v.as_ref();
        self.buf.clear();
        (self.buf).put_at(0, &v[..v.len().min(self.buf.lim())]);
        Ok(())
    }

    /// Returns the response fragment produced by the callback.
    #[inline]
    #[must_use]
    pub fn response(&self) -> &[u8] {
        self.buf.as_ref()
    }
}

/// Peer write request carrying one fragment of the written value. Fragments
/// of a long write arrive in offset order with `complete == false`; the last
/// fragment has `complete == true`. A flat write is a single complete
/// fragment at offset 0.
#[derive(Debug)]
pub struct WriteReq<'a> {
    pub(super) conn: ConnHandle,
    pub(super) off: u16,
    pub(super) val: &'a [u8],
    pub(super) complete: bool,
}

impl<'a> WriteReq<'a> {
    /// Creates a write request.
    #[inline]
    #[must_use]
    pub const fn new(conn: ConnHandle, off: u16, val: &'a [u8], complete: bool) -> Self {
        Self {
            conn,
            off,
            val,
            complete,
        }
    }

    /// Returns the value offset.
    #[inline(always)]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.off as _
    }

    /// Returns the value fragment written at the offset.
    #[inline(always)]
    #[must_use]
    pub const fn value(&self) -> &'a [u8] {
        self.val
    }

    /// Returns whether this fragment finishes the write.
    #[inline(always)]
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.complete
    }
}

impl<'a> AsRef<[u8]> for WriteReq<'a> {
    #[inline(always)]
    fn as_ref(&self) -> &'a [u8] {
        self.val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_truncation() {
        let conn = ConnHandle::new(1);
        let mut r = ReadReq::new(conn, 23, 0);
        r.complete([7u8; 50]).unwrap();
        assert_eq!(r.response(), &[7u8; 20][..]);

        let mut r = ReadReq::new(conn, 23, 48);
        r.complete([7u8; 50]).unwrap();
        assert_eq!(r.response(), &[7u8; 2][..]);

        let mut r = ReadReq::new(conn, 23, 51);
        assert_eq!(r.complete([7u8; 50]), Err(ErrorCode::InvalidOffset));
    }
}
