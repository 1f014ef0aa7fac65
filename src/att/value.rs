use std::fmt::{Debug, Formatter};
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{ErrorCode, MAX_VAL_LEN};

/// Initial buffer capacity for values created without an initial value.
const INIT_CAPACITY: usize = 20;

/// Bounded attribute value buffer.
///
/// The buffer tracks a current length, an allocated capacity, and a fixed
/// maximum length (at most [`MAX_VAL_LEN`]). Capacity grows on demand up to
/// the maximum and never shrinks. All mutation happens under a short internal
/// lock, so a concurrent reader either sees the value from before a mutation
/// or the one after it, never a partially written buffer. Reads return an
/// independent copy.
pub struct AttValue {
    max_len: usize,
    buf: Mutex<Inner>,
}

#[derive(Clone)]
struct Inner {
    data: Vec<u8>,
    time: Option<SystemTime>,
}

impl AttValue {
    /// Creates an empty value with the given maximum length. The maximum is
    /// clamped to `1..=MAX_VAL_LEN`.
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.clamp(1, MAX_VAL_LEN);
        Self {
            max_len,
            buf: Mutex::new(Inner {
                data: Vec::with_capacity(INIT_CAPACITY.min(max_len)),
                time: None,
            }),
        }
    }

    /// Creates a value holding a copy of `v`, truncated to the clamped
    /// maximum length.
    #[must_use]
    pub fn with_value(v: &[u8], max_len: usize) -> Self {
        let this = Self::new(max_len);
        {
            let mut buf = this.buf.lock();
            buf.data.extend_from_slice(&v[..v.len().min(this.max_len)]);
        }
        this
    }

    /// Returns the current value length.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.lock().data.len()
    }

    /// Returns whether the value is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.lock().data.is_empty()
    }

    /// Returns the currently allocated capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.lock().data.capacity()
    }

    /// Returns the maximum value length.
    #[inline]
    #[must_use]
    pub const fn max_len(&self) -> usize {
        self.max_len
    }

    /// Returns an independent copy of the current value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> Vec<u8> {
        self.buf.lock().data.clone()
    }

    /// Returns the time of the last mutation, if any.
    #[inline]
    #[must_use]
    pub fn last_updated(&self) -> Option<SystemTime> {
        self.buf.lock().time
    }

    /// Replaces the value with a copy of `v`. Fails with
    /// [`ErrorCode::InvalidAttributeValueLength`] if `v` exceeds the maximum
    /// length, leaving the stored value unchanged.
    pub fn set(&self, v: &[u8]) -> Result<(), ErrorCode> {
        if v.len() > self.max_len {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        let mut buf = self.buf.lock();
        if v.len() > buf.data.capacity() {
            let additional = v.len() - buf.data.len();
            buf.data.reserve_exact(additional);
        }
        buf.data.clear();
        buf.data.extend_from_slice(v);
        buf.time = Some(SystemTime::now());
        Ok(())
    }

    /// Appends a copy of `v` to the value. Fails with
    /// [`ErrorCode::InvalidAttributeValueLength`] if the result would exceed
    /// the maximum length, leaving the stored value unchanged.
    pub fn append(&self, v: &[u8]) -> Result<(), ErrorCode> {
        let mut buf = self.buf.lock();
        if buf.data.len() + v.len() > self.max_len {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        buf.data.extend_from_slice(v);
        buf.time = Some(SystemTime::now());
        Ok(())
    }
}

impl Clone for AttValue {
    fn clone(&self) -> Self {
        Self {
            max_len: self.max_len,
            buf: Mutex::new(self.buf.lock().clone()),
        }
    }
}

impl PartialEq for AttValue {
    fn eq(&self, other: &Self) -> bool {
        // Locks are taken one at a time to keep lock order irrelevant
        let v = self.value();
        other.buf.lock().data == v
    }
}

impl PartialEq<[u8]> for AttValue {
    fn eq(&self, other: &[u8]) -> bool {
        self.buf.lock().data == other
    }
}

impl Debug for AttValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let buf = self.buf.lock();
        f.debug_struct(crate::name_of!(AttValue))
            .field("len", &buf.data.len())
            .field("max_len", &self.max_len)
            .field("data", &format_args!("{:02X?}", buf.data.as_slice()))
            .finish()
    }
}
