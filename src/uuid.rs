//! Bluetooth UUIDs in 16, 32, or 128-bit form ([Vol 3] Part B, Section 2.5.1).

use std::fmt::{Debug, Formatter};

/// Bluetooth Base UUID (`00000000-0000-1000-8000-00805F9B34FB`).
const BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Mask of the 32-bit value field within a base-derived 128-bit UUID.
const VAL_MASK: u128 = 0xFFFF_FFFF << 96;

/// Attribute type identifier. The three forms are distinct values; a 16-bit
/// UUID and its 128-bit expansion do not compare equal. Use [`Uuid::widen`]
/// or [`Uuid::narrow`] to convert.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Uuid {
    U16(u16),
    U32(u32),
    U128(u128),
}

impl Uuid {
    /// Client Characteristic Configuration descriptor type
    /// ([Vol 3] Part G, Section 3.3.3.3).
    pub const CLIENT_CHR_CONFIG: Self = Self::U16(0x2902);

    /// Returns the size of the UUID in bits (16, 32, or 128).
    #[inline]
    #[must_use]
    pub const fn bit_size(self) -> u8 {
        match self {
            Self::U16(_) => 16,
            Self::U32(_) => 32,
            Self::U128(_) => 128,
        }
    }

    /// Returns the full 128-bit value, expanding shorter forms via the
    /// Bluetooth Base UUID.
    #[inline]
    #[must_use]
    pub const fn to_u128(self) -> u128 {
        match self {
            Self::U16(v) => BASE | (v as u128) << 96,
            Self::U32(v) => BASE | (v as u128) << 96,
            Self::U128(v) => v,
        }
    }

    /// Converts the UUID to its 128-bit form.
    #[inline]
    #[must_use]
    pub const fn widen(self) -> Self {
        Self::U128(self.to_u128())
    }

    /// Converts a base-derived UUID to its shortest form, or returns `self`
    /// unchanged if the value is not derived from the Bluetooth Base UUID.
    #[must_use]
    pub const fn narrow(self) -> Self {
        let Self::U128(v) = self else { return self };
        if v & !VAL_MASK != BASE {
            return self;
        }
        #[allow(clippy::cast_possible_truncation)]
        let val = (v >> 96) as u32;
        if val <= u16::MAX as u32 {
            Self::U16(val as u16)
        } else {
            Self::U32(val)
        }
    }

    /// Returns the 16-bit value for a 16-bit or narrowable UUID.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> Option<u16> {
        match self.narrow() {
            Self::U16(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the same UUID in the other representable form, used to retry
    /// filtered discovery when a peer stores the alternate form. A 16 or
    /// 32-bit UUID widens to 128 bits; a base-derived 128-bit UUID narrows.
    /// Returns [`None`] when no distinct alternate exists.
    #[must_use]
    pub fn alternate_form(self) -> Option<Self> {
        let alt = match self {
            Self::U16(_) | Self::U32(_) => self.widen(),
            Self::U128(_) => self.narrow(),
        };
        (alt != self).then_some(alt)
    }
}

impl Debug for Uuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::U16(v) => write!(f, "{v:#06X}"),
            Self::U32(v) => write!(f, "{v:#010X}"),
            Self::U128(v) => write!(
                f,
                "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
                (v >> 96) as u32,
                (v >> 80) as u16,
                (v >> 64) as u16,
                (v >> 48) as u16,
                v & 0xFFFF_FFFF_FFFF
            ),
        }
    }
}

crate::impl_display_via_debug! { Uuid }

impl From<u16> for Uuid {
    #[inline]
    fn from(v: u16) -> Self {
        Self::U16(v)
    }
}

impl From<u32> for Uuid {
    #[inline]
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<u128> for Uuid {
    #[inline]
    fn from(v: u128) -> Self {
        Self::U128(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widen_narrow() {
        let u = Uuid::U16(0x2A37);
        let w = u.widen();
        assert_eq!(w, Uuid::U128(0x0000_2A37_0000_1000_8000_0080_5F9B_34FB));
        assert_eq!(w.narrow(), u);
        assert_ne!(w, u);
        assert_eq!(w.as_u16(), Some(0x2A37));

        // Not base-derived, must not narrow
        let v = Uuid::U128(0x1234_5678_0000_1000_8000_0080_5F9B_34FC);
        assert_eq!(v.narrow(), v);
        assert_eq!(v.as_u16(), None);
    }

    #[test]
    fn alternate() {
        let u = Uuid::U16(0x180D);
        let alt = u.alternate_form().unwrap();
        assert_eq!(alt.bit_size(), 128);
        assert_eq!(alt.alternate_form(), Some(u));

        let v = Uuid::U128(0xDEAD_BEEF_0000_0000_0000_0000_0000_0001);
        assert_eq!(v.alternate_form(), None);
    }

    #[test]
    fn display() {
        assert_eq!(Uuid::U16(0x2902).to_string(), "0x2902");
        assert_eq!(
            Uuid::U16(0x180D).widen().to_string(),
            "0000180D-0000-1000-8000-00805F9B34FB"
        );
    }
}
