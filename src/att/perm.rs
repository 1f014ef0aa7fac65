use super::ErrorCode;

bitflags::bitflags! {
    /// Characteristic/descriptor properties and access permissions
    /// ([Vol 3] Part G, Sections 3.3.1.1 and 3.3.3.1, plus per-operation
    /// security requirements from [Vol 3] Part F, Section 3.2.5).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[must_use]
    #[repr(transparent)]
    pub struct Prop: u16 {
        /// Permits broadcasts of the value.
        const BROADCAST = 0x0001;
        /// Permits reads of the value.
        const READ = 0x0002;
        /// Permits writes of the value without response.
        const WRITE_NR = 0x0004;
        /// Permits writes of the value with response.
        const WRITE = 0x0008;
        /// Permits unacknowledged value notifications.
        const NOTIFY = 0x0010;
        /// Permits acknowledged value indications.
        const INDICATE = 0x0020;
        /// Reads require an encrypted link.
        const READ_ENC = 0x0200;
        /// Reads require an authenticated link.
        const READ_AUTHN = 0x0400;
        /// Reads require an authorized link.
        const READ_AUTHZ = 0x0800;
        /// Writes require an encrypted link.
        const WRITE_ENC = 0x1000;
        /// Writes require an authenticated link.
        const WRITE_AUTHN = 0x2000;
        /// Writes require an authorized link.
        const WRITE_AUTHZ = 0x4000;
    }
}

bitflags::bitflags! {
    /// Security state of an established connection.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[must_use]
    #[repr(transparent)]
    pub struct ConnSec: u8 {
        /// The link is encrypted.
        const ENCRYPTED = 1 << 0;
        /// The link is encrypted with an authenticated (MITM-protected) key.
        const AUTHENTICATED = 1 << 1;
        /// The peer has been authorized by the application.
        const AUTHORIZED = 1 << 2;
    }
}

/// Type of attribute access being performed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

impl Prop {
    /// Returns whether any form of read is permitted.
    #[inline]
    #[must_use]
    pub const fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    /// Returns whether any form of write is permitted.
    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        self.intersects(Self::WRITE.union(Self::WRITE_NR))
    }

    /// Returns whether reads carry a security requirement. Subscriptions to a
    /// protected characteristic trigger a link upgrade using the read flags.
    #[inline]
    #[must_use]
    pub const fn read_secure(self) -> bool {
        self.intersects(
            Self::READ_ENC
                .union(Self::READ_AUTHN)
                .union(Self::READ_AUTHZ),
        )
    }

    /// Returns the low property byte used in the characteristic declaration
    /// value ([Vol 3] Part G, Section 3.3.1.1).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn wire_props(self) -> u8 {
        (self.bits() & 0x00FF) as u8
    }

    /// Tests whether an access of the given type should be allowed over a
    /// connection with the given security state. Failure order matches
    /// ATT_READ_REQ ([Vol 3] Part F, Section 3.4.4.3): authorization, then
    /// authentication, then encryption.
    pub fn test(self, access: Access, sec: ConnSec) -> Result<(), ErrorCode> {
        let (authz, authn, enc) = match access {
            Access::Read => {
                if !self.readable() {
                    return Err(ErrorCode::ReadNotPermitted);
                }
                (Self::READ_AUTHZ, Self::READ_AUTHN, Self::READ_ENC)
            }
            Access::Write => {
                if !self.writable() {
                    return Err(ErrorCode::WriteNotPermitted);
                }
                (Self::WRITE_AUTHZ, Self::WRITE_AUTHN, Self::WRITE_ENC)
            }
        };
        if self.contains(authz) && !sec.contains(ConnSec::AUTHORIZED) {
            Err(ErrorCode::InsufficientAuthorization)
        } else if self.contains(authn) && !sec.contains(ConnSec::AUTHENTICATED) {
            Err(ErrorCode::InsufficientAuthentication)
        } else if self.contains(enc) && !sec.contains(ConnSec::ENCRYPTED) {
            Err(ErrorCode::InsufficientEncryption)
        } else {
            Ok(())
        }
    }
}
