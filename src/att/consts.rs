/// Maximum attribute value length ([Vol 3] Part F, Section 3.2.9).
pub const MAX_VAL_LEN: usize = 512;

/// Number of bytes of a notified or read value that fit into a single packet
/// at MTU `m` (opcode + handle overhead).
#[inline]
#[must_use]
pub const fn mtu_payload(m: u16) -> usize {
    m.saturating_sub(3) as usize
}

/// ATT and Common Profile and Service error codes
/// ([Vol 3] Part F, Section 3.4.1.1 and \[CSS\] Part B, Section 1.2).
///
/// These are the codes returned to the peer by attribute access callbacks and
/// carried in terminal operation statuses on the client side.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    thiserror::Error,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorCode {
    /// The attribute handle given was not valid on this server.
    InvalidHandle = 0x01,
    /// The attribute cannot be read.
    ReadNotPermitted = 0x02,
    /// The attribute cannot be written.
    WriteNotPermitted = 0x03,
    /// The attribute PDU was invalid.
    InvalidPdu = 0x04,
    /// The attribute requires authentication before it can be read or written.
    InsufficientAuthentication = 0x05,
    /// ATT Server does not support the request received from the client.
    RequestNotSupported = 0x06,
    /// Offset specified was past the end of the attribute.
    InvalidOffset = 0x07,
    /// The attribute requires authorization before it can be read or written.
    InsufficientAuthorization = 0x08,
    /// Too many prepare writes have been queued.
    PrepareQueueFull = 0x09,
    /// No attribute found within the given attribute handle range.
    AttributeNotFound = 0x0A,
    /// The attribute cannot be read using the ATT_READ_BLOB_REQ PDU.
    AttributeNotLong = 0x0B,
    /// The Encryption Key Size used for encrypting this link is too short.
    EncryptionKeySizeTooShort = 0x0C,
    /// The attribute value length is invalid for the operation.
    InvalidAttributeValueLength = 0x0D,
    /// The request has encountered an unlikely error and could not be
    /// completed.
    UnlikelyError = 0x0E,
    /// The attribute requires encryption before it can be read or written.
    InsufficientEncryption = 0x0F,
    /// The attribute type is not a supported grouping attribute.
    UnsupportedGroupType = 0x10,
    /// Insufficient Resources to complete the request.
    InsufficientResources = 0x11,
    /// The server requests the client to rediscover the database.
    DatabaseOutOfSync = 0x12,
    /// The attribute parameter value was not allowed.
    ValueNotAllowed = 0x13,
    /// Write operation cannot be fulfilled for reasons other than permissions.
    WriteRequestRejected = 0xFC,
    /// Client Characteristic Configuration descriptor is not configured
    /// according to the requirements of the profile or service.
    CccdImproperlyConfigured = 0xFD,
    /// An operation that has been previously triggered is still in progress.
    ProcedureAlreadyInProgress = 0xFE,
    /// Attribute value is out of range.
    OutOfRange = 0xFF,
}

impl ErrorCode {
    /// Returns whether the error indicates missing link security that a
    /// pairing/encryption upgrade may resolve.
    #[inline]
    #[must_use]
    pub const fn is_security(self) -> bool {
        matches!(
            self,
            Self::InsufficientAuthentication
                | Self::InsufficientAuthorization
                | Self::InsufficientEncryption
        )
    }
}

crate::impl_display_via_debug! { ErrorCode }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code() {
        assert_eq!(u8::from(ErrorCode::AttributeNotLong), 0x0B);
        assert_eq!(
            ErrorCode::try_from(0x0Du8),
            Ok(ErrorCode::InvalidAttributeValueLength)
        );
        assert!(ErrorCode::InsufficientEncryption.is_security());
        assert!(!ErrorCode::AttributeNotFound.is_security());
    }
}
