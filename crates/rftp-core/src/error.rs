//! Error types for the RFTP wire codec.

use thiserror::Error;

/// Wire-level encode/decode errors.
///
/// Decoders report these for short or inconsistent datagrams; the carrier
/// drops the datagram and keeps receiving. Encoders report them for values
/// the wire format cannot represent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the field being read
    #[error("datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum bytes the decoder needed
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Message type nibble is not one of the five defined kinds
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// Metadata status byte outside the defined range
    #[error("unknown metadata status: {0}")]
    UnknownStatus(u8),

    /// Offset does not fit the seven-byte wire encoding
    #[error("file offset {0} exceeds the seven-byte wire limit")]
    OffsetTooLarge(u64),

    /// File name longer than the u16 length prefix allows
    #[error("file name of {0} bytes exceeds the wire limit")]
    NameTooLong(usize),

    /// More files in one request than the u16 count field allows
    #[error("too many files in one request: {0}")]
    TooManyFiles(usize),
}
