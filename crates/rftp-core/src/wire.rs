//! Wire encoding and decoding for the RFTP protocol.
//!
//! All multi-byte fields are big-endian (network byte order). Every
//! datagram starts with a three-byte header (version and message type
//! packed into one byte, the echoed ack number, an option count)
//! followed by the options and the message body.
//!
//! File offsets are counted in chunks and travel as the low seven bytes
//! of their big-endian u64 representation; the encoder rejects anything
//! above [`crate::MAX_WIRE_OFFSET`].

use bytes::Bytes;

use crate::error::WireError;
use crate::{MAX_WIRE_OFFSET, PROTOCOL_VERSION};

/// Message kinds, carried in the low nibble of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks for a list of files
    Request = 0,
    /// Server describes one file (size, status, checksum)
    Metadata = 1,
    /// Server delivers one chunk of file content
    Payload = 2,
    /// Client acknowledges progress and requests resends
    Ack = 3,
    /// Either side tears the connection down
    Close = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Metadata),
            2 => Ok(Self::Payload),
            3 => Ok(Self::Ack),
            4 => Ok(Self::Close),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Per-file result the server announces in a metadata message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FileStatus {
    /// File is readable and will be streamed
    #[default]
    Ok = 0,
    /// No file of the requested name
    NotExistent = 1,
    /// File exists but has no content
    Empty = 2,
    /// File exists but may not be read
    AccessDenied = 3,
}

impl TryFrom<u8> for FileStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::NotExistent),
            2 => Ok(Self::Empty),
            3 => Ok(Self::AccessDenied),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "no error"),
            Self::NotExistent => write!(f, "file does not exist"),
            Self::Empty => write!(f, "file is empty"),
            Self::AccessDenied => write!(f, "access denied"),
        }
    }
}

/// A type-length-value header option. Unknown types are skipped by readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireOption {
    /// Option type tag
    pub kind: u8,
    /// Opaque option value, at most 255 bytes
    pub value: Vec<u8>,
}

impl WireOption {
    fn parse(data: &[u8]) -> Result<(Self, usize), WireError> {
        need(data, 2)?;
        let len = data[1] as usize;
        need(data, 2 + len)?;
        Ok((
            Self {
                kind: data[0],
                value: data[2..2 + len].to_vec(),
            },
            2 + len,
        ))
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind);
        buf.push(self.value.len() as u8);
        buf.extend_from_slice(&self.value);
    }
}

/// The three-byte datagram header plus its options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (high nibble of the first byte)
    pub version: u8,
    /// Message kind (low nibble of the first byte)
    pub msg_type: MessageType,
    /// Ack number this side is echoing back; 0 means "not set"
    pub ack_num: u8,
    /// Header options
    pub options: Vec<WireOption>,
}

impl Header {
    /// Parse a header from the front of a datagram.
    ///
    /// Returns the header and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] when the datagram ends inside the
    /// header and [`WireError::UnknownMessageType`] for an undefined type
    /// nibble.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), WireError> {
        need(data, 3)?;
        let version = data[0] >> 4;
        let msg_type = MessageType::try_from(data[0] & 0x0F)?;
        let ack_num = data[1];
        let option_len = data[2] as usize;

        let mut options = Vec::with_capacity(option_len);
        let mut at = 3;
        for _ in 0..option_len {
            let (option, used) = WireOption::parse(&data[at..])?;
            options.push(option);
            at += used;
        }

        Ok((
            Self {
                version,
                msg_type,
                ack_num,
                options,
            },
            at,
        ))
    }

    /// Append the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.version << 4 | self.msg_type as u8);
        buf.push(self.ack_num);
        buf.push(self.options.len() as u8);
        for option in &self.options {
            option.encode_into(buf);
        }
    }
}

/// One requested file: where to start (in chunks) and its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// First chunk the client wants, usually 0
    pub offset: u64,
    /// File name as the server's file source understands it
    pub name: String,
}

/// REQUEST body: the client's shopping list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    /// Receiver-advertised per-window packet cap; 0 means uncapped
    pub max_transmission_rate: u32,
    /// Requested files; list position is the file index on the wire
    pub files: Vec<FileDescriptor>,
}

impl Request {
    /// Decode a REQUEST body.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] when the body ends inside a field.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        need(data, 6)?;
        let max_transmission_rate = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let num_files = u16::from_be_bytes([data[4], data[5]]) as usize;

        let mut files = Vec::with_capacity(num_files);
        let mut rest = &data[6..];
        for _ in 0..num_files {
            need(rest, 9)?;
            let offset = offset_from_wire(&rest[..7]);
            let name_len = u16::from_be_bytes([rest[7], rest[8]]) as usize;
            need(rest, 9 + name_len)?;
            let name = String::from_utf8_lossy(&rest[9..9 + name_len]).into_owned();
            files.push(FileDescriptor { offset, name });
            rest = &rest[9 + name_len..];
        }

        Ok(Self {
            max_transmission_rate,
            files,
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        if self.files.len() > u16::MAX as usize {
            return Err(WireError::TooManyFiles(self.files.len()));
        }
        buf.extend_from_slice(&self.max_transmission_rate.to_be_bytes());
        buf.extend_from_slice(&(self.files.len() as u16).to_be_bytes());
        for file in &self.files {
            put_wire_offset(buf, file.offset)?;
            if file.name.len() > u16::MAX as usize {
                return Err(WireError::NameTooLong(file.name.len()));
            }
            buf.extend_from_slice(&(file.name.len() as u16).to_be_bytes());
            buf.extend_from_slice(file.name.as_bytes());
        }
        Ok(())
    }
}

/// METADATA body: one file's size, status, and checksum
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    /// Echoed ack number, carried in the header rather than the body
    pub ack_number: u8,
    /// Whether the file can be served
    pub status: FileStatus,
    /// Position of the file in the request
    pub file_index: u16,
    /// Total file size in bytes
    pub size: u64,
    /// MD5 digest of the streamed bytes
    pub checksum: [u8; 16],
}

impl Metadata {
    /// Decode a METADATA body. The echoed ack number lives in the header;
    /// callers stamp it afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] for truncated bodies and
    /// [`WireError::UnknownStatus`] for an undefined status byte.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        need(data, 28)?;
        let status = FileStatus::try_from(data[1])?;
        let file_index = u16::from_be_bytes([data[2], data[3]]);
        let size = u64::from_be_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&data[12..28]);
        Ok(Self {
            ack_number: 0,
            status,
            file_index,
            size,
            checksum,
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(0); // reserved
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.file_index.to_be_bytes());
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.checksum);
    }
}

/// PAYLOAD body: one chunk of file content
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    /// Echoed ack number, carried in the header rather than the body
    pub ack_number: u8,
    /// Position of the file in the request
    pub file_index: u16,
    /// Chunk offset within the file
    pub offset: u64,
    /// Chunk content, at most [`crate::CHUNK_SIZE`] bytes
    pub data: Bytes,
}

impl Payload {
    /// Decode a PAYLOAD body. The echoed ack number lives in the header;
    /// callers stamp it afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] for truncated bodies.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        need(data, 9)?;
        Ok(Self {
            ack_number: 0,
            file_index: u16::from_be_bytes([data[0], data[1]]),
            offset: offset_from_wire(&data[2..9]),
            data: Bytes::copy_from_slice(&data[9..]),
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.extend_from_slice(&self.file_index.to_be_bytes());
        put_wire_offset(buf, self.offset)?;
        buf.extend_from_slice(&self.data);
        Ok(())
    }
}

/// One retransmission request inside an ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendEntry {
    /// Position of the file in the request
    pub file_index: u16,
    /// First missing chunk offset
    pub offset: u64,
    /// Number of contiguous missing chunks; 0 requests the metadata instead
    pub length: u8,
}

/// ACK body: progress confirmation plus resend requests
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ack {
    /// Cyclic ack identifier 1..=254; travels in the header
    pub ack_number: u8,
    /// File whose progress is confirmed
    pub file_index: u16,
    /// Status bits; bit 0 flags missing metadata for `file_index`
    pub status: u8,
    /// Receiver-advertised per-window packet cap; 0 means uncapped
    pub max_transmission_rate: u32,
    /// Next chunk offset the receiver expects for `file_index`
    pub offset: u64,
    /// Missing-chunk runs the receiver wants again
    pub resend_entries: Vec<ResendEntry>,
}

impl Ack {
    /// Decode an ACK body. The ack number lives in the header; callers
    /// stamp it afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] for truncated bodies.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        need(data, 14)?;
        let file_index = u16::from_be_bytes([data[0], data[1]]);
        let status = data[2];
        let max_transmission_rate = u32::from_be_bytes([data[3], data[4], data[5], data[6]]);
        let offset = offset_from_wire(&data[7..14]);

        let mut resend_entries = Vec::new();
        let mut rest = &data[14..];
        while rest.len() >= 10 {
            resend_entries.push(ResendEntry {
                file_index: u16::from_be_bytes([rest[0], rest[1]]),
                offset: offset_from_wire(&rest[2..9]),
                length: rest[9],
            });
            rest = &rest[10..];
        }

        Ok(Self {
            ack_number: 0,
            file_index,
            status,
            max_transmission_rate,
            offset,
            resend_entries,
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.extend_from_slice(&self.file_index.to_be_bytes());
        buf.push(self.status);
        buf.extend_from_slice(&self.max_transmission_rate.to_be_bytes());
        put_wire_offset(buf, self.offset)?;
        for entry in &self.resend_entries {
            buf.extend_from_slice(&entry.file_index.to_be_bytes());
            put_wire_offset(buf, entry.offset)?;
            buf.push(entry.length);
        }
        Ok(())
    }
}

/// CLOSE body: connection teardown with a reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Close {
    /// Reason for the teardown
    pub reason: u16,
}

impl Close {
    /// Decode a CLOSE body.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] for truncated bodies.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        need(data, 2)?;
        Ok(Self {
            reason: u16::from_be_bytes([data[0], data[1]]),
        })
    }

    fn encode_into(self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.reason.to_be_bytes());
    }
}

/// Any protocol message, ready to serialize into one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client file request
    Request(Request),
    /// Server file description
    Metadata(Metadata),
    /// Server file chunk
    Payload(Payload),
    /// Client acknowledgement
    Ack(Ack),
    /// Teardown
    Close(Close),
}

impl Message {
    /// The wire type of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::Metadata(_) => MessageType::Metadata,
            Self::Payload(_) => MessageType::Payload,
            Self::Ack(_) => MessageType::Ack,
            Self::Close(_) => MessageType::Close,
        }
    }

    /// The ack number this message carries in its header: an ACK's own
    /// number, or the number a server message echoes back.
    #[must_use]
    pub fn header_ack(&self) -> u8 {
        match self {
            Self::Ack(ack) => ack.ack_number,
            Self::Metadata(md) => md.ack_number,
            Self::Payload(pl) => pl.ack_number,
            Self::Request(_) | Self::Close(_) => 0,
        }
    }

    /// Serialize header and body into one datagram.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::OffsetTooLarge`] for offsets beyond the
    /// seven-byte limit and [`WireError::NameTooLong`] /
    /// [`WireError::TooManyFiles`] for requests the format cannot carry.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(64);
        Header {
            version: PROTOCOL_VERSION,
            msg_type: self.message_type(),
            ack_num: self.header_ack(),
            options: Vec::new(),
        }
        .encode_into(&mut buf);

        match self {
            Self::Request(request) => request.encode_into(&mut buf)?,
            Self::Metadata(metadata) => metadata.encode_into(&mut buf),
            Self::Payload(payload) => payload.encode_into(&mut buf)?,
            Self::Ack(ack) => ack.encode_into(&mut buf)?,
            Self::Close(close) => close.encode_into(&mut buf),
        }

        Ok(buf)
    }

    /// Parse one full datagram, header included. Messages that carry an
    /// ack number get it stamped from the header.
    ///
    /// # Errors
    ///
    /// Propagates header and body decode errors.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let (header, header_len) = Header::parse(datagram)?;
        let body = &datagram[header_len..];
        Ok(match header.msg_type {
            MessageType::Request => Self::Request(Request::decode(body)?),
            MessageType::Metadata => {
                let mut metadata = Metadata::decode(body)?;
                metadata.ack_number = header.ack_num;
                Self::Metadata(metadata)
            }
            MessageType::Payload => {
                let mut payload = Payload::decode(body)?;
                payload.ack_number = header.ack_num;
                Self::Payload(payload)
            }
            MessageType::Ack => {
                let mut ack = Ack::decode(body)?;
                ack.ack_number = header.ack_num;
                Self::Ack(ack)
            }
            MessageType::Close => Self::Close(Close::decode(body)?),
        })
    }
}

fn need(data: &[u8], len: usize) -> Result<(), WireError> {
    if data.len() < len {
        return Err(WireError::TooShort {
            expected: len,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Append the low seven bytes of the big-endian offset.
fn put_wire_offset(buf: &mut Vec<u8>, offset: u64) -> Result<(), WireError> {
    if offset > MAX_WIRE_OFFSET {
        return Err(WireError::OffsetTooLarge(offset));
    }
    buf.extend_from_slice(&offset.to_be_bytes()[1..]);
    Ok(())
}

/// Zero-pad seven wire bytes back into a u64.
fn offset_from_wire(seven: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[1..].copy_from_slice(seven);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let encoded = message.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(message, decoded);
        // a re-encode must be byte-identical
        assert_eq!(encoded, decoded.encode().unwrap());
        decoded
    }

    #[test]
    fn request_roundtrip_empty() {
        roundtrip(Message::Request(Request::default()));
    }

    #[test]
    fn request_roundtrip_files() {
        roundtrip(Message::Request(Request {
            max_transmission_rate: 0,
            files: vec![
                FileDescriptor {
                    offset: 5,
                    name: "path1".into(),
                },
                FileDescriptor {
                    offset: 10,
                    name: "path2".into(),
                },
            ],
        }));
    }

    #[test]
    fn request_roundtrip_odd_names() {
        roundtrip(Message::Request(Request {
            max_transmission_rate: 0,
            files: vec![
                FileDescriptor {
                    offset: 5,
                    name: "path 1".into(),
                },
                FileDescriptor {
                    offset: 10,
                    name: "path \n2".into(),
                },
            ],
        }));
    }

    #[test]
    fn metadata_roundtrip() {
        let mut checksum = [0u8; 16];
        checksum.copy_from_slice(&b"846e302501dfdab6"[..]);
        roundtrip(Message::Metadata(Metadata {
            ack_number: 3,
            status: FileStatus::Ok,
            file_index: 2,
            size: 3,
            checksum,
        }));
    }

    #[test]
    fn metadata_status_decode() {
        for (byte, status) in [
            (1, FileStatus::NotExistent),
            (2, FileStatus::Empty),
            (3, FileStatus::AccessDenied),
        ] {
            let encoded = Message::Metadata(Metadata {
                status: FileStatus::try_from(byte).unwrap(),
                ..Metadata::default()
            })
            .encode()
            .unwrap();
            match Message::decode(&encoded).unwrap() {
                Message::Metadata(md) => assert_eq!(md.status, status),
                other => panic!("decoded {other:?}"),
            }
        }
        assert_eq!(FileStatus::try_from(4), Err(WireError::UnknownStatus(4)));
    }

    #[test]
    fn payload_roundtrip() {
        roundtrip(Message::Payload(Payload {
            ack_number: 0,
            file_index: 0,
            offset: 0,
            data: Bytes::new(),
        }));
        roundtrip(Message::Payload(Payload {
            ack_number: 7,
            file_index: 1,
            offset: 99,
            data: Bytes::from_static(b"some data"),
        }));
    }

    #[test]
    fn ack_roundtrip() {
        roundtrip(Message::Ack(Ack::default()));
        roundtrip(Message::Ack(Ack {
            ack_number: 1,
            file_index: 0,
            status: 0,
            max_transmission_rate: 0,
            offset: 2,
            resend_entries: vec![
                ResendEntry {
                    file_index: 0,
                    offset: 1,
                    length: 2,
                },
                ResendEntry {
                    file_index: 1,
                    offset: 40,
                    length: 0,
                },
                ResendEntry {
                    file_index: 1,
                    offset: 77,
                    length: 255,
                },
            ],
        }));
    }

    #[test]
    fn close_roundtrip() {
        roundtrip(Message::Close(Close { reason: 2 }));
    }

    #[test]
    fn offset_boundary() {
        let fits = Message::Payload(Payload {
            offset: MAX_WIRE_OFFSET,
            ..Payload::default()
        });
        let encoded = fits.encode().unwrap();
        match Message::decode(&encoded).unwrap() {
            Message::Payload(pl) => assert_eq!(pl.offset, MAX_WIRE_OFFSET),
            other => panic!("decoded {other:?}"),
        }

        let too_big = Message::Payload(Payload {
            offset: MAX_WIRE_OFFSET + 1,
            ..Payload::default()
        });
        assert_eq!(
            too_big.encode(),
            Err(WireError::OffsetTooLarge(MAX_WIRE_OFFSET + 1))
        );
    }

    #[test]
    fn unknown_message_type_rejected() {
        // header type nibble 0x5 is undefined
        let datagram = [0x05u8, 0, 0];
        assert_eq!(
            Message::decode(&datagram),
            Err(WireError::UnknownMessageType(5))
        );
    }

    #[test]
    fn short_inputs_rejected() {
        assert!(matches!(
            Message::decode(&[]),
            Err(WireError::TooShort { .. })
        ));
        // valid header, truncated metadata body
        let datagram = [0x01u8, 0, 0, 0, 0];
        assert!(matches!(
            Message::decode(&datagram),
            Err(WireError::TooShort { .. })
        ));
        // ack body shorter than its fixed part
        let datagram = [0x03u8, 1, 0, 0, 0, 0];
        assert!(matches!(
            Message::decode(&datagram),
            Err(WireError::TooShort { .. })
        ));
    }

    #[test]
    fn request_truncated_name_rejected() {
        let request = Message::Request(Request {
            max_transmission_rate: 9,
            files: vec![FileDescriptor {
                offset: 0,
                name: "abcdef".into(),
            }],
        });
        let encoded = request.encode().unwrap();
        assert!(matches!(
            Message::decode(&encoded[..encoded.len() - 2]),
            Err(WireError::TooShort { .. })
        ));
    }

    #[test]
    fn header_options_skipped() {
        let mut buf = Vec::new();
        Header {
            version: 0,
            msg_type: MessageType::Close,
            ack_num: 0,
            options: vec![
                WireOption {
                    kind: 0,
                    value: vec![1, 2, 3, 4, 5],
                },
                WireOption {
                    kind: 1,
                    value: vec![],
                },
            ],
        }
        .encode_into(&mut buf);
        Close { reason: 7 }.encode_into(&mut buf);

        match Message::decode(&buf).unwrap() {
            Message::Close(close) => assert_eq!(close.reason, 7),
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn ack_trailing_partial_entry_ignored() {
        let mut encoded = Message::Ack(Ack {
            ack_number: 9,
            resend_entries: vec![ResendEntry {
                file_index: 0,
                offset: 4,
                length: 1,
            }],
            ..Ack::default()
        })
        .encode()
        .unwrap();
        encoded.extend_from_slice(&[0, 0, 0]); // not a full ten-byte entry
        match Message::decode(&encoded).unwrap() {
            Message::Ack(ack) => assert_eq!(ack.resend_entries.len(), 1),
            other => panic!("decoded {other:?}"),
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..2048)) {
                let _ = Message::decode(&data);
            }

            #[test]
            fn payload_roundtrip_preserves(
                file_index in any::<u16>(),
                offset in 0u64..=MAX_WIRE_OFFSET,
                ack in any::<u8>(),
                data in prop::collection::vec(any::<u8>(), 0..1024),
            ) {
                let message = Message::Payload(Payload {
                    ack_number: ack,
                    file_index,
                    offset,
                    data: Bytes::from(data),
                });
                let decoded = Message::decode(&message.encode().unwrap()).unwrap();
                prop_assert_eq!(message, decoded);
            }

            #[test]
            fn offset_seven_bytes_roundtrip(offset in 0u64..=MAX_WIRE_OFFSET) {
                let mut buf = Vec::new();
                put_wire_offset(&mut buf, offset).unwrap();
                prop_assert_eq!(buf.len(), 7);
                prop_assert_eq!(offset_from_wire(&buf), offset);
            }

            #[test]
            fn ack_entries_roundtrip(
                entries in prop::collection::vec(
                    (any::<u16>(), 0u64..=MAX_WIRE_OFFSET, any::<u8>()),
                    0..64,
                )
            ) {
                let message = Message::Ack(Ack {
                    ack_number: 1,
                    resend_entries: entries
                        .into_iter()
                        .map(|(file_index, offset, length)| ResendEntry { file_index, offset, length })
                        .collect(),
                    ..Ack::default()
                });
                let decoded = Message::decode(&message.encode().unwrap()).unwrap();
                prop_assert_eq!(message, decoded);
            }
        }
    }
}
