//! Wire framing for discovery datagrams and transfer streams.
//!
//! Every frame is a 5 byte header (1 byte type tag, 4 byte big-endian payload
//! length) followed by the payload. Discovery payloads are `key=value` text
//! lines; transfer control payloads are tagged binary fields; `DATA` carries a
//! sequence number followed by raw chunk bytes.
//!
//! Datagrams are decoded whole with [`Message::decode`]. TCP streams use
//! [`FrameCodec`] through `FramedRead`/`FramedWrite`.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::integrity::ContentHash;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 5;

/// Largest chunk a peer may put in one `DATA` frame.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Largest payload accepted on the wire.
pub const MAX_PAYLOAD_LEN: usize = MAX_CHUNK_SIZE as usize + 64;

/// Errors produced while decoding frames.
///
/// Both protocol variants are recoverable: the offending frame has already
/// been consumed, so a reader can drop it and keep going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(Arc<str>),

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("i/o error: {0}")]
    Io(Arc<str>),
}

impl CodecError {
    #[inline]
    fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(Arc::from(msg.into()))
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::from(err.to_string()))
    }
}

/// Type tag carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Discover = 0x01,
    DiscoverResponse = 0x02,
    Goodbye = 0x03,
    TransferRequest = 0x10,
    TransferAccept = 0x11,
    TransferReject = 0x12,
    FileInfo = 0x13,
    Data = 0x20,
    Ack = 0x21,
    Complete = 0x30,
    Error = 0x31,
    Pause = 0x40,
    Resume = 0x41,
    Cancel = 0x42,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Discover,
            0x02 => Self::DiscoverResponse,
            0x03 => Self::Goodbye,
            0x10 => Self::TransferRequest,
            0x11 => Self::TransferAccept,
            0x12 => Self::TransferReject,
            0x13 => Self::FileInfo,
            0x20 => Self::Data,
            0x21 => Self::Ack,
            0x30 => Self::Complete,
            0x31 => Self::Error,
            0x40 => Self::Pause,
            0x41 => Self::Resume,
            0x42 => Self::Cancel,
            _ => return None,
        })
    }

    #[inline]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::DiscoverResponse => "DISCOVER_RESPONSE",
            Self::Goodbye => "GOODBYE",
            Self::TransferRequest => "TRANSFER_REQUEST",
            Self::TransferAccept => "TRANSFER_ACCEPT",
            Self::TransferReject => "TRANSFER_REJECT",
            Self::FileInfo => "FILE_INFO",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device identity announced over discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub device_id: String,
    pub device_name: String,
    pub discovery_port: u16,
    pub transfer_port: u16,
}

/// File metadata offered in `TRANSFER_REQUEST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// Stable identity of the content, used for busy checks and resume.
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
    pub chunk_size: u32,
    pub hash: Option<ContentHash>,
    pub sender_id: String,
    pub sender_name: String,
}

impl FileOffer {
    /// Number of `DATA` frames a full transfer of this file takes.
    pub fn total_chunks(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.size.div_ceil(u64::from(self.chunk_size))
    }
}

/// Reason code carried by an `ERROR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    IntegrityMismatch = 1,
    ProtocolViolation = 2,
    IoFailure = 3,
    Busy = 4,
    Other = 0xff,
}

impl ErrorCode {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::IntegrityMismatch,
            2 => Self::ProtocolViolation,
            3 => Self::IoFailure,
            4 => Self::Busy,
            0xff => Self::Other,
            _ => return None,
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Discover(Announcement),
    DiscoverResponse(Announcement),
    /// The announcing device is going offline.
    Goodbye(Announcement),
    TransferRequest(FileOffer),
    TransferAccept { resume_offset: u64 },
    TransferReject { reason: String },
    FileInfo { start_offset: u64, first_seq: u64, total_chunks: u64 },
    Data { seq: u64, payload: Bytes },
    Ack { seq: u64 },
    Complete { hash: ContentHash },
    Error { code: ErrorCode, message: String },
    Pause,
    Resume,
    Cancel,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Discover(_) => MessageKind::Discover,
            Self::DiscoverResponse(_) => MessageKind::DiscoverResponse,
            Self::Goodbye(_) => MessageKind::Goodbye,
            Self::TransferRequest(_) => MessageKind::TransferRequest,
            Self::TransferAccept { .. } => MessageKind::TransferAccept,
            Self::TransferReject { .. } => MessageKind::TransferReject,
            Self::FileInfo { .. } => MessageKind::FileInfo,
            Self::Data { .. } => MessageKind::Data,
            Self::Ack { .. } => MessageKind::Ack,
            Self::Complete { .. } => MessageKind::Complete,
            Self::Error { .. } => MessageKind::Error,
            Self::Pause => MessageKind::Pause,
            Self::Resume => MessageKind::Resume,
            Self::Cancel => MessageKind::Cancel,
        }
    }

    /// Appends the full frame (header and payload) to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.put_u8(self.kind().tag());
        dst.put_u32(0);

        match self {
            Self::Discover(ann) | Self::DiscoverResponse(ann) | Self::Goodbye(ann) => {
                encode_announcement(ann, dst)
            }
            Self::TransferRequest(offer) => {
                put_str(dst, &offer.file_id);
                put_str(dst, &offer.file_name);
                dst.put_u64(offer.size);
                dst.put_u32(offer.chunk_size);
                put_hash(dst, offer.hash.as_ref());
                put_str(dst, &offer.sender_id);
                put_str(dst, &offer.sender_name);
            }
            Self::TransferAccept { resume_offset } => dst.put_u64(*resume_offset),
            Self::TransferReject { reason } => put_str(dst, reason),
            Self::FileInfo {
                start_offset,
                first_seq,
                total_chunks,
            } => {
                dst.put_u64(*start_offset);
                dst.put_u64(*first_seq);
                dst.put_u64(*total_chunks);
            }
            Self::Data { seq, payload } => {
                dst.put_u64(*seq);
                dst.extend_from_slice(payload);
            }
            Self::Ack { seq } => dst.put_u64(*seq),
            Self::Complete { hash } => dst.extend_from_slice(hash.as_bytes()),
            Self::Error { code, message } => {
                dst.put_u8(*code as u8);
                put_str(dst, message);
            }
            Self::Pause | Self::Resume | Self::Cancel => {}
        }

        let payload_len = (dst.len() - start - HEADER_LEN) as u32;
        dst[start + 1..start + HEADER_LEN].copy_from_slice(&payload_len.to_be_bytes());
    }

    /// Encodes into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes exactly one complete frame, such as a UDP datagram.
    ///
    /// The declared payload length must match the bytes that follow the
    /// header exactly.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < HEADER_LEN {
            return Err(CodecError::malformed(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let tag = frame[0];
        let declared = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        let actual = frame.len() - HEADER_LEN;
        if declared != actual {
            return Err(CodecError::malformed(format!(
                "length prefix says {declared} bytes, payload has {actual}"
            )));
        }
        decode_payload(tag, Bytes::copy_from_slice(&frame[HEADER_LEN..]))
    }
}

fn encode_announcement(ann: &Announcement, dst: &mut BytesMut) {
    let text = format!(
        "id={}\nname={}\ndiscovery_port={}\ntransfer_port={}\n",
        single_line(&ann.device_id),
        single_line(&ann.device_name),
        ann.discovery_port,
        ann.transfer_port
    );
    dst.extend_from_slice(text.as_bytes());
}

fn single_line(value: &str) -> std::borrow::Cow<'_, str> {
    if value.contains(['\n', '\r']) {
        value.replace(['\n', '\r'], " ").into()
    } else {
        value.into()
    }
}

fn decode_announcement(payload: &[u8]) -> Result<Announcement, CodecError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| CodecError::malformed("discovery payload is not UTF-8"))?;

    let mut device_id = None;
    let mut device_name = None;
    let mut discovery_port = None;
    let mut transfer_port = None;

    for line in text.lines().filter(|l| !l.is_empty()) {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| CodecError::malformed(format!("bad discovery line: {line:?}")))?;
        match key {
            "id" => device_id = Some(value.to_owned()),
            "name" => device_name = Some(value.to_owned()),
            "discovery_port" => discovery_port = Some(parse_port(value)?),
            "transfer_port" => transfer_port = Some(parse_port(value)?),
            // Unknown keys are tolerated so newer peers can add fields.
            _ => {}
        }
    }

    let missing = |field: &str| CodecError::malformed(format!("discovery payload missing {field}"));
    let device_id = device_id.ok_or_else(|| missing("id"))?;
    if device_id.is_empty() {
        return Err(CodecError::malformed("empty device id"));
    }

    Ok(Announcement {
        device_id,
        device_name: device_name.ok_or_else(|| missing("name"))?,
        discovery_port: discovery_port.ok_or_else(|| missing("discovery_port"))?,
        transfer_port: transfer_port.ok_or_else(|| missing("transfer_port"))?,
    })
}

fn parse_port(value: &str) -> Result<u16, CodecError> {
    value
        .parse()
        .map_err(|_| CodecError::malformed(format!("bad port: {value:?}")))
}

fn put_str(dst: &mut BytesMut, value: &str) {
    dst.put_u32(value.len() as u32);
    dst.extend_from_slice(value.as_bytes());
}

fn put_hash(dst: &mut BytesMut, hash: Option<&ContentHash>) {
    match hash {
        Some(hash) => {
            dst.put_u8(1);
            dst.extend_from_slice(hash.as_bytes());
        }
        None => dst.put_u8(0),
    }
}

/// Bounds-checked cursor over a control payload.
struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    fn need(&self, n: usize, what: &str) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::malformed(format!(
                "truncated payload reading {what}: need {n}, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self, what: &str) -> Result<u8, CodecError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &str) -> Result<u32, CodecError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, what: &str) -> Result<u64, CodecError> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    fn string(&mut self, what: &str) -> Result<String, CodecError> {
        let len = self.u32(what)? as usize;
        self.need(len, what)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::malformed(format!("{what} is not UTF-8")))
    }

    fn hash(&mut self, what: &str) -> Result<ContentHash, CodecError> {
        self.need(ContentHash::LEN, what)?;
        let mut bytes = [0u8; ContentHash::LEN];
        self.buf.copy_to_slice(&mut bytes);
        Ok(ContentHash::from_bytes(bytes))
    }

    fn optional_hash(&mut self, what: &str) -> Result<Option<ContentHash>, CodecError> {
        match self.u8(what)? {
            0 => Ok(None),
            1 => self.hash(what).map(Some),
            other => Err(CodecError::malformed(format!("bad {what} presence byte {other}"))),
        }
    }

    fn rest(self) -> Bytes {
        self.buf
    }

    fn finish(self, kind: MessageKind) -> Result<(), CodecError> {
        if self.buf.has_remaining() {
            return Err(CodecError::malformed(format!(
                "{} trailing bytes after {kind} payload",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

fn decode_payload(tag: u8, payload: Bytes) -> Result<Message, CodecError> {
    let kind = MessageKind::from_tag(tag).ok_or(CodecError::UnknownMessageType(tag))?;
    let mut r = FieldReader { buf: payload };

    let message = match kind {
        MessageKind::Discover => return decode_announcement(&r.rest()).map(Message::Discover),
        MessageKind::DiscoverResponse => {
            return decode_announcement(&r.rest()).map(Message::DiscoverResponse)
        }
        MessageKind::Goodbye => return decode_announcement(&r.rest()).map(Message::Goodbye),
        MessageKind::TransferRequest => Message::TransferRequest(FileOffer {
            file_id: r.string("file_id")?,
            file_name: r.string("file_name")?,
            size: r.u64("size")?,
            chunk_size: r.u32("chunk_size")?,
            hash: r.optional_hash("hash")?,
            sender_id: r.string("sender_id")?,
            sender_name: r.string("sender_name")?,
        }),
        MessageKind::TransferAccept => Message::TransferAccept {
            resume_offset: r.u64("resume_offset")?,
        },
        MessageKind::TransferReject => Message::TransferReject {
            reason: r.string("reason")?,
        },
        MessageKind::FileInfo => Message::FileInfo {
            start_offset: r.u64("start_offset")?,
            first_seq: r.u64("first_seq")?,
            total_chunks: r.u64("total_chunks")?,
        },
        MessageKind::Data => {
            let seq = r.u64("seq")?;
            return Ok(Message::Data {
                seq,
                payload: r.rest(),
            });
        }
        MessageKind::Ack => Message::Ack { seq: r.u64("seq")? },
        MessageKind::Complete => Message::Complete {
            hash: r.hash("hash")?,
        },
        MessageKind::Error => {
            let raw = r.u8("code")?;
            let code = ErrorCode::from_u8(raw)
                .ok_or_else(|| CodecError::malformed(format!("unknown error code {raw}")))?;
            Message::Error {
                code,
                message: r.string("message")?,
            }
        }
        MessageKind::Pause => Message::Pause,
        MessageKind::Resume => Message::Resume,
        MessageKind::Cancel => Message::Cancel,
    };

    r.finish(kind)?;
    Ok(message)
}

/// Stream codec for transfer connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            // The stream cannot be resynchronised past a bogus length.
            src.clear();
            return Err(CodecError::malformed(format!(
                "payload of {len} bytes exceeds limit of {MAX_PAYLOAD_LEN}"
            )));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let tag = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        decode_payload(tag, payload).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let leftover = src.len();
                src.clear();
                Err(CodecError::malformed(format!(
                    "stream ended inside a frame ({leftover} bytes pending)"
                )))
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_offer() -> FileOffer {
        FileOffer {
            file_id: "ab12".into(),
            file_name: "holiday photo.jpg".into(),
            size: 10 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            hash: Some(ContentHash::of(b"content")),
            sender_id: "dev-A".into(),
            sender_name: "Laptop".into(),
        }
    }

    fn all_samples() -> Vec<Message> {
        let ann = Announcement {
            device_id: "dev-A".into(),
            device_name: "Laptop = Main".into(),
            discovery_port: 45678,
            transfer_port: 45679,
        };
        vec![
            Message::Discover(ann.clone()),
            Message::DiscoverResponse(ann.clone()),
            Message::Goodbye(ann),
            Message::TransferRequest(sample_offer()),
            Message::TransferRequest(FileOffer {
                hash: None,
                ..sample_offer()
            }),
            Message::TransferAccept { resume_offset: 42 },
            Message::TransferReject {
                reason: "declined".into(),
            },
            Message::FileInfo {
                start_offset: 0,
                first_seq: 0,
                total_chunks: 10,
            },
            Message::Data {
                seq: 3,
                payload: Bytes::from_static(b"chunk bytes"),
            },
            Message::Data {
                seq: 0,
                payload: Bytes::new(),
            },
            Message::Ack { seq: 3 },
            Message::Complete {
                hash: ContentHash::of(b"x"),
            },
            Message::Error {
                code: ErrorCode::IntegrityMismatch,
                message: "hash mismatch".into(),
            },
            Message::Pause,
            Message::Resume,
            Message::Cancel,
        ]
    }

    // ==================== Datagram Tests ====================

    #[test]
    fn test_every_kind_survives_encoding() {
        for msg in all_samples() {
            let bytes = msg.to_bytes();
            assert_eq!(bytes[0], msg.kind().tag());
            assert_eq!(Message::decode(&bytes).unwrap(), msg, "kind {}", msg.kind());
        }
    }

    #[test]
    fn test_short_header_is_malformed() {
        let err = Message::decode(&[0x01, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame(_)));
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let mut bytes = Message::Ack { seq: 9 }.to_bytes().to_vec();
        bytes.push(0);
        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::MalformedFrame(_))
        ));

        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_unknown_type() {
        let bytes = [0x7f, 0, 0, 0, 0];
        assert_eq!(
            Message::decode(&bytes).unwrap_err(),
            CodecError::UnknownMessageType(0x7f)
        );
    }

    #[test]
    fn test_trailing_bytes_inside_payload_are_malformed() {
        // ACK payload with 9 bytes instead of 8, length prefix consistent.
        let bytes = [0x21, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0, 1, 0xee];
        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_discovery_text_payload() {
        let payload = b"id=dev-B\nname=Phone\ndiscovery_port=1\ntransfer_port=2\nextra=ok\n";
        let mut frame = vec![0x01, 0, 0, 0, payload.len() as u8];
        frame.extend_from_slice(payload);

        match Message::decode(&frame).unwrap() {
            Message::Discover(ann) => {
                assert_eq!(ann.device_id, "dev-B");
                assert_eq!(ann.device_name, "Phone");
                assert_eq!(ann.discovery_port, 1);
                assert_eq!(ann.transfer_port, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_discovery_missing_field() {
        let payload = b"id=dev-B\nname=Phone\n";
        let mut frame = vec![0x02, 0, 0, 0, payload.len() as u8];
        frame.extend_from_slice(payload);
        assert!(matches!(
            Message::decode(&frame),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_newlines_in_name_are_flattened() {
        let msg = Message::Discover(Announcement {
            device_id: "dev".into(),
            device_name: "two\nlines".into(),
            discovery_port: 1,
            transfer_port: 2,
        });
        match Message::decode(&msg.to_bytes()).unwrap() {
            Message::Discover(ann) => assert_eq!(ann.device_name, "two lines"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_total_chunks() {
        let mut offer = sample_offer();
        assert_eq!(offer.total_chunks(), 10);
        offer.size += 1;
        assert_eq!(offer.total_chunks(), 11);
        offer.size = 0;
        assert_eq!(offer.total_chunks(), 0);
    }

    // ==================== Stream Codec Tests ====================

    #[test]
    fn test_stream_decoder_handles_split_frames() {
        let mut wire = BytesMut::new();
        for msg in all_samples() {
            msg.encode(&mut wire);
        }

        let mut codec = FrameCodec;
        let mut src = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            src.put_u8(*byte);
            while let Some(msg) = codec.decode(&mut src).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, all_samples());
        assert!(src.is_empty());
    }

    #[test]
    fn test_stream_unknown_type_consumes_frame() {
        let mut src = BytesMut::from(&[0x66, 0, 0, 0, 2, 1, 2][..]);
        Message::Pause.encode(&mut src);

        let mut codec = FrameCodec;
        assert_eq!(
            codec.decode(&mut src).unwrap_err(),
            CodecError::UnknownMessageType(0x66)
        );
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Message::Pause));
    }

    #[test]
    fn test_stream_oversized_length() {
        let mut src = BytesMut::from(&[0x20, 0xff, 0xff, 0xff, 0xff][..]);
        let err = FrameCodec.decode(&mut src).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame(_)));
    }

    #[test]
    fn test_stream_eof_inside_frame() {
        let bytes = Message::Ack { seq: 1 }.to_bytes();
        let mut src = BytesMut::from(&bytes[..bytes.len() - 2]);
        let err = FrameCodec.decode_eof(&mut src).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame(_)));
    }

    // ==================== Property Tests ====================

    fn arb_text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 _.=-]{0,24}"
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (arb_text().prop_filter("non-empty id", |s| !s.is_empty()), arb_text(), any::<u16>(), any::<u16>())
                .prop_map(|(device_id, device_name, discovery_port, transfer_port)| {
                    Message::Discover(Announcement {
                        device_id,
                        device_name,
                        discovery_port,
                        transfer_port,
                    })
                }),
            (arb_text(), arb_text(), any::<u64>(), any::<u32>(), any::<Option<[u8; 32]>>())
                .prop_map(|(file_id, file_name, size, chunk_size, hash)| {
                    Message::TransferRequest(FileOffer {
                        file_id,
                        file_name,
                        size,
                        chunk_size,
                        hash: hash.map(ContentHash::from_bytes),
                        sender_id: "s".into(),
                        sender_name: "n".into(),
                    })
                }),
            any::<u64>().prop_map(|resume_offset| Message::TransferAccept { resume_offset }),
            (any::<u64>(), proptest::collection::vec(any::<u8>(), 0..256)).prop_map(
                |(seq, data)| Message::Data {
                    seq,
                    payload: Bytes::from(data)
                }
            ),
            any::<u64>().prop_map(|seq| Message::Ack { seq }),
            any::<[u8; 32]>().prop_map(|b| Message::Complete {
                hash: ContentHash::from_bytes(b)
            }),
            arb_text().prop_map(|message| Message::Error {
                code: ErrorCode::Other,
                message
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(msg in arb_message()) {
            prop_assert_eq!(Message::decode(&msg.to_bytes()).unwrap(), msg);
        }

        #[test]
        fn prop_truncated_frames_fail_cleanly(msg in arb_message(), cut in 1usize..64) {
            let bytes = msg.to_bytes();
            let keep = bytes.len().saturating_sub(cut);
            let result = Message::decode(&bytes[..keep]);
            prop_assert!(matches!(result, Err(CodecError::MalformedFrame(_))));
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Message::decode(&data);
            let mut src = BytesMut::from(&data[..]);
            let _ = FrameCodec.decode_eof(&mut src);
        }
    }
}
