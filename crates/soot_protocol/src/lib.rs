//! Framed binary protocol for the dirty pool.
//!
//! Wire format for client <-> arbiter and arbiter <-> worker traffic over
//! Unix domain sockets.
//!
//! # Frame layout
//!
//! Header (16 bytes, network byte order):
//! ```text
//! [MAGIC:2 "GD"][VER:1][TYPE:1][LEN:4][REQUEST_ID:8]
//! ```
//!
//! - MAGIC: ASCII `"GD"`
//! - VER (u8): protocol version (0x01)
//! - TYPE (u8): message kind
//! - LEN (u32): payload length in bytes; 0 is valid, > 64 MiB is rejected
//! - REQUEST_ID (u64): correlates replies to requests
//!
//! The payload is a single TLV-encoded value (see [`tlv`]); END and STATUS
//! frames carry no payload at all.

pub mod error;
pub mod payload;
pub mod tlv;

pub use error::{DirtyError, ErrorKind, ProtocolError};
pub use payload::{Manage, ManageOp, Request, StashOp, StashRequest};
pub use tlv::Value;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Environment variable carrying the arbiter socket path, set by the host
/// before request-serving workers start, read by clients.
pub const SOCKET_ENV_VAR: &str = "SOOT_DIRTY_SOCKET";

/// Exit code a worker uses when it fails before completing boot, so the
/// arbiter can tell boot failure from a runtime crash.
pub const WORKER_BOOT_ERROR: i32 = 3;

/// Frame magic, ASCII "GD".
pub const MAGIC: [u8; 2] = *b"GD";

/// Protocol version.
pub const VERSION: u8 = 0x01;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Maximum payload size (64 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Request = 0x01,
    Response = 0x02,
    Error = 0x03,
    Chunk = 0x04,
    End = 0x05,
    Stash = 0x10,
    Status = 0x11,
    Manage = 0x12,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(MsgType::Request),
            0x02 => Ok(MsgType::Response),
            0x03 => Ok(MsgType::Error),
            0x04 => Ok(MsgType::Chunk),
            0x05 => Ok(MsgType::End),
            0x10 => Ok(MsgType::Stash),
            0x11 => Ok(MsgType::Status),
            0x12 => Ok(MsgType::Manage),
            other => Err(ProtocolError::UnknownMsgType { found: other }),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the message kinds that end a reply sequence.
    pub fn is_terminal(self) -> bool {
        matches!(self, MsgType::Response | MsgType::Error | MsgType::End)
    }
}

/// Frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub request_id: u64,
    pub payload_len: u32,
}

impl Header {
    pub fn new(msg_type: MsgType, request_id: u64, payload_len: u32) -> Self {
        Self {
            msg_type,
            request_id,
            payload_len,
        }
    }

    /// Pack the header into its 16-byte wire form.
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE], ProtocolError> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        Write::write_all(&mut cursor, &MAGIC)?;
        WriteBytesExt::write_u8(&mut cursor, VERSION)?;
        WriteBytesExt::write_u8(&mut cursor, self.msg_type.as_u8())?;
        WriteBytesExt::write_u32::<BigEndian>(&mut cursor, self.payload_len)?;
        WriteBytesExt::write_u64::<BigEndian>(&mut cursor, self.request_id)?;

        Ok(buf)
    }

    /// Unpack and validate a 16-byte header.
    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort { got: data.len() });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);
        let mut magic = [0u8; 2];
        Read::read_exact(&mut cursor, &mut magic)?;
        let version = ReadBytesExt::read_u8(&mut cursor)?;
        let type_raw = ReadBytesExt::read_u8(&mut cursor)?;
        let payload_len = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
        let request_id = ReadBytesExt::read_u64::<BigEndian>(&mut cursor)?;

        if magic != MAGIC {
            return Err(ProtocolError::BadMagic { found: magic });
        }
        if version != VERSION {
            return Err(ProtocolError::BadVersion { found: version });
        }
        let msg_type = MsgType::from_u8(type_raw)?;
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len as u64,
            });
        }

        Ok(Self {
            msg_type,
            request_id,
            payload_len,
        })
    }
}

/// A complete protocol message: header plus decoded TLV payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub request_id: u64,
    pub payload: Value,
}

impl Frame {
    pub fn new(msg_type: MsgType, request_id: u64, payload: Value) -> Self {
        Self {
            msg_type,
            request_id,
            payload,
        }
    }

    pub fn request(request_id: u64, request: &Request) -> Self {
        Self::new(MsgType::Request, request_id, request.to_value())
    }

    pub fn response(request_id: u64, result: Value) -> Self {
        let mut map = BTreeMap::new();
        map.insert("result".to_string(), result);
        Self::new(MsgType::Response, request_id, Value::Dict(map))
    }

    pub fn error(request_id: u64, err: &DirtyError) -> Self {
        let mut map = BTreeMap::new();
        map.insert("error".to_string(), err.to_value());
        Self::new(MsgType::Error, request_id, Value::Dict(map))
    }

    pub fn chunk(request_id: u64, data: Value) -> Self {
        let mut map = BTreeMap::new();
        map.insert("data".to_string(), data);
        Self::new(MsgType::Chunk, request_id, Value::Dict(map))
    }

    pub fn end(request_id: u64) -> Self {
        Self::new(MsgType::End, request_id, Value::empty_dict())
    }

    pub fn status(request_id: u64) -> Self {
        Self::new(MsgType::Status, request_id, Value::empty_dict())
    }

    pub fn stash(request_id: u64, request: &StashRequest) -> Self {
        Self::new(MsgType::Stash, request_id, request.to_value())
    }

    pub fn manage(request_id: u64, manage: &Manage) -> Self {
        Self::new(MsgType::Manage, request_id, manage.to_value())
    }

    /// The `result` field of a RESPONSE payload.
    pub fn result(&self) -> Result<&Value, ProtocolError> {
        self.payload
            .get("result")
            .ok_or(ProtocolError::MalformedPayload {
                kind: "response",
                reason: "missing result field".to_string(),
            })
    }

    /// The `data` field of a CHUNK payload.
    pub fn data(&self) -> Result<&Value, ProtocolError> {
        self.payload
            .get("data")
            .ok_or(ProtocolError::MalformedPayload {
                kind: "chunk",
                reason: "missing data field".to_string(),
            })
    }

    /// The typed error of an ERROR payload.
    pub fn dirty_error(&self) -> Result<DirtyError, ProtocolError> {
        let inner = self
            .payload
            .get("error")
            .ok_or(ProtocolError::MalformedPayload {
                kind: "error",
                reason: "missing error field".to_string(),
            })?;
        DirtyError::from_value(inner)
    }

    /// Encode the frame to wire bytes (header plus payload).
    ///
    /// END and STATUS frames always encode with a zero-length payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self.msg_type {
            MsgType::End | MsgType::Status => Vec::new(),
            _ => tlv::encode(&self.payload)?,
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len() as u64,
            });
        }
        let header = Header::new(self.msg_type, self.request_id, payload.len() as u32);
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&header.pack()?);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn from_parts(header: Header, payload_data: &[u8]) -> Result<Self, ProtocolError> {
        let payload = if payload_data.is_empty() {
            Value::empty_dict()
        } else {
            tlv::decode(payload_data)?
        };
        Ok(Self {
            msg_type: header.msg_type,
            request_id: header.request_id,
            payload,
        })
    }

    /// Decode one complete frame from a byte slice.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let header = Header::unpack(data)?;
        let total = HEADER_SIZE + header.payload_len as usize;
        if data.len() < total {
            return Err(ProtocolError::Truncated {
                context: "frame payload",
            });
        }
        Self::from_parts(header, &data[HEADER_SIZE..total])
    }
}

// ----------------------------------------------------------------------------
// Stream I/O, async and sync
// ----------------------------------------------------------------------------

/// Read one frame from an async stream.
///
/// A connection closed cleanly at a frame boundary yields
/// [`ProtocolError::Closed`]; a close mid-frame is a truncation error.
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    read_exact_or_closed_async(reader, &mut header_buf).await?;
    let header = Header::unpack(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(map_payload_eof)?;
    }
    Frame::from_parts(header, &payload)
}

/// Write one frame to an async stream and flush it.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    let data = frame.encode()?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from a blocking stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    read_exact_or_closed(reader, &mut header_buf)?;
    let header = Header::unpack(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).map_err(map_payload_eof)?;
    }
    Frame::from_parts(header, &payload)
}

/// Write one frame to a blocking stream and flush it.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    let data = frame.encode()?;
    writer.write_all(&data)?;
    writer.flush()?;
    Ok(())
}

fn map_payload_eof(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated {
            context: "frame payload",
        }
    } else {
        ProtocolError::Io(err)
    }
}

async fn read_exact_or_closed_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                ProtocolError::Closed
            } else {
                ProtocolError::Truncated {
                    context: "frame header",
                }
            });
        }
        filled += n;
    }
    Ok(())
}

fn read_exact_or_closed<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(if filled == 0 {
                ProtocolError::Closed
            } else {
                ProtocolError::Truncated {
                    context: "frame header",
                }
            });
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pack_unpack() {
        let header = Header::new(MsgType::Request, 12345, 1024);
        let packed = header.pack().unwrap();
        assert_eq!(packed.len(), HEADER_SIZE);
        assert_eq!(&packed[..2], b"GD");

        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(unpacked, header);
    }

    #[test]
    fn header_roundtrip_all_types() {
        for msg_type in [
            MsgType::Request,
            MsgType::Response,
            MsgType::Error,
            MsgType::Chunk,
            MsgType::End,
            MsgType::Stash,
            MsgType::Status,
            MsgType::Manage,
        ] {
            let header = Header::new(msg_type, u64::MAX, 0);
            let unpacked = Header::unpack(&header.pack().unwrap()).unwrap();
            assert_eq!(unpacked, header);
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut packed = Header::new(MsgType::End, 1, 0).pack().unwrap();
        packed[0] = b'X';
        assert!(matches!(
            Header::unpack(&packed),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn bad_version_rejected() {
        let mut packed = Header::new(MsgType::End, 1, 0).pack().unwrap();
        packed[2] = 0x02;
        assert!(matches!(
            Header::unpack(&packed),
            Err(ProtocolError::BadVersion { found: 0x02 })
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let mut packed = Header::new(MsgType::End, 1, 0).pack().unwrap();
        packed[3] = 0x7f;
        assert!(matches!(
            Header::unpack(&packed),
            Err(ProtocolError::UnknownMsgType { found: 0x7f })
        ));
    }

    #[test]
    fn payload_length_limits() {
        let mut packed = Header::new(MsgType::Response, 1, 0).pack().unwrap();

        // Exactly 64 MiB is accepted.
        packed[4..8].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32).to_be_bytes());
        assert!(Header::unpack(&packed).is_ok());

        // One byte over is rejected.
        packed[4..8].copy_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes());
        assert!(matches!(
            Header::unpack(&packed),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn empty_payload_frame_roundtrip() {
        let frame = Frame::end(77);
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.msg_type, MsgType::End);
        assert_eq!(decoded.request_id, 77);
        assert_eq!(decoded.payload, Value::empty_dict());
    }

    #[test]
    fn response_frame_roundtrip() {
        let frame = Frame::response(9, Value::Int(41));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.result().unwrap(), &Value::Int(41));
    }

    #[test]
    fn error_frame_roundtrip() {
        let err = DirtyError::no_workers_available("heavy:Heavy");
        let frame = Frame::error(3, &err);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.dirty_error().unwrap(), err);
    }

    #[test]
    fn terminal_types() {
        assert!(MsgType::Response.is_terminal());
        assert!(MsgType::Error.is_terminal());
        assert!(MsgType::End.is_terminal());
        assert!(!MsgType::Chunk.is_terminal());
        assert!(!MsgType::Request.is_terminal());
    }

    #[tokio::test]
    async fn async_stream_roundtrip() {
        let frames = vec![
            Frame::chunk(5, Value::Str("a".into())),
            Frame::chunk(5, Value::Str("b".into())),
            Frame::end(5),
        ];
        let mut buf = Vec::new();
        for frame in &frames {
            write_frame_async(&mut buf, frame).await.unwrap();
        }

        let mut cursor = std::io::Cursor::new(buf);
        for frame in &frames {
            let read = read_frame_async(&mut cursor).await.unwrap();
            assert_eq!(&read, frame);
        }
        assert!(matches!(
            read_frame_async(&mut cursor).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn sync_stream_roundtrip() {
        let frame = Frame::response(1, Value::Bool(true));
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), frame);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn mid_frame_close_is_truncation() {
        let frame = Frame::response(1, Value::Int(5));
        let encoded = frame.encode().unwrap();
        let mut cursor = std::io::Cursor::new(&encoded[..HEADER_SIZE + 2]);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
