use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{FrameError, Result};

/// Frame header: id (16) + type (4) + size (2) + has_fd (1) + peer_pid (4)
/// + pid (4) = 31 bytes.
pub const HEADER_SIZE: usize = 31;

/// Maximum payload size: the 2-byte size field counts payload bytes only,
/// and header plus payload must fit in 65 535 bytes.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HEADER_SIZE;

/// Decoded frame header.
///
/// `peer_pid` and `pid` travel on the wire but are informational only:
/// the receiving side rewrites both to its own view before delivery, and
/// nothing compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message identifier; replies echo the id of the originating query.
    pub id: Uuid,
    /// Application-assigned type tag, opaque to the channel.
    pub msg_type: u32,
    /// Payload length in bytes.
    pub size: u16,
    /// Whether a descriptor was attached when the frame was sent.
    pub has_fd: bool,
    /// Peer process id as stamped by the sender.
    pub peer_pid: u32,
    /// Sender process id as stamped by the sender.
    pub pid: u32,
}

/// A decoded frame: header plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

/// Encode a frame into the wire format.
///
/// The size field is taken from `payload.len()`, not from `header.size`.
/// Fails with [`FrameError::PayloadTooLarge`] when the payload does not
/// fit; never fails otherwise.
///
/// Wire layout (big-endian, contiguous):
/// ```text
/// offset  0 .. 15 : message id (16 bytes)
/// offset 16 .. 19 : type (u32)
/// offset 20 .. 21 : size (u16)
/// offset 22       : has_fd (u8, 0 or 1)
/// offset 23 .. 26 : peer_pid (u32)
/// offset 27 .. 30 : pid (u32)
/// offset 31 ..    : payload (size bytes)
/// ```
pub fn encode_frame(header: &Header, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(header.id.as_bytes());
    dst.put_u32(header.msg_type);
    dst.put_u16(payload.len() as u16);
    dst.put_u8(header.has_fd as u8);
    dst.put_u32(header.peer_pid);
    dst.put_u32(header.pid);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer does not yet contain a complete
/// frame. On success, consumes the frame bytes from the buffer. A size
/// field larger than [`MAX_PAYLOAD`] is malformed (the encoder can never
/// emit one) and fails with [`FrameError::PayloadTooLarge`].
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    let size = u16::from_be_bytes(src[20..22].try_into().unwrap()) as usize;
    if size > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD,
        });
    }
    if src.len() < HEADER_SIZE + size {
        return Ok(None); // Need more data
    }

    let mut id = [0u8; 16];
    src.copy_to_slice(&mut id);
    let header = Header {
        id: Uuid::from_bytes(id),
        msg_type: src.get_u32(),
        size: src.get_u16(),
        has_fd: src.get_u8() != 0,
        peer_pid: src.get_u32(),
        pid: src.get_u32(),
    };
    let payload = src.split_to(size).freeze();

    Ok(Some(Frame { header, payload }))
}
