// Simple length-prefixed wire format for framing bytes on the network.
//
// Wire layout: [len: u32 BE][msg_type: u16 BE][body], where len = 2 + body len.
use bytes::{BufMut, Bytes, BytesMut};

mod buffer;
mod pool;

pub use buffer::Buffer;
pub use pool::{BufferPool, PooledBuffer};

/// Bytes of the length prefix.
pub const LEN_PREFIX: usize = 4;
/// Bytes of the message-type tag.
pub const TYPE_LEN: usize = 2;
/// Smallest legal value of the length prefix (the type tag alone).
pub const MIN_FRAME_LEN: u32 = TYPE_LEN as u32;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid frame length {0}")]
    InvalidLength(u32),
    #[error("frame length {len} exceeds cap {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("body too large to frame")]
    BodyTooLarge,
}

/// One protocol unit: a 16-bit message type and an opaque body.
///
/// ```
/// use bytes::Bytes;
/// use relay_wire::{Buffer, decode_frame, encode_frame};
///
/// let encoded = encode_frame(2, b"hello").expect("encode");
/// let mut buf = Buffer::new(64);
/// buf.append(&encoded);
/// let frame = decode_frame(&mut buf, 1024).expect("decode").expect("complete");
/// assert_eq!(frame.msg_type, 2);
/// assert_eq!(frame.body, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub body: Bytes,
}

/// Encode a single frame. The body must leave room for the type tag inside
/// the u32 length prefix.
pub fn encode_frame(msg_type: u16, body: &[u8]) -> Result<Bytes> {
    if body.len() > (u32::MAX as usize) - TYPE_LEN {
        return Err(Error::BodyTooLarge);
    }
    let len = (TYPE_LEN + body.len()) as u32;
    // Pre-allocate the exact size to avoid reallocation.
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + len as usize);
    buf.put_u32(len);
    buf.put_u16(msg_type);
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// Try to pull one complete frame off the buffer.
///
/// Returns `Ok(None)` when the buffered bytes do not yet hold a full frame;
/// the partial data stays in place for the next call. A length prefix below
/// `MIN_FRAME_LEN` or above `max_frame_bytes` means the stream is corrupt and
/// the caller must discard the remaining buffered bytes.
pub fn decode_frame(buf: &mut Buffer, max_frame_bytes: usize) -> Result<Option<Frame>> {
    if buf.readable_bytes() < LEN_PREFIX {
        return Ok(None);
    }
    let head = buf.peek();
    let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    if len < MIN_FRAME_LEN {
        return Err(Error::InvalidLength(len));
    }
    let len = len as usize;
    if max_frame_bytes > 0 && len > max_frame_bytes {
        return Err(Error::FrameTooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    if buf.readable_bytes() < LEN_PREFIX + len {
        // The rest of the frame has not arrived yet.
        return Ok(None);
    }
    buf.retrieve(LEN_PREFIX);
    let head = buf.peek();
    let msg_type = u16::from_be_bytes([head[0], head[1]]);
    buf.retrieve(TYPE_LEN);
    let body_len = len - TYPE_LEN;
    let body = Bytes::copy_from_slice(&buf.peek()[..body_len]);
    buf.retrieve(body_len);
    Ok(Some(Frame { msg_type, body }))
}
