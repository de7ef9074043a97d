//! Stream records carried inside the block byte stream
//!
//! Record format (little-endian):
//! ```text
//! +-------------------+-------------------+
//! |   Stream ID (4B)  |    Length (4B)    |
//! +-------------------+---------+---------+
//! |   Cmd Seq (4B)    | Cmd(1B) | Body... |
//! +-------------------+---------+---------+
//! ```
//! Create body: `sock_type u8, host_len u16, host, port u16`.
//! Close body: UTF-8 reason. Ack body: consumed position `u64`.

use super::TunnelError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Record header size in bytes (stream id + length)
pub const FRAME_HEADER_SIZE: usize = 8;

/// Command header inside the record body (cmd_seq + cmd)
pub const COMMAND_HEADER_SIZE: usize = 5;

/// Largest record body accepted from the peer
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Socket type for create commands
pub const SOCK_TCP: u8 = 0;

/// Command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Create = 0,
    Data = 1,
    Close = 2,
    Ack = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Create),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::Ack),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown command: {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Create { sock_type: u8, host: String, port: u16 },
    Data(Bytes),
    Close(String),
    /// Bytes the sender of this record has consumed
    Ack(u64),
}

impl FrameBody {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::Create { .. } => FrameType::Create,
            FrameBody::Data(_) => FrameType::Data,
            FrameBody::Close(_) => FrameType::Close,
            FrameBody::Ack(_) => FrameType::Ack,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            FrameBody::Create { host, .. } => 1 + 2 + host.len() + 2,
            FrameBody::Data(data) => data.len(),
            FrameBody::Close(reason) => reason.len(),
            FrameBody::Ack(_) => 8,
        }
    }
}

/// One stream command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    /// Per-stream command sequence; create is always 0
    pub seq: u32,
    pub body: FrameBody,
}

impl Frame {
    pub fn create(stream_id: u32, host: impl Into<String>, port: u16) -> Self {
        Self {
            stream_id,
            seq: 0,
            body: FrameBody::Create {
                sock_type: SOCK_TCP,
                host: host.into(),
                port,
            },
        }
    }

    pub fn data(stream_id: u32, seq: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            body: FrameBody::Data(payload),
        }
    }

    pub fn close(stream_id: u32, seq: u32, reason: impl Into<String>) -> Self {
        Self {
            stream_id,
            seq,
            body: FrameBody::Close(reason.into()),
        }
    }

    pub fn ack(stream_id: u32, seq: u32, position: u64) -> Self {
        Self {
            stream_id,
            seq,
            body: FrameBody::Ack(position),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.body.frame_type()
    }

    /// Size on the wire
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + COMMAND_HEADER_SIZE + self.body.encoded_len()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let body_len = COMMAND_HEADER_SIZE + self.body.encoded_len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body_len);

        buf.put_u32_le(self.stream_id);
        buf.put_u32_le(body_len as u32);
        buf.put_u32_le(self.seq);
        buf.put_u8(self.frame_type() as u8);

        match &self.body {
            FrameBody::Create {
                sock_type,
                host,
                port,
            } => {
                let host_len = u16::try_from(host.len())
                    .map_err(|_| TunnelError::InvalidFrame(format!("host too long: {}", host.len())))?;
                buf.put_u8(*sock_type);
                buf.put_u16_le(host_len);
                buf.put_slice(host.as_bytes());
                buf.put_u16_le(*port);
            }
            FrameBody::Data(data) => buf.put_slice(data),
            FrameBody::Close(reason) => buf.put_slice(reason.as_bytes()),
            FrameBody::Ack(position) => buf.put_u64_le(*position),
        }

        Ok(buf)
    }

    /// Decode one frame from the front of `buf`; `None` until a whole
    /// record has arrived
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let stream_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let body_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

        if body_len < COMMAND_HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "Record too short: {}",
                body_len
            )));
        }
        if body_len > MAX_RECORD_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "Record too large: {}",
                body_len
            )));
        }
        if buf.len() < FRAME_HEADER_SIZE + body_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let mut body = buf.split_to(body_len).freeze();
        let seq = body.get_u32_le();
        let frame_type = FrameType::try_from(body.get_u8())?;

        let body = match frame_type {
            FrameType::Create => {
                if body.remaining() < 3 {
                    return Err(TunnelError::InvalidFrame("Truncated create".into()));
                }
                let sock_type = body.get_u8();
                let host_len = body.get_u16_le() as usize;
                if body.remaining() != host_len + 2 {
                    return Err(TunnelError::InvalidFrame("Bad create length".into()));
                }
                let host = String::from_utf8(body.split_to(host_len).to_vec())
                    .map_err(|_| TunnelError::InvalidFrame("Host is not UTF-8".into()))?;
                let port = body.get_u16_le();
                FrameBody::Create {
                    sock_type,
                    host,
                    port,
                }
            }
            FrameType::Data => FrameBody::Data(body),
            FrameType::Close => FrameBody::Close(String::from_utf8_lossy(&body).into_owned()),
            FrameType::Ack => {
                if body.remaining() != 8 {
                    return Err(TunnelError::InvalidFrame("Bad ack length".into()));
                }
                FrameBody::Ack(body.get_u64_le())
            }
        };

        Ok(Some(Frame {
            stream_id,
            seq,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_layout() {
        let frame = Frame::create(1, "example.com", 443);
        let encoded = frame.encode().unwrap();

        assert_eq!(&encoded[0..4], &1u32.to_le_bytes());
        assert_eq!(&encoded[4..8], &(5u32 + 1 + 2 + 11 + 2).to_le_bytes());
        assert_eq!(&encoded[8..12], &0u32.to_le_bytes());
        assert_eq!(encoded[12], FrameType::Create as u8);
        assert_eq!(encoded.len(), frame.encoded_len());

        let mut buf = encoded;
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_records_split_across_buffers() {
        let frames = vec![
            Frame::data(3, 1, Bytes::from_static(b"hello")),
            Frame::ack(3, 2, 4096),
            Frame::close(3, 3, "done"),
        ];
        let mut wire = BytesMut::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode().unwrap());
        }

        // feed a byte at a time
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for b in wire.iter() {
            buf.put_u8(*b);
            while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_invalid_records() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(5);
        buf.put_u32_le(1);
        buf.put_u8(9);
        assert!(Frame::decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(2);
        assert!(Frame::decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(6);
        buf.put_u32_le(1);
        buf.put_u8(FrameType::Ack as u8);
        buf.put_u8(0);
        assert!(Frame::decode(&mut buf).is_err());
    }
}
