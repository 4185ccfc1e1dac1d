//! Length-prefixed frame codec for tokio.
//!
//! Both the internal peer streams and the external client streams frame
//! datagrams with a 16-bit little-endian byte-length prefix. The codec
//! yields the frame body; header interpretation is left to the receiver.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Hard ceiling on a single frame body. The length prefix caps frames at
/// 64 KiB anyway; the codec enforces a configurable lower bound.
const DEFAULT_MAX_FRAME: usize = u16::MAX as usize;

pub struct DatagramCodec {
    max_frame: usize,
}

impl DatagramCodec {
    pub fn new() -> Self {
        Self { max_frame: DEFAULT_MAX_FRAME }
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for DatagramCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DatagramCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let declared = u16::from_le_bytes([src[0], src[1]]) as usize;
        if declared > self.max_frame {
            return Err(ProtocolError::FrameTooLarge { actual: declared, limit: self.max_frame });
        }

        if src.len() < 2 + declared {
            // Partial frame, wait for more bytes.
            src.reserve(2 + declared - src.len());
            return Ok(None);
        }

        src.advance(2);
        Ok(Some(src.split_to(declared).freeze()))
    }
}

impl Encoder<Bytes> for DatagramCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if body.len() > self.max_frame {
            return Err(ProtocolError::FrameTooLarge { actual: body.len(), limit: self.max_frame });
        }

        dst.reserve(2 + body.len());
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}
