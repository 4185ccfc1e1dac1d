//! Datagram buffer and cursor.
//!
//! A [`Datagram`] is a growable little-endian byte buffer with typed
//! writers; a [`DatagramIter`] walks one with typed readers. Strings and
//! blobs carry a 16-bit length prefix. The two header helpers produce the
//! internal frame shapes: a routed header addresses a destination channel
//! with a sender and message type, a control header addresses the reserved
//! control channel with a control type and a channel argument.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channels::{Channel, CONTROL_MESSAGE};
use crate::error::{ProtocolError, Result};

/// An outgoing datagram under construction.
#[derive(Debug, Clone, Default)]
pub struct Datagram {
    buf: BytesMut,
}

impl Datagram {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Routed header: `[1u8][dst][src][msg_type]`.
    pub fn server_header(dst: Channel, src: Channel, msg_type: u16) -> Self {
        let mut dg = Self::new();
        dg.add_u8(1);
        dg.add_u64(dst);
        dg.add_u64(src);
        dg.add_u16(msg_type);
        dg
    }

    /// Control header: `[1u8][CONTROL_MESSAGE][ctl_type][channel]`.
    pub fn control_header(ctl_type: u16, channel: Channel) -> Self {
        let mut dg = Self::new();
        dg.add_u8(1);
        dg.add_u64(CONTROL_MESSAGE);
        dg.add_u16(ctl_type);
        dg.add_u64(channel);
        dg
    }

    /// External (client-facing) header: just the message type.
    pub fn client_header(msg_type: u16) -> Self {
        let mut dg = Self::new();
        dg.add_u16(msg_type);
        dg
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn add_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn add_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    /// 16-bit length-prefixed UTF-8 string.
    pub fn add_string(&mut self, v: &str) {
        debug_assert!(v.len() <= u16::MAX as usize);
        self.buf.put_u16_le(v.len() as u16);
        self.buf.put_slice(v.as_bytes());
    }

    /// 16-bit length-prefixed byte blob.
    pub fn add_blob(&mut self, v: &[u8]) {
        debug_assert!(v.len() <= u16::MAX as usize);
        self.buf.put_u16_le(v.len() as u16);
        self.buf.put_slice(v);
    }

    /// Raw bytes, no prefix. Used to splice pre-packed payloads.
    pub fn add_raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Zero padding, `n` bytes.
    pub fn pad_bytes(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Freeze into an immutable frame body (no length prefix).
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn iter(&self) -> DatagramIter<'_> {
        DatagramIter::new(&self.buf)
    }
}

impl From<Bytes> for Datagram {
    fn from(b: Bytes) -> Self {
        Self { buf: BytesMut::from(&b[..]) }
    }
}

impl From<&[u8]> for Datagram {
    fn from(b: &[u8]) -> Self {
        Self { buf: BytesMut::from(b) }
    }
}

/// A reading cursor over a received datagram.
#[derive(Debug, Clone)]
pub struct DatagramIter<'a> {
    buf: &'a [u8],
}

impl<'a> DatagramIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n - self.buf.remaining(),
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_blob()?;
        Ok(String::from_utf8(bytes)?)
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        self.need(len)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Everything left in the cursor, consumed.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.buf.remaining()];
        self.buf.copy_to_slice(&mut out);
        out
    }

    /// Everything left, without consuming.
    pub fn peek_remaining(&self) -> &'a [u8] {
        self.buf
    }
}
