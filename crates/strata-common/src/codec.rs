//! Little-endian wire codec helpers
//!
//! All cluster state travels as packed little-endian structures with
//! length-prefixed variable sections. [`Decoder`] is a bounds-checked
//! cursor: every read validates the remaining input first and fails with
//! [`Error::BadEncoding`] without partial effects. [`Encoder`] is the
//! matching append-only writer.

use crate::error::{Error, Result};
use crate::types::{TargetAddr, Timespec, ADDR_WIRE_LEN};

/// Append-only little-endian writer
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Compact 8-byte timestamp used in cluster maps
    pub fn put_timespec(&mut self, t: Timespec) {
        self.put_u32(t.sec as u32);
        self.put_u32(t.nsec);
    }

    /// Wide 16-byte timestamp used in capability messages
    pub fn put_timespec_wide(&mut self, t: Timespec) {
        self.put_u64(t.sec);
        self.put_u32(t.nsec);
        self.put_u32(0);
    }

    pub fn put_addr(&mut self, a: TargetAddr) {
        self.put_u32(a.nonce);
        self.put_bytes(&a.ip);
        self.put_u16(a.port);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked little-endian reader
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail unless at least `n` bytes remain
    pub fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::BadEncoding(format!(
                "need {n} bytes, {} remain",
                self.remaining()
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// A `u32` length prefix followed by that many raw bytes
    pub fn get_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_timespec(&mut self) -> Result<Timespec> {
        let sec = u64::from(self.get_u32()?);
        let nsec = self.get_u32()?;
        Ok(Timespec { sec, nsec })
    }

    pub fn get_timespec_wide(&mut self) -> Result<Timespec> {
        let sec = self.get_u64()?;
        let nsec = self.get_u32()?;
        self.skip(4)?; // pad
        Ok(Timespec { sec, nsec })
    }

    pub fn get_addr(&mut self) -> Result<TargetAddr> {
        let nonce = self.get_u32()?;
        let ip: [u8; 4] = self.take(4)?.try_into().unwrap();
        let port = self.get_u16()?;
        Ok(TargetAddr { nonce, ip, port })
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Fail if any input is left over (for self-terminating structures)
    pub fn expect_end(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::BadEncoding(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

const _: () = assert!(ADDR_WIRE_LEN == 10);
