//! Capability wire messages
//!
//! Packed little-endian layout: `op u32 | seq u32 | migrate_seq u32 |
//! caps u32 | wanted u32 | ino u64 | size u64 | max_size u64 |
//! snap_follows u64 | mtime 16 | atime 16 | ctime 16 | time_warp_seq
//! u64`, followed by an optional snap-trace blob running to the end of
//! the message.

use strata_common::{Decoder, Encoder, Error, Result, Timespec};

/// Capability message operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapOp {
    /// Authority -> client: new (possibly narrower) issued set
    Grant = 1,
    /// Client -> authority: echo of implemented bits
    Ack = 2,
    /// Client -> authority: dropping unwanted caps
    Release = 3,
    /// Authority -> client: cap state fully flushed, forget it
    Released = 4,
    /// Authority -> client: file truncated
    Trunc = 5,
    /// Client -> authority: snapshotted metadata flush
    FlushSnap = 6,
    /// Authority -> client: snap flush is durable
    FlushedSnap = 7,
    /// Authority -> client: cap migrating away from this authority
    Export = 8,
    /// Authority -> client: cap arriving at this authority
    Import = 9,
}

impl CapOp {
    pub fn from_wire(v: u32) -> Result<Self> {
        Ok(match v {
            1 => Self::Grant,
            2 => Self::Ack,
            3 => Self::Release,
            4 => Self::Released,
            5 => Self::Trunc,
            6 => Self::FlushSnap,
            7 => Self::FlushedSnap,
            8 => Self::Export,
            9 => Self::Import,
            other => return Err(Error::bad_encoding(format!("unknown cap op {other}"))),
        })
    }
}

/// One capability message, either direction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapMessage {
    pub op: CapOp,
    pub seq: u32,
    pub mseq: u32,
    /// Issued (authority->client) or implemented (client->authority) bits
    pub caps: u32,
    pub wanted: u32,
    pub ino: u64,
    pub size: u64,
    pub max_size: u64,
    pub snap_follows: u64,
    pub mtime: Timespec,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub time_warp_seq: u64,
    /// Realm hierarchy update riding along (may be empty)
    pub snap_trace: Vec<u8>,
}

impl CapMessage {
    /// Minimal message carrying only op/ino/seq
    #[must_use]
    pub fn bare(op: CapOp, ino: u64, seq: u32) -> Self {
        Self {
            op,
            seq,
            mseq: 0,
            caps: 0,
            wanted: 0,
            ino,
            size: 0,
            max_size: 0,
            snap_follows: 0,
            mtime: Timespec::default(),
            atime: Timespec::default(),
            ctime: Timespec::default(),
            time_warp_seq: 0,
            snap_trace: Vec::new(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(108 + self.snap_trace.len());
        enc.put_u32(self.op as u32);
        enc.put_u32(self.seq);
        enc.put_u32(self.mseq);
        enc.put_u32(self.caps);
        enc.put_u32(self.wanted);
        enc.put_u64(self.ino);
        enc.put_u64(self.size);
        enc.put_u64(self.max_size);
        enc.put_u64(self.snap_follows);
        enc.put_timespec_wide(self.mtime);
        enc.put_timespec_wide(self.atime);
        enc.put_timespec_wide(self.ctime);
        enc.put_u64(self.time_warp_seq);
        enc.put_bytes(&self.snap_trace);
        enc.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let op = CapOp::from_wire(dec.get_u32()?)?;
        let seq = dec.get_u32()?;
        let mseq = dec.get_u32()?;
        let caps = dec.get_u32()?;
        let wanted = dec.get_u32()?;
        let ino = dec.get_u64()?;
        let size = dec.get_u64()?;
        let max_size = dec.get_u64()?;
        let snap_follows = dec.get_u64()?;
        let mtime = dec.get_timespec_wide()?;
        let atime = dec.get_timespec_wide()?;
        let ctime = dec.get_timespec_wide()?;
        let time_warp_seq = dec.get_u64()?;
        let snap_trace = dec.get_bytes(dec.remaining())?.to_vec();
        Ok(Self {
            op,
            seq,
            mseq,
            caps,
            wanted,
            ino,
            size,
            max_size,
            snap_follows,
            mtime,
            atime,
            ctime,
            time_warp_seq,
            snap_trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{CAP_RD, CAP_WR};

    #[test]
    fn test_roundtrip() {
        let msg = CapMessage {
            op: CapOp::Grant,
            seq: 9,
            mseq: 2,
            caps: CAP_RD | CAP_WR,
            wanted: CAP_RD,
            ino: 0x1000,
            size: 4096,
            max_size: 1 << 20,
            snap_follows: 100,
            mtime: Timespec::new(10, 1),
            atime: Timespec::new(11, 2),
            ctime: Timespec::new(12, 3),
            time_warp_seq: 5,
            snap_trace: vec![1, 2, 3],
        };
        let bytes = msg.encode();
        assert_eq!(CapMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_fixed_header_size() {
        let bytes = CapMessage::bare(CapOp::Release, 1, 1).encode();
        // 5 u32s + 4 u64s + 3 wide timestamps + trailing u64
        assert_eq!(bytes.len(), 20 + 32 + 48 + 8);
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = CapMessage::bare(CapOp::Grant, 1, 1).encode();
        assert!(CapMessage::decode(&bytes[..30]).is_err());
    }

    #[test]
    fn test_unknown_op_rejected() {
        let mut bytes = CapMessage::bare(CapOp::Grant, 1, 1).encode();
        bytes[0] = 0xee;
        assert!(CapMessage::decode(&bytes).is_err());
    }
}
