//! Monitor map
//!
//! The small, rarely-changing list of monitor daemons. Encoded form is
//! self-describing; decoders consume the entire buffer and reject
//! anything left over.

use strata_common::{Decoder, Encoder, Epoch, Error, Fsid, Result, TargetAddr};

/// One monitor instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonInst {
    pub rank: u32,
    pub addr: TargetAddr,
}

/// The monitor cluster map
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonMap {
    pub fsid: Fsid,
    pub epoch: Epoch,
    pub mons: Vec<MonInst>,
}

impl MonMap {
    /// Build a fresh map from monitor addresses, ranks in order
    #[must_use]
    pub fn new(fsid: Fsid, addrs: &[TargetAddr]) -> Self {
        Self {
            fsid,
            epoch: 1,
            mons: addrs
                .iter()
                .enumerate()
                .map(|(rank, addr)| MonInst {
                    rank: rank as u32,
                    addr: *addr,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mons.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mons.is_empty()
    }

    /// True if `addr` belongs to a monitor in this map
    #[must_use]
    pub fn contains(&self, addr: &TargetAddr) -> bool {
        self.mons.iter().any(|m| m.addr == *addr)
    }

    /// Address of the monitor at `rank`
    pub fn addr_of(&self, rank: u32) -> Result<TargetAddr> {
        self.mons
            .iter()
            .find(|m| m.rank == rank)
            .map(|m| m.addr)
            .ok_or_else(|| Error::not_found(format!("monitor rank {rank}")))
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(32 + self.mons.len() * 14);
        enc.put_u64(self.fsid.major);
        enc.put_u64(self.fsid.minor);
        enc.put_u32(self.epoch);
        enc.put_u32(self.mons.len() as u32);
        for m in &self.mons {
            enc.put_u32(m.rank);
            enc.put_addr(m.addr);
        }
        enc.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let fsid = Fsid::new(dec.get_u64()?, dec.get_u64()?);
        let epoch = dec.get_u32()?;
        let num = dec.get_u32()? as usize;
        let mut mons = Vec::with_capacity(num);
        for _ in 0..num {
            mons.push(MonInst {
                rank: dec.get_u32()?,
                addr: dec.get_addr()?,
            });
        }
        dec.expect_end()?;
        Ok(Self { fsid, epoch, mons })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MonMap {
        let addrs: Vec<TargetAddr> = ["10.0.0.1:6789", "10.0.0.2:6789", "10.0.0.3:6789"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        MonMap::new(Fsid::new(0xaa, 0xbb), &addrs)
    }

    #[test]
    fn test_roundtrip() {
        let m = sample();
        let bytes = m.encode();
        assert_eq!(MonMap::decode(&bytes).unwrap(), m);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample().encode();
        bytes.push(0);
        assert!(MonMap::decode(&bytes).is_err());
    }

    #[test]
    fn test_contains_and_rank() {
        let m = sample();
        assert!(m.contains(&"10.0.0.2:6789".parse().unwrap()));
        assert!(!m.contains(&"10.9.9.9:6789".parse().unwrap()));
        assert_eq!(
            m.addr_of(1).unwrap(),
            "10.0.0.2:6789".parse::<TargetAddr>().unwrap()
        );
        assert!(m.addr_of(9).unwrap_err().is_not_found());
    }
}
