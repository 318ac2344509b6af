//! Incremental target-map deltas
//!
//! The monitor publishes each new epoch as a compact delta against the
//! previous one. Epochs are dense: a delta built on epoch `e` targets
//! exactly `e + 1`; anything else is rejected and the caller must fetch
//! a full map. A delta may instead embed a complete map, which
//! short-circuits everything else.

use crate::targetmap::{TargetMap, TARGET_UP};
use strata_common::{
    Decoder, Encoder, Epoch, Error, Fsid, Result, TargetAddr, TargetId, Timespec,
};
use strata_crush::CrushMap;
use tracing::{debug, warn};

/// A delta between two successive map epochs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Incremental {
    pub fsid: Fsid,
    /// The epoch this delta produces
    pub epoch: Epoch,
    pub ctime: Timespec,
    /// New flag word, or negative for no change
    pub new_flags: i32,
    /// Embedded full map; when present everything else is ignored
    pub full_map: Option<Vec<u8>>,
    /// Replacement placement topology blob
    pub new_crush: Option<Vec<u8>>,
    /// New target-array capacity, or negative for no change
    pub new_max_target: i32,

    /// Targets coming up, with their fresh addresses
    pub new_up: Vec<(TargetId, TargetAddr)>,
    /// Targets going down; the byte is the clean-shutdown flag
    pub new_down: Vec<(TargetId, u8)>,
    /// Per-target offload updates
    pub new_offload: Vec<(TargetId, u32)>,
    /// Liveness assertions: target was alive through an epoch
    pub new_alive_thru: Vec<(TargetId, Epoch)>,

    /// Preferred-primary overrides added or replaced (raw pg, target)
    pub new_swap_primary: Vec<(u64, TargetId)>,
    /// Preferred-primary overrides removed (raw pg)
    pub old_swap_primary: Vec<u64>,
}

impl Incremental {
    /// Empty delta advancing `map` by one epoch
    #[must_use]
    pub fn against(map: &TargetMap) -> Self {
        Self {
            fsid: map.fsid,
            epoch: map.epoch + 1,
            ctime: Timespec::now(),
            new_flags: -1,
            new_max_target: -1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(64);
        enc.put_u64(self.fsid.major);
        enc.put_u64(self.fsid.minor);
        enc.put_u32(self.epoch);
        enc.put_timespec(self.ctime);
        enc.put_i32(self.new_flags);

        match &self.full_map {
            Some(m) => {
                enc.put_u32(m.len() as u32);
                enc.put_bytes(m);
                // a full map supersedes the rest; nothing else encoded
                return enc.into_bytes();
            }
            None => enc.put_u32(0),
        }

        match &self.new_crush {
            Some(c) => {
                enc.put_u32(c.len() as u32);
                enc.put_bytes(c);
            }
            None => enc.put_u32(0),
        }
        enc.put_i32(self.new_max_target);

        enc.put_u32(self.new_up.len() as u32);
        for (t, addr) in &self.new_up {
            enc.put_u32(*t);
            enc.put_addr(*addr);
        }
        enc.put_u32(self.new_down.len() as u32);
        for (t, clean) in &self.new_down {
            enc.put_u32(*t);
            enc.put_u8(*clean);
        }
        enc.put_u32(self.new_offload.len() as u32);
        for (t, off) in &self.new_offload {
            enc.put_u32(*t);
            enc.put_u32(*off);
        }
        enc.put_u32(self.new_alive_thru.len() as u32);
        for (t, e) in &self.new_alive_thru {
            enc.put_u32(*t);
            enc.put_u32(*e);
        }

        enc.put_u32(self.new_swap_primary.len() as u32);
        for (pg, t) in &self.new_swap_primary {
            enc.put_u64(*pg);
            enc.put_u32(*t);
        }
        enc.put_u32(self.old_swap_primary.len() as u32);
        for pg in &self.old_swap_primary {
            enc.put_u64(*pg);
        }
        enc.into_bytes()
    }
}

impl TargetMap {
    /// Apply an encoded delta, producing the next epoch's map.
    ///
    /// The receiver is never mutated; errors leave the caller holding
    /// its current map.
    pub fn apply_incremental(&self, buf: &[u8]) -> Result<TargetMap> {
        self.apply_incremental_with(buf, &mut |_| {})
    }

    /// As [`Self::apply_incremental`]; `mark_dead` is invoked with each
    /// address whose peer should be dropped (targets going down, or
    /// replaced addresses of targets coming back up).
    pub fn apply_incremental_with(
        &self,
        buf: &[u8],
        mark_dead: &mut dyn FnMut(TargetAddr),
    ) -> Result<TargetMap> {
        let mut dec = Decoder::new(buf);
        let fsid = Fsid::new(dec.get_u64()?, dec.get_u64()?);
        let epoch = dec.get_u32()?;
        let ctime = dec.get_timespec()?;
        let new_flags = dec.get_i32()?;

        if fsid != self.fsid {
            return Err(Error::bad_encoding(format!(
                "delta for cluster {fsid}, map is {}",
                self.fsid
            )));
        }
        if epoch != self.epoch + 1 {
            return Err(Error::EpochStale {
                have: self.epoch,
                delta: epoch,
            });
        }

        // full map embedded?
        let full = dec.get_blob()?;
        if !full.is_empty() {
            debug!(epoch, len = full.len(), "delta carries a full map");
            return TargetMap::decode(full);
        }

        let crush_blob = dec.get_blob()?;
        let new_crush = if crush_blob.is_empty() {
            None
        } else {
            Some(CrushMap::decode(crush_blob)?)
        };
        let new_max = dec.get_i32()?;

        let mut map = self.clone();
        map.epoch = epoch;
        map.mtime = ctime;
        if new_flags >= 0 {
            map.flags = new_flags as u32;
        }
        if let Some(crush) = new_crush {
            map.crush = crush;
        }
        if new_max >= 0 {
            map.set_max_target(new_max as usize);
        }

        let ups = dec.get_u32()?;
        for _ in 0..ups {
            let t = dec.get_u32()?;
            let addr = dec.get_addr()?;
            if t as usize >= map.max_target() {
                return Err(Error::bad_encoding(format!("up target {t} out of range")));
            }
            debug!(target = t, %addr, "target up");
            let old = map.addr[t as usize];
            if !old.is_blank() && old != addr {
                mark_dead(old);
            }
            map.state[t as usize] |= TARGET_UP;
            map.addr[t as usize] = addr;
            map.up_from[t as usize] = epoch;
        }

        let downs = dec.get_u32()?;
        for _ in 0..downs {
            let t = dec.get_u32()?;
            let clean = dec.get_u8()?;
            debug!(target = t, clean, "target down");
            if (t as usize) < map.max_target() {
                map.state[t as usize] &= !TARGET_UP;
                mark_dead(map.addr[t as usize]);
            } else {
                warn!(target = t, "down notice for unknown target");
            }
        }

        let offloads = dec.get_u32()?;
        for _ in 0..offloads {
            let t = dec.get_u32()? as usize;
            let off = dec.get_u32()?;
            if t < map.crush.device_offload.len() {
                map.crush.device_offload[t] = off;
            }
        }

        let alives = dec.get_u32()?;
        for _ in 0..alives {
            let t = dec.get_u32()? as usize;
            let e = dec.get_u32()?;
            if t < map.max_target() {
                map.up_thru[t] = e;
            }
        }

        let new_swaps = dec.get_u32()?;
        for _ in 0..new_swaps {
            let pg = dec.get_u64()?;
            let t = dec.get_u32()?;
            match map.swap_primary.iter_mut().find(|(p, _)| *p == pg) {
                Some(entry) => entry.1 = t,
                None => map.swap_primary.push((pg, t)),
            }
        }
        let old_swaps = dec.get_u32()?;
        for _ in 0..old_swaps {
            let pg = dec.get_u64()?;
            map.swap_primary.retain(|(p, _)| *p != pg);
        }

        dec.expect_end()?;
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targetmap::tests::test_map;

    #[test]
    fn test_happy_path_delta() {
        // epoch 5 map; bring target 7 up at a new address, take 3 down
        let mut map = test_map();
        map.epoch = 5;

        let mut delta = Incremental::against(&map);
        assert_eq!(delta.epoch, 6);
        let addr7: TargetAddr = "10.0.0.7:6800".parse().unwrap();
        delta.new_up.push((7, addr7));
        delta.new_down.push((3, 1));

        let next = map.apply_incremental(&delta.encode()).unwrap();
        assert_eq!(next.epoch, 6);
        assert!(next.is_up(7));
        assert_eq!(next.target_addr(7).unwrap(), addr7);
        assert_eq!(next.up_from[7], 6);
        assert!(!next.is_up(3));
        // everything else preserved
        assert!(next.is_up(0));
        assert_eq!(next.pg_num, map.pg_num);
        assert_eq!(next.crush, map.crush);
        // source map untouched
        assert_eq!(map.epoch, 5);
        assert!(map.is_up(3));
    }

    #[test]
    fn test_epoch_gap_rejected() {
        let map = test_map();
        let mut delta = Incremental::against(&map);
        delta.epoch = map.epoch + 2;
        let err = map.apply_incremental(&delta.encode()).unwrap_err();
        assert!(matches!(err, Error::EpochStale { have: 1, delta: 3 }));

        let mut stale = Incremental::against(&map);
        stale.epoch = map.epoch;
        assert!(map.apply_incremental(&stale.encode()).is_err());
    }

    #[test]
    fn test_wrong_cluster_rejected() {
        let map = test_map();
        let mut delta = Incremental::against(&map);
        delta.fsid = Fsid::new(9, 9);
        assert!(map.apply_incremental(&delta.encode()).is_err());
    }

    #[test]
    fn test_full_map_short_circuit() {
        let map = test_map();
        let mut replacement = test_map();
        replacement.epoch = 2;
        replacement.flags = 0xf00;

        let mut delta = Incremental::against(&map);
        delta.full_map = Some(replacement.encode());
        let next = map.apply_incremental(&delta.encode()).unwrap();
        assert_eq!(next, replacement);
    }

    #[test]
    fn test_offload_and_alive_thru() {
        let map = test_map();
        let mut delta = Incremental::against(&map);
        delta.new_offload.push((2, 0x8000));
        delta.new_alive_thru.push((2, 1));
        let next = map.apply_incremental(&delta.encode()).unwrap();
        assert_eq!(next.offload(2), 0x8000);
        assert_eq!(next.up_thru[2], 1);
    }

    #[test]
    fn test_swap_primary_tables() {
        let map = test_map();
        let mut delta = Incremental::against(&map);
        delta.new_swap_primary.push((0xabc, 4));
        let next = map.apply_incremental(&delta.encode()).unwrap();
        assert_eq!(next.swap_primary, vec![(0xabc, 4)]);

        let mut drop = Incremental::against(&next);
        drop.old_swap_primary.push(0xabc);
        let last = next.apply_incremental(&drop.encode()).unwrap();
        assert!(last.swap_primary.is_empty());
    }

    #[test]
    fn test_mark_dead_hook() {
        let mut map = test_map();
        map.epoch = 5;
        let mut delta = Incremental::against(&map);
        let moved: TargetAddr = "10.1.1.1:6800".parse().unwrap();
        delta.new_up.push((2, moved)); // address change
        delta.new_down.push((3, 0));

        let mut dead = Vec::new();
        let next = map
            .apply_incremental_with(&delta.encode(), &mut |a| dead.push(a))
            .unwrap();
        assert!(next.is_up(2));
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0], map.target_addr(2).unwrap());
        assert_eq!(dead[1], map.target_addr(3).unwrap());
    }

    #[test]
    fn test_delta_roundtrip() {
        let map = test_map();
        let mut delta = Incremental::against(&map);
        delta.new_up.push((1, "10.2.0.1:6800".parse().unwrap()));
        delta.new_offload.push((0, 0x4000));
        delta.new_crush = Some(map.crush.encode());
        delta.new_max_target = 12;
        let bytes = delta.encode();
        // applying twice from the same base is deterministic
        let a = map.apply_incremental(&bytes).unwrap();
        let b = map.apply_incremental(&bytes).unwrap();
        assert_eq!(a.encode(), b.encode());
        assert_eq!(a.max_target(), 12);
    }

    #[test]
    fn test_truncated_delta_rejected() {
        let map = test_map();
        let mut delta = Incremental::against(&map);
        delta.new_up.push((1, "10.2.0.1:6800".parse().unwrap()));
        let bytes = delta.encode();
        assert!(map.apply_incremental(&bytes[..bytes.len() - 3]).is_err());
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(map.apply_incremental(&padded).is_err());
    }
}
