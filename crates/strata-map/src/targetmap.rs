//! Target map: membership and placement state of the storage cluster
//!
//! Completely specifies the desired distribution of objects at one
//! point in time. Identified by a monotonically increasing epoch;
//! immutable once published. Placement-group counts carry derived
//! masks, the smallest `2^n - 1` at or above the count.

use strata_common::{
    Decoder, Encoder, Epoch, Error, Fsid, PgId, Result, TargetAddr, TargetId, Timespec,
};
use strata_crush::CrushMap;

/// Target state bit: daemon is up and serving
pub const TARGET_UP: u8 = 1;

/// The target cluster map
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetMap {
    pub fsid: Fsid,
    pub epoch: Epoch,
    pub ctime: Timespec,
    pub mtime: Timespec,

    pub pg_num: u32,
    pub pgp_num: u32,
    pub lpg_num: u32,
    pub lpgp_num: u32,
    pub pg_num_mask: u32,
    pub pgp_num_mask: u32,
    pub lpg_num_mask: u32,
    pub lpgp_num_mask: u32,
    /// Epoch of the last placement-group count change
    pub last_pg_change: Epoch,

    pub flags: u32,

    /// Per-target state bytes, addresses and liveness epochs, all sized
    /// by `max_target`
    pub state: Vec<u8>,
    pub addr: Vec<TargetAddr>,
    pub up_from: Vec<Epoch>,
    pub up_thru: Vec<Epoch>,

    /// Preferred-primary overrides: raw pg id to target
    pub swap_primary: Vec<(u64, TargetId)>,

    pub crush: CrushMap,
}

/// Bits needed to represent `t`
fn bits_of(t: u32) -> u32 {
    32 - t.leading_zeros()
}

/// Smallest `2^n - 1` at or above `n`
fn pg_mask(n: u32) -> u32 {
    if n == 0 {
        return 0;
    }
    (1u32 << bits_of(n - 1)).wrapping_sub(1)
}

impl TargetMap {
    /// Fresh map at epoch 1
    #[must_use]
    pub fn new(fsid: Fsid, pg_num: u32, max_target: usize, crush: CrushMap) -> Self {
        let now = Timespec::now();
        let mut map = Self {
            fsid,
            epoch: 1,
            ctime: now,
            mtime: now,
            pg_num,
            pgp_num: pg_num,
            lpg_num: pg_num,
            lpgp_num: pg_num,
            last_pg_change: 1,
            crush,
            ..Self::default()
        };
        map.calc_pg_masks();
        map.set_max_target(max_target);
        map
    }

    /// Recompute the derived pg masks
    pub fn calc_pg_masks(&mut self) {
        self.pg_num_mask = pg_mask(self.pg_num);
        self.pgp_num_mask = pg_mask(self.pgp_num);
        self.lpg_num_mask = pg_mask(self.lpg_num);
        self.lpgp_num_mask = pg_mask(self.lpgp_num);
    }

    #[must_use]
    pub fn max_target(&self) -> usize {
        self.state.len()
    }

    /// Grow (or shrink) the per-target arrays, preserving existing state
    pub fn set_max_target(&mut self, max: usize) {
        self.state.resize(max, 0);
        self.addr.resize(max, TargetAddr::default());
        self.up_from.resize(max, 0);
        self.up_thru.resize(max, 0);
    }

    /// True if the target exists and its UP bit is set
    #[must_use]
    pub fn is_up(&self, target: TargetId) -> bool {
        self.state
            .get(target as usize)
            .is_some_and(|s| s & TARGET_UP != 0)
    }

    /// Address of a target, if known
    #[must_use]
    pub fn target_addr(&self, target: TargetId) -> Option<TargetAddr> {
        self.addr.get(target as usize).copied()
    }

    /// Per-target in/out offload value
    #[must_use]
    pub fn offload(&self, target: TargetId) -> u32 {
        self.crush
            .device_offload
            .get(target as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Map a placement group to its ordered target set.
    ///
    /// Applies the placement mask to the pg seed, locates the rule for
    /// the pg's (ruleset, type, size) and runs the placement engine with
    /// the map's offload vector. A preferred target, when set, pins the
    /// first replica.
    pub fn pg_to_targets(&self, pg: PgId) -> Result<Vec<TargetId>> {
        let preferred = pg.preferred();
        let mask = if preferred >= 0 {
            self.lpgp_num_mask
        } else {
            self.pgp_num_mask
        };
        let ps = pg.ps() & mask;
        let rule = self
            .crush
            .find_rule(pg.pg_type(), pg.pg_type(), pg.size())
            .ok_or_else(|| {
                Error::not_found(format!(
                    "rule for type {} size {}",
                    pg.pg_type(),
                    pg.size()
                ))
            })?;
        let force = if preferred >= 0 {
            Some(preferred as u32)
        } else {
            None
        };
        let raw = self.crush.do_rule(
            rule,
            ps,
            pg.size() as usize,
            force,
            &self.crush.device_offload,
        )?;
        Ok(raw.into_iter().filter(|t| *t >= 0).map(|t| t as u32).collect())
    }

    /// As [`Self::pg_to_targets`], keeping only targets that are up
    pub fn pg_to_acting_targets(&self, pg: PgId) -> Result<Vec<TargetId>> {
        Ok(self
            .pg_to_targets(pg)?
            .into_iter()
            .filter(|t| self.is_up(*t))
            .collect())
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(128 + self.max_target() * 24);
        enc.put_u64(self.fsid.major);
        enc.put_u64(self.fsid.minor);
        enc.put_u32(self.epoch);
        enc.put_timespec(self.ctime);
        enc.put_timespec(self.mtime);
        enc.put_u32(self.pg_num);
        enc.put_u32(self.pgp_num);
        enc.put_u32(self.lpg_num);
        enc.put_u32(self.lpgp_num);
        enc.put_u32(self.last_pg_change);
        enc.put_u32(self.flags);

        let max = self.max_target();
        enc.put_u32(max as u32);
        enc.put_bytes(&self.state);
        for a in &self.addr {
            enc.put_addr(*a);
        }
        enc.put_u32(max as u32);
        for e in &self.up_from {
            enc.put_u32(*e);
        }
        enc.put_u32(max as u32);
        for e in &self.up_thru {
            enc.put_u32(*e);
        }

        enc.put_u32(self.swap_primary.len() as u32);
        for (pg, target) in &self.swap_primary {
            enc.put_u64(*pg);
            enc.put_u32(*target);
        }

        let crush = self.crush.encode();
        enc.put_u32(crush.len() as u32);
        enc.put_bytes(&crush);
        enc.into_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let mut map = Self {
            fsid: Fsid::new(dec.get_u64()?, dec.get_u64()?),
            epoch: dec.get_u32()?,
            ctime: dec.get_timespec()?,
            mtime: dec.get_timespec()?,
            pg_num: dec.get_u32()?,
            pgp_num: dec.get_u32()?,
            lpg_num: dec.get_u32()?,
            lpgp_num: dec.get_u32()?,
            last_pg_change: dec.get_u32()?,
            flags: dec.get_u32()?,
            ..Self::default()
        };
        map.calc_pg_masks();

        let max = dec.get_u32()? as usize;
        dec.need(max)?;
        map.state = dec.get_bytes(max)?.to_vec();
        map.addr = Vec::with_capacity(max);
        for _ in 0..max {
            map.addr.push(dec.get_addr()?);
        }
        for field in [&mut map.up_from, &mut map.up_thru] {
            let n = dec.get_u32()? as usize;
            if n != max {
                return Err(Error::bad_encoding(format!(
                    "liveness array of {n} entries, expected {max}"
                )));
            }
            dec.need(n * 4)?;
            for _ in 0..n {
                field.push(dec.get_u32()?);
            }
        }

        let swaps = dec.get_u32()? as usize;
        dec.need(swaps * 12)?;
        for _ in 0..swaps {
            let pg = dec.get_u64()?;
            let target = dec.get_u32()?;
            map.swap_primary.push((pg, target));
        }

        let crush = dec.get_blob()?;
        map.crush = CrushMap::decode(crush)?;
        Ok(map)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use strata_common::PG_TYPE_REP;
    use strata_crush::{BucketAlg, Rule, RuleMask, RuleStep, StepOp};

    /// Flat 8-device map with a replicated rule under ruleset 1
    pub(crate) fn test_map() -> TargetMap {
        let mut crush = CrushMap::new(8);
        let items: Vec<(i32, u32)> = (0..8).map(|d| (d, strata_crush::WEIGHT_IN)).collect();
        let root = crush.add_bucket(BucketAlg::Straw, 1, &items).unwrap();
        crush.add_rule(Rule {
            mask: RuleMask {
                ruleset: PG_TYPE_REP,
                rule_type: PG_TYPE_REP,
                min_size: 1,
                max_size: 4,
            },
            steps: vec![
                RuleStep {
                    op: StepOp::Take,
                    arg1: root,
                    arg2: 0,
                },
                RuleStep {
                    op: StepOp::ChooseFirstn,
                    arg1: 0,
                    arg2: 0,
                },
                RuleStep {
                    op: StepOp::Emit,
                    arg1: 0,
                    arg2: 0,
                },
            ],
        });
        crush.finalize();
        let mut map = TargetMap::new(Fsid::new(1, 2), 16, 8, crush);
        for t in 0..8u32 {
            map.state[t as usize] |= TARGET_UP;
            map.addr[t as usize] = TargetAddr {
                nonce: 0,
                ip: [10, 0, 0, t as u8],
                port: 6800,
            };
            map.up_from[t as usize] = 1;
        }
        map
    }

    #[test]
    fn test_pg_masks() {
        assert_eq!(pg_mask(16), 15);
        assert_eq!(pg_mask(17), 31);
        assert_eq!(pg_mask(1), 0);
        assert_eq!(pg_mask(0), 0);
        let map = test_map();
        assert_eq!(map.pg_num_mask, 15);
    }

    #[test]
    fn test_roundtrip() {
        let mut map = test_map();
        map.swap_primary.push((PgId::new(3, -1, 2, PG_TYPE_REP).raw(), 5));
        let bytes = map.encode();
        let back = TargetMap::decode(&bytes).unwrap();
        assert_eq!(back, map);
        assert_eq!(back.encode(), bytes);
    }

    #[test]
    fn test_truncation_rejected() {
        let bytes = test_map().encode();
        let map = test_map();
        for cut in [10, 50, bytes.len() - 2] {
            assert!(TargetMap::decode(&bytes[..cut]).is_err());
        }
        // and failure leaves nothing half-visible: decode returns by value
        assert_eq!(map.epoch, 1);
    }

    #[test]
    fn test_pg_to_targets() {
        let map = test_map();
        let pg = PgId::new(0x1234, -1, 3, PG_TYPE_REP);
        let targets = map.pg_to_targets(pg).unwrap();
        assert_eq!(targets.len(), 3);
        let distinct: std::collections::HashSet<_> = targets.iter().collect();
        assert_eq!(distinct.len(), 3);
        // deterministic
        assert_eq!(map.pg_to_targets(pg).unwrap(), targets);
    }

    #[test]
    fn test_acting_set_excludes_down() {
        let mut map = test_map();
        let pg = PgId::new(0x77, -1, 3, PG_TYPE_REP);
        let targets = map.pg_to_targets(pg).unwrap();
        map.state[targets[0] as usize] &= !TARGET_UP;
        let acting = map.pg_to_acting_targets(pg).unwrap();
        assert!(!acting.contains(&targets[0]));
        assert_eq!(acting.len(), 2);
    }

    #[test]
    fn test_up_and_addr() {
        let map = test_map();
        assert!(map.is_up(3));
        assert!(!map.is_up(99));
        assert_eq!(map.target_addr(3).unwrap().ip, [10, 0, 0, 3]);
        assert_eq!(map.offload(3), strata_crush::WEIGHT_IN);
    }
}
