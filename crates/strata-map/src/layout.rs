//! File striping and object placement arithmetic
//!
//! A file is striped in `stripe_unit` chunks across `stripe_count`
//! objects at a time; every `object_size / stripe_unit` stripes start a
//! new object set. Objects then hash into placement groups, which the
//! placement engine maps to targets.

use strata_common::{PgId, Result, Error, PG_TYPE_REP};
use strata_crush::hash::hash32_2;

/// An object within a file: inode plus block number
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub ino: u64,
    pub bno: u32,
}

/// A contiguous byte range within one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectExtent {
    pub oid: ObjectId,
    /// Offset within the object
    pub off: u64,
    /// Bytes of the file extent landing in this object
    pub len: u64,
}

/// How a file's bytes spread over objects and placement groups
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileLayout {
    pub stripe_unit: u32,
    pub stripe_count: u32,
    pub object_size: u32,
    /// Replica count for this file's placement groups
    pub pg_size: u8,
    /// Preferred primary target, negative for none
    pub preferred: i16,
    pub pg_type: u8,
}

impl Default for FileLayout {
    fn default() -> Self {
        Self {
            stripe_unit: 1 << 20,
            stripe_count: 1,
            object_size: 4 << 20,
            pg_size: 2,
            preferred: -1,
            pg_type: PG_TYPE_REP,
        }
    }
}

impl FileLayout {
    /// Check the structural constraints
    pub fn validate(&self) -> Result<()> {
        if self.stripe_unit == 0 || self.stripe_count == 0 || self.object_size == 0 {
            return Err(Error::bad_encoding("zero field in file layout"));
        }
        if self.object_size % self.stripe_unit != 0 {
            return Err(Error::bad_encoding(
                "stripe unit does not divide object size",
            ));
        }
        Ok(())
    }

    /// Map the head of the file extent `off..off+len` onto the object
    /// holding it. Returns the extent covered; callers advance by
    /// `extent.len` and repeat for long ranges.
    #[must_use]
    pub fn first_extent(&self, ino: u64, off: u64, len: u64) -> ObjectExtent {
        let su = u64::from(self.stripe_unit);
        let sc = u64::from(self.stripe_count);
        let osize = u64::from(self.object_size);
        let su_per_object = osize / su;
        let stripe_len = su * sc;

        let bl = off / su;
        let stripeno = bl / sc;
        let stripepos = bl % sc;
        let objsetno = stripeno / su_per_object;
        let bno = (objsetno * sc + stripepos) as u32;

        let oxoff = (stripeno % su_per_object) * su + off % su;
        let mut oxlen = len.min(su - off % su);

        // extend over later stripe units of the same object
        let mut t = len;
        while t > stripe_len && oxoff + oxlen < osize {
            t -= stripe_len;
            oxlen += t.min(su);
        }

        ObjectExtent {
            oid: ObjectId { ino, bno },
            off: oxoff,
            len: oxlen.min(len),
        }
    }

    /// Placement group for an object under this layout.
    ///
    /// The seed mixes the block number with a hash of the inode halves;
    /// the placement mask is applied by the map when choosing targets.
    #[must_use]
    pub fn object_to_pg(&self, oid: ObjectId) -> PgId {
        let ps = oid
            .bno
            .wrapping_add(hash32_2(oid.ino as u32, (oid.ino >> 32) as u32));
        PgId::new(ps, self.preferred, self.pg_size, self.pg_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targetmap::tests::test_map;

    fn layout() -> FileLayout {
        FileLayout {
            stripe_unit: 4096,
            stripe_count: 2,
            object_size: 16384,
            ..FileLayout::default()
        }
    }

    #[test]
    fn test_validate() {
        layout().validate().unwrap();
        let mut bad = layout();
        bad.stripe_unit = 4095;
        assert!(bad.validate().is_err());
        bad.stripe_unit = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_first_extent_simple() {
        let l = layout();
        // first stripe unit of the file is the head of object 0
        let e = l.first_extent(0x10, 0, 4096);
        assert_eq!(e.oid, ObjectId { ino: 0x10, bno: 0 });
        assert_eq!(e.off, 0);
        assert_eq!(e.len, 4096);

        // second stripe unit strikes object 1
        let e = l.first_extent(0x10, 4096, 100);
        assert_eq!(e.oid.bno, 1);
        assert_eq!(e.off, 0);
        assert_eq!(e.len, 100);
    }

    #[test]
    fn test_extent_within_object_advances() {
        let l = layout();
        // third stripe unit wraps back to object 0 at offset su
        let e = l.first_extent(0x10, 8192, 4096);
        assert_eq!(e.oid.bno, 0);
        assert_eq!(e.off, 4096);
        assert_eq!(e.len, 4096);
    }

    #[test]
    fn test_extent_clipped_at_stripe_unit() {
        let l = layout();
        // a write crossing a stripe-unit boundary is clipped to it
        let e = l.first_extent(0x10, 1000, 8000);
        assert_eq!(e.oid.bno, 0);
        assert_eq!(e.off, 1000);
        assert_eq!(e.len, 3096);
    }

    #[test]
    fn test_new_object_set() {
        let l = layout();
        // 4 su per object x 2 objects = 8 stripe units per set
        let set_bytes = 8 * 4096;
        let e = l.first_extent(0x10, set_bytes as u64, 10);
        assert_eq!(e.oid.bno, 2);
        assert_eq!(e.off, 0);
    }

    #[test]
    fn test_object_to_pg_deterministic() {
        let l = layout();
        let oid = ObjectId { ino: 0x42, bno: 7 };
        let pg = l.object_to_pg(oid);
        assert_eq!(pg, l.object_to_pg(oid));
        assert_eq!(pg.size(), l.pg_size);
        assert_eq!(pg.pg_type(), PG_TYPE_REP);
        // different blocks land in different groups (usually)
        let other = l.object_to_pg(ObjectId { ino: 0x42, bno: 8 });
        assert_ne!(pg.ps(), other.ps());
    }

    #[test]
    fn test_end_to_end_resolution() {
        // object id -> pg -> target set, all client-side
        let map = test_map();
        let l = FileLayout {
            pg_size: 3,
            ..FileLayout::default()
        };
        let e = l.first_extent(0xbeef, 0, 4096);
        let pg = l.object_to_pg(e.oid);
        let targets = map.pg_to_targets(pg).unwrap();
        assert_eq!(targets.len(), 3);
    }
}
