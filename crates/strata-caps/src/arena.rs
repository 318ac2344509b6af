//! Client-wide capability slot table
//!
//! Each capability is referenced by both its inode's cap set and its
//! session's cap list; the record itself lives in one stable slot here
//! and both sides store the slot index. Records are small and copied
//! out for reading; all mutation happens under the owning inode's lock.

/// Index into the capability table
pub type CapSlot = usize;

/// One capability record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cap {
    pub ino: u64,
    /// Issuing authority
    pub mds: u32,
    /// Bits currently granted by the authority
    pub issued: u32,
    /// Bits we have actually applied; a superset of `issued` while a
    /// revocation is draining
    pub implemented: u32,
    pub seq: u32,
    /// Migration sequence, monotone per inode
    pub mseq: u32,
    /// Session generation this cap was issued under
    pub gen: u32,
}

impl Cap {
    /// Bits the authority wants back that we have not yet released
    #[must_use]
    pub fn revoking(&self) -> u32 {
        self.implemented & !self.issued
    }
}

/// Stable slot table for capability records
#[derive(Debug, Default)]
pub struct CapTable {
    slots: Vec<Option<Cap>>,
    free: Vec<CapSlot>,
}

impl CapTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&mut self, cap: Cap) -> CapSlot {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(cap);
                slot
            }
            None => {
                self.slots.push(Some(cap));
                self.slots.len() - 1
            }
        }
    }

    #[must_use]
    pub fn get(&self, slot: CapSlot) -> Option<Cap> {
        self.slots.get(slot).copied().flatten()
    }

    /// Mutate a record in place
    pub fn update(&mut self, slot: CapSlot, f: impl FnOnce(&mut Cap)) {
        if let Some(Some(cap)) = self.slots.get_mut(slot) {
            f(cap);
        }
    }

    pub fn remove(&mut self, slot: CapSlot) -> Option<Cap> {
        let cap = self.slots.get_mut(slot)?.take();
        if cap.is_some() {
            self.free.push(slot);
        }
        cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(ino: u64, mds: u32) -> Cap {
        Cap {
            ino,
            mds,
            issued: 0,
            implemented: 0,
            seq: 0,
            mseq: 0,
            gen: 0,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let mut t = CapTable::new();
        let a = t.insert(cap(1, 0));
        let b = t.insert(cap(2, 1));
        assert_ne!(a, b);
        assert_eq!(t.get(a).unwrap().ino, 1);
        assert_eq!(t.len(), 2);

        assert_eq!(t.remove(a).unwrap().ino, 1);
        assert_eq!(t.get(a), None);
        assert_eq!(t.remove(a), None);

        // slot is recycled
        let c = t.insert(cap(3, 0));
        assert_eq!(c, a);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_update_in_place() {
        let mut t = CapTable::new();
        let s = t.insert(cap(1, 0));
        t.update(s, |c| c.issued = 0xf);
        assert_eq!(t.get(s).unwrap().issued, 0xf);
    }

    #[test]
    fn test_revoking_bits() {
        let mut c = cap(1, 0);
        c.implemented = 0b1111;
        c.issued = 0b0011;
        assert_eq!(c.revoking(), 0b1100);
    }
}
