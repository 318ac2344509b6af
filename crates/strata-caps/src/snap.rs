//! Snapshot realms, contexts and snapped cap state
//!
//! Realms describe which snapshots apply to which inodes; they form a
//! tree grafted from "snap trace" blobs the authority attaches to cap
//! messages. Every mutation carries a snap context (the set of snaps in
//! effect) so the storage layer can copy-on-write. When a realm's
//! context changes under an inode with writes in flight, an immutable
//! [`CapSnap`] captures the pre-change state for later flushing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strata_common::{Decoder, Encoder, Error, Result, Timespec};
use tracing::{debug, trace};

/// The realm every inode falls into absent any snapshot state
pub const ROOT_REALM: u64 = 1;

#[derive(Debug, PartialEq, Eq)]
struct SnapContextData {
    seq: u64,
    /// Snap ids, sorted descending
    snaps: Vec<u64>,
}

/// Reference-counted set of snapshots in effect for a mutation.
///
/// Cheap to clone; shared between the inode head state, dirty data and
/// any cap snaps capturing it. Freed when the last holder drops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapContext(Arc<SnapContextData>);

impl SnapContext {
    #[must_use]
    pub fn new(seq: u64, mut snaps: Vec<u64>) -> Self {
        snaps.sort_unstable_by(|a, b| b.cmp(a));
        snaps.dedup();
        Self(Arc::new(SnapContextData { seq, snaps }))
    }

    /// Empty context: no snapshots exist
    #[must_use]
    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.0.seq
    }

    /// Snap ids, newest first
    #[must_use]
    pub fn snaps(&self) -> &[u64] {
        &self.0.snaps
    }

    /// True when both handles share one allocation
    #[must_use]
    pub fn same(&self, other: &SnapContext) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A node in the snapshot hierarchy
#[derive(Debug)]
pub struct SnapRealm {
    pub ino: u64,
    pub created: u64,
    pub seq: u64,
    /// Arena slot of the parent realm
    pub parent: Option<usize>,
    /// Snap id at which the current parent became the parent
    pub parent_since: u64,
    /// Snaps inherited from parents prior to `parent_since`
    pub prior_parent_snaps: Vec<u64>,
    /// Snaps specific to this realm
    pub snaps: Vec<u64>,
    /// Arena slots of child realms
    pub children: Vec<usize>,
    /// Current effective context, rebuilt on every graft
    pub cached_context: SnapContext,
    /// Members: inodes holding caps under this realm
    pub inodes_with_caps: Vec<u64>,
}

impl SnapRealm {
    fn new(ino: u64) -> Self {
        Self {
            ino,
            created: 0,
            seq: 0,
            parent: None,
            parent_since: 0,
            prior_parent_snaps: Vec::new(),
            snaps: Vec::new(),
            children: Vec::new(),
            cached_context: SnapContext::empty(),
            inodes_with_caps: Vec::new(),
        }
    }
}

/// One realm record in a snap trace blob
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RealmInfo {
    pub ino: u64,
    pub created: u64,
    pub seq: u64,
    pub parent: u64,
    pub parent_since: u64,
    pub prior_parent_snaps: Vec<u64>,
    pub snaps: Vec<u64>,
}

/// Encode a snap trace: the inode's realm first, ancestors after
#[must_use]
pub fn encode_snap_trace(realms: &[RealmInfo]) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(4 + realms.len() * 48);
    enc.put_u32(realms.len() as u32);
    for r in realms {
        enc.put_u64(r.ino);
        enc.put_u64(r.created);
        enc.put_u64(r.seq);
        enc.put_u64(r.parent);
        enc.put_u64(r.parent_since);
        enc.put_u32(r.prior_parent_snaps.len() as u32);
        for s in &r.prior_parent_snaps {
            enc.put_u64(*s);
        }
        enc.put_u32(r.snaps.len() as u32);
        for s in &r.snaps {
            enc.put_u64(*s);
        }
    }
    enc.into_bytes()
}

fn decode_snap_trace(buf: &[u8]) -> Result<Vec<RealmInfo>> {
    let mut dec = Decoder::new(buf);
    let count = dec.get_u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let mut info = RealmInfo {
            ino: dec.get_u64()?,
            created: dec.get_u64()?,
            seq: dec.get_u64()?,
            parent: dec.get_u64()?,
            parent_since: dec.get_u64()?,
            ..RealmInfo::default()
        };
        let n = dec.get_u32()? as usize;
        dec.need(n * 8)?;
        for _ in 0..n {
            info.prior_parent_snaps.push(dec.get_u64()?);
        }
        let n = dec.get_u32()? as usize;
        dec.need(n * 8)?;
        for _ in 0..n {
            info.snaps.push(dec.get_u64()?);
        }
        out.push(info);
    }
    dec.expect_end()?;
    Ok(out)
}

/// Slot-table arena holding the realm tree.
///
/// Parent and child links are slot indices, never references, so
/// grafting is pure index surgery under the caller's write lock.
#[derive(Debug, Default)]
pub struct RealmArena {
    slots: Vec<Option<SnapRealm>>,
    by_ino: HashMap<u64, usize>,
}

impl RealmArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&SnapRealm> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut SnapRealm> {
        self.slots.get_mut(slot)?.as_mut()
    }

    #[must_use]
    pub fn lookup(&self, ino: u64) -> Option<usize> {
        self.by_ino.get(&ino).copied()
    }

    /// Iterate live realms as (slot, realm)
    pub fn iter(&self) -> impl Iterator<Item = (usize, &SnapRealm)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i, r)))
    }

    /// Find or create the realm rooted at `ino`
    pub fn get_or_create(&mut self, ino: u64) -> usize {
        if let Some(slot) = self.lookup(ino) {
            return slot;
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.slots.push(None);
                self.slots.len() - 1
            });
        self.slots[slot] = Some(SnapRealm::new(ino));
        self.by_ino.insert(ino, slot);
        trace!(ino, slot, "created snap realm");
        slot
    }

    /// Graft a snap trace into the tree and rebuild the affected
    /// contexts. Returns the slot of the trace's first realm (the one
    /// the triggering inode lives in).
    pub fn update_snap_trace(&mut self, blob: &[u8]) -> Result<usize> {
        let infos = decode_snap_trace(blob)?;
        let first = infos
            .first()
            .ok_or_else(|| Error::bad_encoding("empty snap trace"))?;
        let first_slot = self.get_or_create(first.ino);

        for info in &infos {
            let slot = self.get_or_create(info.ino);
            let new_parent = if info.parent != 0 {
                Some(self.get_or_create(info.parent))
            } else {
                None
            };

            let realm = self.get_mut(slot).expect("just created");
            // traces may arrive out of order; never step backwards
            if info.seq < realm.seq {
                debug!(ino = info.ino, seq = info.seq, have = realm.seq, "stale realm record");
                continue;
            }
            realm.created = info.created;
            realm.seq = info.seq;
            realm.parent_since = info.parent_since;
            realm.prior_parent_snaps = info.prior_parent_snaps.clone();
            realm.snaps = info.snaps.clone();
            let old_parent = realm.parent;
            realm.parent = new_parent;

            if old_parent != new_parent {
                if let Some(p) = old_parent {
                    if let Some(pr) = self.get_mut(p) {
                        pr.children.retain(|c| *c != slot);
                    }
                }
                if let Some(p) = new_parent {
                    self.get_mut(p).expect("just created").children.push(slot);
                }
            }
        }

        // contexts depend on ancestors; rebuild every realm the trace
        // named, then their descendants
        for info in &infos {
            if let Some(slot) = self.lookup(info.ino) {
                self.rebuild_context(slot);
            }
        }
        Ok(first_slot)
    }

    /// Recompute the cached context of a realm and its subtree
    pub fn rebuild_context(&mut self, slot: usize) {
        let mut queue = VecDeque::from([slot]);
        while let Some(slot) = queue.pop_front() {
            let Some(realm) = self.get(slot) else { continue };
            let mut snaps = realm.snaps.clone();
            snaps.extend_from_slice(&realm.prior_parent_snaps);
            let mut seq = realm.seq;
            if let Some(parent) = realm.parent.and_then(|p| self.get(p)) {
                // parent context already reflects the whole ancestry
                snaps.extend_from_slice(parent.cached_context.snaps());
                seq = seq.max(parent.cached_context.seq());
            }
            let children = realm.children.clone();
            let ctx = SnapContext::new(seq, snaps);
            self.get_mut(slot).expect("present").cached_context = ctx;
            queue.extend(children);
        }
    }

    /// Record that `ino` holds caps under this realm
    pub fn add_inode(&mut self, slot: usize, ino: u64) {
        if let Some(realm) = self.get_mut(slot) {
            if !realm.inodes_with_caps.contains(&ino) {
                realm.inodes_with_caps.push(ino);
            }
        }
    }

    /// Drop `ino` from the realm's members; reaps the realm when
    /// nothing references it anymore.
    pub fn remove_inode(&mut self, slot: usize, ino: u64) {
        let Some(realm) = self.get_mut(slot) else { return };
        realm.inodes_with_caps.retain(|i| *i != ino);
        self.reap(slot);
    }

    /// Free a realm with no members and no children
    fn reap(&mut self, slot: usize) {
        let Some(realm) = self.get(slot) else { return };
        if !realm.inodes_with_caps.is_empty() || !realm.children.is_empty() {
            return;
        }
        let ino = realm.ino;
        let parent = realm.parent;
        self.slots[slot] = None;
        self.by_ino.remove(&ino);
        debug!(ino, slot, "reaped empty snap realm");
        if let Some(p) = parent {
            if let Some(pr) = self.get_mut(p) {
                pr.children.retain(|c| *c != slot);
            }
            self.reap(p);
        }
    }
}

/// Snapshotted cap state pending flush to the authority.
///
/// Created at a snapshot boundary while writes were in flight; flushed
/// once `writing` clears and `dirty` drains, removed when the authority
/// confirms with a flushed-snap message.
#[derive(Clone, Debug)]
pub struct CapSnap {
    /// Last snap id visible to the pre-change context
    pub follows: u64,
    pub issued: u32,
    pub size: u64,
    pub mtime: Timespec,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub time_warp_seq: u64,
    /// The pre-change context dirty data was written under
    pub context: SnapContext,
    /// A sync write against the old context is still in flight
    pub writing: bool,
    /// Dirty buffers still accounted to the old context
    pub dirty: u32,
    /// Sent to the authority, awaiting the flushed-snap ack
    pub sent: bool,
}

impl CapSnap {
    /// Ready once writes completed and dirty data drained
    #[must_use]
    pub fn ready(&self) -> bool {
        !self.writing && self.dirty == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(realms: &[RealmInfo]) -> Vec<u8> {
        encode_snap_trace(realms)
    }

    #[test]
    fn test_context_sorted_desc() {
        let ctx = SnapContext::new(5, vec![2, 9, 4, 9]);
        assert_eq!(ctx.snaps(), &[9, 4, 2]);
        assert_eq!(ctx.seq(), 5);
    }

    #[test]
    fn test_trace_roundtrip() {
        let infos = vec![
            RealmInfo {
                ino: 0x100,
                created: 1,
                seq: 7,
                parent: ROOT_REALM,
                parent_since: 3,
                prior_parent_snaps: vec![1, 2],
                snaps: vec![7],
            },
            RealmInfo {
                ino: ROOT_REALM,
                seq: 3,
                ..RealmInfo::default()
            },
        ];
        let decoded = decode_snap_trace(&trace(&infos)).unwrap();
        assert_eq!(decoded, infos);
        assert!(decode_snap_trace(&trace(&infos)[..10]).is_err());
    }

    #[test]
    fn test_graft_builds_contexts() {
        let mut arena = RealmArena::new();
        let blob = trace(&[
            RealmInfo {
                ino: 0x100,
                seq: 7,
                parent: ROOT_REALM,
                parent_since: 3,
                prior_parent_snaps: vec![2],
                snaps: vec![7],
                ..RealmInfo::default()
            },
            RealmInfo {
                ino: ROOT_REALM,
                seq: 5,
                snaps: vec![5],
                ..RealmInfo::default()
            },
        ]);
        let slot = arena.update_snap_trace(&blob).unwrap();
        let realm = arena.get(slot).unwrap();
        assert_eq!(realm.ino, 0x100);
        // own snap 7, prior-parent 2, parent's 5; seq is the max seen
        assert_eq!(realm.cached_context.snaps(), &[7, 5, 2]);
        assert_eq!(realm.cached_context.seq(), 7);

        let root = arena.get(arena.lookup(ROOT_REALM).unwrap()).unwrap();
        assert_eq!(root.children.len(), 1);
    }

    #[test]
    fn test_new_snap_propagates_to_children() {
        let mut arena = RealmArena::new();
        arena
            .update_snap_trace(&trace(&[
                RealmInfo {
                    ino: 0x100,
                    seq: 1,
                    parent: ROOT_REALM,
                    ..RealmInfo::default()
                },
                RealmInfo {
                    ino: ROOT_REALM,
                    seq: 1,
                    ..RealmInfo::default()
                },
            ]))
            .unwrap();

        // a snapshot lands on the root realm
        arena
            .update_snap_trace(&trace(&[RealmInfo {
                ino: ROOT_REALM,
                seq: 8,
                snaps: vec![8],
                ..RealmInfo::default()
            }]))
            .unwrap();

        let child = arena.get(arena.lookup(0x100).unwrap()).unwrap();
        assert_eq!(child.cached_context.seq(), 8);
        assert_eq!(child.cached_context.snaps(), &[8]);
    }

    #[test]
    fn test_stale_record_ignored() {
        let mut arena = RealmArena::new();
        arena
            .update_snap_trace(&trace(&[RealmInfo {
                ino: 0x100,
                seq: 9,
                snaps: vec![9],
                ..RealmInfo::default()
            }]))
            .unwrap();
        arena
            .update_snap_trace(&trace(&[RealmInfo {
                ino: 0x100,
                seq: 4,
                snaps: vec![4],
                ..RealmInfo::default()
            }]))
            .unwrap();
        let realm = arena.get(arena.lookup(0x100).unwrap()).unwrap();
        assert_eq!(realm.seq, 9);
        assert_eq!(realm.cached_context.snaps(), &[9]);
    }

    #[test]
    fn test_membership_and_reap() {
        let mut arena = RealmArena::new();
        let slot = arena.get_or_create(0x100);
        arena.add_inode(slot, 0xabc);
        arena.add_inode(slot, 0xabc);
        assert_eq!(arena.get(slot).unwrap().inodes_with_caps.len(), 1);
        arena.remove_inode(slot, 0xabc);
        assert!(arena.get(slot).is_none());
        assert_eq!(arena.lookup(0x100), None);
    }

    #[test]
    fn test_capsnap_ready() {
        let cs = CapSnap {
            follows: 100,
            issued: 0,
            size: 0,
            mtime: Timespec::default(),
            atime: Timespec::default(),
            ctime: Timespec::default(),
            time_warp_seq: 0,
            context: SnapContext::empty(),
            writing: true,
            dirty: 2,
            sent: false,
        };
        assert!(!cs.ready());
        let done = CapSnap {
            writing: false,
            dirty: 0,
            ..cs
        };
        assert!(done.ready());
    }
}
