//! Per-inode capability state

use crate::arena::CapSlot;
use crate::bits::{
    caps_for_mode, CAP_EXCL, CAP_RD, CAP_RDCACHE, CAP_WR, CAP_WRBUFFER, FILE_MODE_NUM,
};
use crate::snap::{CapSnap, SnapContext};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use strata_common::Timespec;

/// Cap bits parked while an inode's authority migrates.
///
/// Set by an export notice; cleared by the matching import (or any
/// import with a higher migration sequence).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportingCaps {
    pub mds: u32,
    pub mseq: u32,
    pub issued: u32,
}

/// Mutable inode state, guarded by the inode lock
#[derive(Debug)]
pub struct InodeState {
    /// Authority id -> capability slot, kept in authority order
    pub caps: BTreeMap<u32, CapSlot>,
    /// Cap bits that apply to snapshotted (read-only) views
    pub snap_caps: u32,
    /// Migration scratch state
    pub exporting: Option<ExportingCaps>,

    /// Snapshotted states pending flush, oldest first
    pub cap_snaps: VecDeque<CapSnap>,
    /// Realm arena slot, present while we hold any cap
    pub realm: Option<usize>,
    /// Context new buffered writes are accounted to
    pub head_context: Option<SnapContext>,

    pub size: u64,
    /// Largest size the authority authorized us to write to
    pub max_size: u64,
    /// Size last reported to the authority
    pub reported_size: u64,
    /// Offset we would like to write up to
    pub wanted_max_size: u64,
    /// Ceiling we last asked the authority for
    pub requested_max_size: u64,
    /// Pending local truncation target
    pub truncate_to: Option<u64>,

    pub mtime: Timespec,
    pub atime: Timespec,
    pub ctime: Timespec,
    pub time_warp_seq: u64,

    /// Held references per capability class
    pub rd_ref: u32,
    pub rdcache_ref: u32,
    pub wr_ref: u32,
    pub wrbuffer_ref: u32,
    /// Portion of `wrbuffer_ref` accounted to the head context
    pub wrbuffer_ref_head: u32,

    /// Open file counts by mode
    pub nr_by_mode: [u32; FILE_MODE_NUM],

    /// Defer cap release until this instant, to coalesce releases
    pub hold_until: Option<Instant>,
    /// Inode is pinned in cache while any authority has caps on it
    pub pinned: bool,
}

impl InodeState {
    fn new() -> Self {
        Self {
            caps: BTreeMap::new(),
            snap_caps: 0,
            exporting: None,
            cap_snaps: VecDeque::new(),
            realm: None,
            head_context: None,
            size: 0,
            max_size: 0,
            reported_size: 0,
            wanted_max_size: 0,
            requested_max_size: 0,
            truncate_to: None,
            mtime: Timespec::default(),
            atime: Timespec::default(),
            ctime: Timespec::default(),
            time_warp_seq: 0,
            rd_ref: 0,
            rdcache_ref: 0,
            wr_ref: 0,
            wrbuffer_ref: 0,
            wrbuffer_ref_head: 0,
            nr_by_mode: [0; FILE_MODE_NUM],
            hold_until: None,
            pinned: false,
        }
    }

    /// Bits in active use, from the reference counters
    #[must_use]
    pub fn used(&self) -> u32 {
        let mut used = 0;
        if self.rd_ref > 0 {
            used |= CAP_RD;
        }
        if self.rdcache_ref > 0 {
            used |= CAP_RDCACHE;
        }
        if self.wr_ref > 0 {
            used |= CAP_WR;
        }
        if self.wrbuffer_ref > 0 {
            used |= CAP_WRBUFFER;
        }
        used
    }

    /// Bits wanted by virtue of open file modes
    #[must_use]
    pub fn file_wanted(&self) -> u32 {
        let mut want = 0;
        for (mode, count) in self.nr_by_mode.iter().enumerate() {
            if *count > 0 {
                want |= caps_for_mode(mode);
            }
        }
        want
    }

    /// Bits wanted overall: open modes plus whatever is in use; dirty
    /// buffers additionally ask for exclusive metadata ownership.
    #[must_use]
    pub fn wanted(&self) -> u32 {
        let mut w = self.file_wanted() | self.used();
        if w & CAP_WRBUFFER != 0 {
            w |= CAP_EXCL;
        }
        w
    }

    /// A capture still waiting for its sync writes to finish
    #[must_use]
    pub fn have_pending_cap_snap(&self) -> bool {
        self.cap_snaps.back().is_some_and(|cs| cs.writing)
    }
}

/// An inode as the capability subsystem sees it
#[derive(Debug)]
pub struct Inode {
    pub ino: u64,
    pub state: Mutex<InodeState>,
    /// Woken on grants, truncations and cap-snap drains
    pub wq: Condvar,
}

impl Inode {
    #[must_use]
    pub fn new(ino: u64) -> Self {
        Self {
            ino,
            state: Mutex::new(InodeState::new()),
            wq: Condvar::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::FILE_MODE_RDWR;

    #[test]
    fn test_used_tracks_refs() {
        let mut st = InodeState::new();
        assert_eq!(st.used(), 0);
        st.rd_ref = 1;
        st.wrbuffer_ref = 2;
        assert_eq!(st.used(), CAP_RD | CAP_WRBUFFER);
    }

    #[test]
    fn test_wanted_adds_excl_for_dirty() {
        let mut st = InodeState::new();
        st.nr_by_mode[FILE_MODE_RDWR] = 1;
        assert_eq!(st.wanted() & CAP_EXCL, 0);
        st.wrbuffer_ref = 1;
        assert_ne!(st.wanted() & CAP_EXCL, 0);
    }

    #[test]
    fn test_pending_cap_snap() {
        let mut st = InodeState::new();
        assert!(!st.have_pending_cap_snap());
        st.cap_snaps.push_back(CapSnap {
            follows: 1,
            issued: 0,
            size: 0,
            mtime: Timespec::default(),
            atime: Timespec::default(),
            ctime: Timespec::default(),
            time_warp_seq: 0,
            context: SnapContext::empty(),
            writing: true,
            dirty: 0,
            sent: false,
        });
        assert!(st.have_pending_cap_snap());
    }
}
