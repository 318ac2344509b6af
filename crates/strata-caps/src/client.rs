//! The capability client: grants, revocations, migration, snap flushes
//!
//! Lock order, outermost first: realm arena write lock, inode table,
//! inode lock, session mutex; the cap slot table is only ever held for
//! a single read or write. Paths that need a session mutex while
//! holding an inode lock use try-lock and restart the walk on
//! contention, so the hierarchy is never inverted while blocking.

use crate::arena::{Cap, CapSlot, CapTable};
use crate::bits::{CAP_EXCL, CAP_RD, CAP_RDCACHE, CAP_WR, CAP_WRBUFFER};
use crate::inode::{ExportingCaps, Inode, InodeState};
use crate::message::{CapMessage, CapOp};
use crate::session::{Session, SessionState};
use crate::snap::{CapSnap, RealmArena, SnapContext, ROOT_REALM};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_common::{Error, Result};
use tracing::{debug, trace, warn};

/// Outbound half of the authority sessions
pub trait CapTransport: Send + Sync + 'static {
    /// Queue a capability message to an authority. Must not call back
    /// into the client.
    fn send_cap(&self, mds: u32, msg: CapMessage);
}

/// Client-side capability state across all inodes and authorities
pub struct CapClient<T: CapTransport> {
    transport: T,
    realms: RwLock<RealmArena>,
    table: Mutex<CapTable>,
    sessions: Vec<Arc<Session>>,
    inodes: Mutex<HashMap<u64, Arc<Inode>>>,
    /// Inodes with a deferred cap release, oldest hold first
    delay_list: Mutex<VecDeque<u64>>,
    session_ttl: Duration,
    /// Grace window that coalesces cap releases
    hold_delay: Duration,
}

impl<T: CapTransport> CapClient<T> {
    #[must_use]
    pub fn new(
        transport: T,
        num_authorities: u32,
        session_ttl: Duration,
        hold_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            realms: RwLock::new(RealmArena::new()),
            table: Mutex::new(CapTable::new()),
            sessions: (0..num_authorities)
                .map(|mds| Arc::new(Session::new(mds, session_ttl)))
                .collect(),
            inodes: Mutex::new(HashMap::new()),
            delay_list: Mutex::new(VecDeque::new()),
            session_ttl,
            hold_delay,
        })
    }

    /// Session with authority `mds`
    pub fn session(&self, mds: u32) -> Result<&Arc<Session>> {
        self.sessions
            .get(mds as usize)
            .ok_or_else(|| Error::not_found(format!("authority {mds}")))
    }

    /// The authority renewed our session lease
    pub fn renew_session(&self, mds: u32) -> Result<()> {
        self.session(mds)?.touch(self.session_ttl);
        Ok(())
    }

    /// The session lapsed: all its caps go stale in one generation bump
    pub fn session_timed_out(&self, mds: u32) -> Result<()> {
        self.session(mds)?.bump_gen();
        Ok(())
    }

    /// Find or create the inode
    pub fn inode(&self, ino: u64) -> Arc<Inode> {
        Arc::clone(
            self.inodes
                .lock()
                .entry(ino)
                .or_insert_with(|| Arc::new(Inode::new(ino))),
        )
    }

    #[must_use]
    pub fn lookup_inode(&self, ino: u64) -> Option<Arc<Inode>> {
        self.inodes.lock().get(&ino).cloned()
    }

    /// Drop an inode from the cache; refused while any authority still
    /// holds caps on it.
    pub fn evict_inode(&self, ino: u64) -> Result<()> {
        let mut inodes = self.inodes.lock();
        if let Some(inode) = inodes.get(&ino) {
            if inode.state.lock().pinned {
                return Err(Error::Retry(format!("inode {ino:x} holds caps")));
            }
            inodes.remove(&ino);
        }
        Ok(())
    }

    fn cap_get(&self, slot: CapSlot) -> Option<Cap> {
        self.table.lock().get(slot)
    }

    /// Snapshot of the cap record held from `mds`, for introspection
    #[must_use]
    pub fn cap_state(&self, inode: &Inode, mds: u32) -> Option<Cap> {
        let st = inode.state.lock();
        st.caps.get(&mds).and_then(|slot| self.cap_get(*slot))
    }

    // ---- cap bookkeeping ------------------------------------------------

    /// Install or refresh the cap issued by `mds`, grafting any
    /// attached snap trace first. Repeated calls for the same
    /// (inode, authority) update the existing record in place.
    pub fn add_cap(
        &self,
        ino: u64,
        mds: u32,
        fmode: Option<usize>,
        issued: u32,
        seq: u32,
        mseq: u32,
        snap_trace: &[u8],
    ) -> Result<()> {
        let session = Arc::clone(self.session(mds)?);

        let mut realms = self.realms.write();
        let realm_slot = if snap_trace.is_empty() {
            realms.get_or_create(ROOT_REALM)
        } else {
            realms.update_snap_trace(snap_trace)?
        };

        let inode = self.inode(ino);
        let mut st = inode.state.lock();
        debug!(ino, mds, caps = crate::bits::cap_string(issued), seq, "add cap");

        let gen = session.state.lock().gen;
        let slot = match st.caps.get(&mds) {
            Some(slot) => *slot,
            None => {
                let slot = self.table.lock().insert(Cap {
                    ino,
                    mds,
                    issued: 0,
                    implemented: 0,
                    seq,
                    mseq,
                    gen,
                });
                st.caps.insert(mds, slot);
                session.state.lock().caps.push(slot);
                if st.caps.len() == 1 {
                    st.pinned = true;
                }
                // a cap arriving from the exporting authority means the
                // migration raced; the scratch state is obsolete
                if st.exporting.is_some_and(|e| e.mds == mds) {
                    st.exporting = None;
                }
                slot
            }
        };

        if st.realm.is_none() {
            st.realm = Some(realm_slot);
            realms.add_inode(realm_slot, ino);
        }
        let ctx = realms
            .get(st.realm.expect("assigned above"))
            .map(|r| r.cached_context.clone());

        self.table.lock().update(slot, |c| {
            c.issued |= issued;
            c.implemented |= issued;
            c.seq = seq;
            c.mseq = mseq;
            c.gen = gen;
        });

        if let Some(mode) = fmode {
            st.nr_by_mode[mode] += 1;
        }
        if let Some(ctx) = ctx {
            let issued_now = self.issued_locked(&st);
            self.update_head_context_locked(&mut st, ctx, issued_now);
        }
        drop(st);
        inode.wq.notify_all();
        Ok(())
    }

    /// Drop the cap held from `mds`; returns true if it was the last
    /// one, in which case the inode loses its realm membership and pin.
    pub fn remove_cap(&self, inode: &Arc<Inode>, mds: u32) -> bool {
        let mut realms = self.realms.write();
        let mut st = inode.state.lock();
        self.remove_cap_locked(&mut realms, &mut st, inode.ino, mds)
    }

    fn remove_cap_locked(
        &self,
        realms: &mut RealmArena,
        st: &mut InodeState,
        ino: u64,
        mds: u32,
    ) -> bool {
        let Some(slot) = st.caps.remove(&mds) else {
            return false;
        };
        debug!(ino, mds, "remove cap");
        if let Some(session) = self.sessions.get(mds as usize) {
            session.state.lock().caps.retain(|s| *s != slot);
        }
        self.table.lock().remove(slot);
        if !st.caps.is_empty() {
            return false;
        }
        if let Some(realm) = st.realm.take() {
            realms.remove_inode(realm, ino);
        }
        st.pinned = false;
        true
    }

    /// Union of valid issued bits across authorities plus snap caps.
    /// Caps from a bumped or expired session generation contribute
    /// nothing.
    #[must_use]
    pub fn issued(&self, inode: &Inode) -> u32 {
        let st = inode.state.lock();
        self.issued_locked(&st)
    }

    fn issued_locked(&self, st: &InodeState) -> u32 {
        self.issued_and_implemented_locked(st).0
    }

    fn issued_and_implemented_locked(&self, st: &InodeState) -> (u32, u32) {
        let mut have = st.snap_caps;
        let mut implemented = 0;
        for (mds, slot) in &st.caps {
            let Some(cap) = self.cap_get(*slot) else {
                continue;
            };
            let (gen, expired) = self.sessions[*mds as usize].staleness();
            if cap.gen < gen || expired {
                trace!(ino = cap.ino, mds, "stale cap ignored");
                continue;
            }
            have |= cap.issued;
            implemented |= cap.implemented;
        }
        (have, implemented)
    }

    // ---- reference counting ---------------------------------------------

    /// Try to take references on `need` (all required) and `want`
    /// (taken opportunistically). A write past `endoff` beyond the
    /// authorized maximum is a range error; the caller must negotiate
    /// a larger ceiling first. Returns `None` when the caps are not
    /// currently available.
    pub fn get_cap_refs(
        &self,
        inode: &Inode,
        need: u32,
        want: u32,
        endoff: u64,
    ) -> Result<Option<u32>> {
        let mut st = inode.state.lock();
        if need & CAP_WR != 0 && endoff > st.max_size {
            return Err(Error::Range {
                offset: endoff,
                limit: st.max_size,
            });
        }
        self.try_get_refs_locked(&mut st, need, want)
    }

    fn try_get_refs_locked(
        &self,
        st: &mut InodeState,
        need: u32,
        want: u32,
    ) -> Result<Option<u32>> {
        if need & CAP_WR != 0 && st.have_pending_cap_snap() {
            // a capture is waiting for the previous writes to drain;
            // new writes must not slip in ahead of it
            return Ok(None);
        }
        let (have, implemented) = self.issued_and_implemented_locked(st);
        if have & need != need {
            return Ok(None);
        }
        // keep waiting on a wanted -> needed transition: bits still
        // draining from a revocation must not be re-taken
        let not = want & !(have & need);
        let revoking = implemented & !have;
        if revoking & not != 0 {
            return Ok(None);
        }
        let got = need | (have & want);
        Self::take_refs_locked(st, got);
        Ok(Some(got))
    }

    fn take_refs_locked(st: &mut InodeState, got: u32) {
        if got & CAP_RD != 0 {
            st.rd_ref += 1;
        }
        if got & CAP_RDCACHE != 0 {
            st.rdcache_ref += 1;
        }
        if got & CAP_WR != 0 {
            st.wr_ref += 1;
        }
        if got & CAP_WRBUFFER != 0 {
            st.wrbuffer_ref += 1;
            st.wrbuffer_ref_head += 1;
        }
    }

    /// Release references taken with [`Self::get_cap_refs`]. Dropping
    /// the last writer finalizes any capture waiting on sync writes.
    pub fn put_cap_refs(&self, inode: &Arc<Inode>, had: u32) {
        let mut last = false;
        let mut flush = false;
        let mut wake = false;
        {
            let mut st = inode.state.lock();
            if had & CAP_RD != 0 {
                st.rd_ref = st.rd_ref.saturating_sub(1);
                last |= st.rd_ref == 0;
            }
            if had & CAP_RDCACHE != 0 {
                st.rdcache_ref = st.rdcache_ref.saturating_sub(1);
                last |= st.rdcache_ref == 0;
            }
            if had & CAP_WRBUFFER != 0 {
                st.wrbuffer_ref = st.wrbuffer_ref.saturating_sub(1);
                st.wrbuffer_ref_head = st.wrbuffer_ref_head.saturating_sub(1);
                last |= st.wrbuffer_ref == 0;
            }
            if had & CAP_WR != 0 {
                st.wr_ref = st.wr_ref.saturating_sub(1);
                if st.wr_ref == 0 {
                    last = true;
                    // the last sync write against any captured context
                    // has now completed
                    for cs in st.cap_snaps.iter_mut() {
                        if cs.writing {
                            cs.writing = false;
                            wake = true;
                            if cs.ready() {
                                flush = true;
                            }
                        }
                    }
                }
            }
        }
        trace!(ino = inode.ino, had, last, "put cap refs");
        if flush {
            self.flush_snaps(inode);
        } else if last {
            self.check_caps(inode, false);
        }
        if wake {
            inode.wq.notify_all();
        }
    }

    /// Release `nr` buffered-write references accounted to `snapc`.
    /// Draining the last dirty data of a captured context makes that
    /// capture flushable.
    pub fn put_wrbuffer_cap_refs(&self, inode: &Arc<Inode>, nr: u32, snapc: &SnapContext) {
        let mut last = false;
        let mut flush = false;
        {
            let mut st = inode.state.lock();
            st.wrbuffer_ref = st.wrbuffer_ref.saturating_sub(nr);
            last = st.wrbuffer_ref == 0;
            let head = st
                .head_context
                .as_ref()
                .is_some_and(|h| h.same(snapc) || h == snapc);
            if head {
                st.wrbuffer_ref_head = st.wrbuffer_ref_head.saturating_sub(nr);
            } else if let Some(cs) = st
                .cap_snaps
                .iter_mut()
                .find(|cs| cs.context.same(snapc) || cs.context == *snapc)
            {
                cs.dirty = cs.dirty.saturating_sub(nr);
                if cs.ready() {
                    flush = true;
                }
            } else {
                warn!(ino = inode.ino, "wrbuffer release against unknown context");
            }
        }
        if last {
            self.check_caps(inode, false);
        } else if flush {
            self.flush_snaps(inode);
            inode.wq.notify_all();
        }
    }

    /// Block until the needed caps are granted, negotiating a larger
    /// max size when the write end offset requires one.
    pub fn wait_for_caps(
        &self,
        inode: &Arc<Inode>,
        need: u32,
        want: u32,
        endoff: u64,
        timeout: Duration,
    ) -> Result<u32> {
        let deadline = Instant::now() + timeout;
        let mut requested = false;
        let mut st = inode.state.lock();
        loop {
            if need & CAP_WR != 0 && endoff > st.max_size {
                if !requested {
                    if endoff > st.wanted_max_size {
                        st.wanted_max_size = endoff;
                    }
                    drop(st);
                    self.check_caps(inode, false);
                    requested = true;
                    st = inode.state.lock();
                    continue;
                }
            } else if let Some(got) = self.try_get_refs_locked(&mut st, need, want)? {
                return Ok(got);
            }
            if inode.wq.wait_until(&mut st, deadline).timed_out() {
                return Err(Error::Timeout(format!(
                    "caps {} on {:x}",
                    crate::bits::cap_string(need),
                    inode.ino
                )));
            }
        }
    }

    /// Ask the authority to extend the write ceiling past `endoff`
    pub fn request_max_size(&self, inode: &Arc<Inode>, endoff: u64) {
        {
            let mut st = inode.state.lock();
            if endoff <= st.wanted_max_size {
                return;
            }
            st.wanted_max_size = endoff;
        }
        self.check_caps(inode, false);
    }

    // ---- the reconciler -------------------------------------------------

    /// Examine used versus wanted versus held caps and release, flush
    /// or acknowledge to the authorities as appropriate. Plain calls
    /// defer pure releases through the delayed list to coalesce them;
    /// the delayed worker passes `is_delayed` to push them out.
    pub fn check_caps(&self, inode: &Arc<Inode>, is_delayed: bool) {
        if !inode.state.lock().cap_snaps.is_empty() {
            self.flush_snaps(inode);
        }

        // progress watermark over authority ids, so a restarted walk
        // never reconsiders an authority already serviced
        let mut checked: i64 = -1;
        'restart: loop {
            let mut st = inode.state.lock();
            let wanted = st.wanted();
            let used = st.used();
            trace!(
                ino = inode.ino,
                wanted = crate::bits::cap_string(wanted),
                used = crate::bits::cap_string(used),
                "check caps"
            );
            if !is_delayed {
                self.cap_delay_requeue_locked(&mut st, inode.ino);
            }

            let caps: Vec<(u32, CapSlot)> = st.caps.iter().map(|(m, s)| (*m, *s)).collect();
            for (mds, slot) in caps {
                if i64::from(mds) <= checked {
                    continue;
                }
                let Some(cap) = self.cap_get(slot) else {
                    continue;
                };
                let revoking = cap.revoking();

                let mut ack = false;
                // request a larger max size?
                if st.wanted_max_size > st.max_size
                    && st.wanted_max_size > st.requested_max_size
                {
                    ack = true;
                }
                // approaching the authorized ceiling?
                if !ack
                    && cap.issued & CAP_WR != 0
                    && (st.size << 1) >= st.max_size
                    && (st.reported_size << 1) < st.max_size
                {
                    ack = true;
                }
                // completed a revocation?
                if !ack && revoking != 0 && revoking & used == 0 {
                    debug!(ino = inode.ino, mds, revoking, "revocation drained");
                    ack = true;
                }
                if !ack {
                    if cap.issued & !wanted == 0 {
                        continue; // nothing extra, all good
                    }
                    // release, unless still inside the grace window
                    if st.hold_until.is_some_and(|h| Instant::now() < h) {
                        trace!(ino = inode.ino, "delaying cap release");
                        continue;
                    }
                }

                let session = Arc::clone(&self.sessions[mds as usize]);
                let Some(mut sguard) = session.state.try_lock() else {
                    drop(st);
                    // wait for the holder, then restart the walk
                    drop(session.state.lock());
                    continue 'restart;
                };
                checked = i64::from(mds);
                self.send_cap_locked(inode, &mut st, &session, &mut sguard, slot, used, wanted);
                continue 'restart;
            }
            return;
        }
    }

    /// Emit an ack/release for one cap. Narrows `issued` to the wanted
    /// set, completes a drained revocation, and reports sizes and
    /// times. Caller holds the inode lock and the session mutex.
    #[allow(clippy::too_many_arguments)]
    fn send_cap_locked(
        &self,
        inode: &Inode,
        st: &mut InodeState,
        session: &Session,
        sguard: &mut SessionState,
        slot: CapSlot,
        used: u32,
        wanted: u32,
    ) {
        let Some(mut cap) = self.cap_get(slot) else {
            return;
        };
        let revoking = cap.revoking();
        let op = if wanted == 0 {
            CapOp::Release
        } else {
            CapOp::Ack
        };

        cap.issued &= wanted; // drop bits nobody wants
        let mut wake = false;
        if revoking != 0 && revoking & used == 0 {
            cap.implemented = cap.issued;
            wake = true;
        }
        self.table.lock().update(slot, |c| *c = cap);

        st.reported_size = st.size;
        let max_size = st.wanted_max_size;
        st.requested_max_size = max_size;
        let follows = st.head_context.as_ref().map_or(0, SnapContext::seq);
        sguard.seq += 1;

        debug!(
            ino = inode.ino,
            mds = session.mds,
            keep = crate::bits::cap_string(cap.issued),
            wanted = crate::bits::cap_string(wanted),
            ?op,
            "send cap"
        );
        self.transport.send_cap(
            session.mds,
            CapMessage {
                op,
                seq: cap.seq,
                mseq: cap.mseq,
                caps: cap.issued,
                wanted,
                ino: inode.ino,
                size: st.size,
                max_size,
                snap_follows: follows,
                mtime: st.mtime,
                atime: st.atime,
                ctime: st.ctime,
                time_warp_seq: st.time_warp_seq,
                snap_trace: Vec::new(),
            },
        );
        if wake {
            inode.wq.notify_all();
        }
    }

    // ---- delayed release ------------------------------------------------

    fn cap_delay_requeue_locked(&self, st: &mut InodeState, ino: u64) {
        st.hold_until = Some(Instant::now() + self.hold_delay);
        let mut dl = self.delay_list.lock();
        dl.retain(|i| *i != ino);
        dl.push_back(ino);
    }

    /// Periodic worker: push out releases whose grace window expired
    pub fn check_delayed_caps(&self) {
        let now = Instant::now();
        loop {
            let Some(ino) = self.delay_list.lock().pop_front() else {
                return;
            };
            let Some(inode) = self.lookup_inode(ino) else {
                continue;
            };
            let hold = inode.state.lock().hold_until;
            if hold.is_some_and(|h| h > now) {
                // list is hold-ordered: nothing further is due either
                self.delay_list.lock().push_front(ino);
                return;
            }
            debug!(ino, "delayed cap check");
            self.check_caps(&inode, true);
        }
    }

    // ---- snapshots ------------------------------------------------------

    /// Graft a snap trace into the realm tree, then refresh the head
    /// context of every member inode, capturing pre-change state for
    /// inodes with writes in flight.
    pub fn apply_snap_trace(&self, trace: &[u8]) -> Result<()> {
        let mut guard = self.realms.write();
        let realms = &mut *guard;
        realms.update_snap_trace(trace)?;

        let updates: Vec<(u64, SnapContext)> = realms
            .iter()
            .flat_map(|(_, realm)| {
                realm
                    .inodes_with_caps
                    .iter()
                    .map(|ino| (*ino, realm.cached_context.clone()))
            })
            .collect();

        for (ino, ctx) in updates {
            if let Some(inode) = self.lookup_inode(ino) {
                let mut st = inode.state.lock();
                let issued_now = self.issued_locked(&st);
                self.update_head_context_locked(&mut st, ctx, issued_now);
            }
        }
        Ok(())
    }

    /// Move the inode to a newer snap context, capturing the old one
    /// if dirty state still references it.
    fn update_head_context_locked(
        &self,
        st: &mut InodeState,
        new_ctx: SnapContext,
        issued_now: u32,
    ) {
        match &st.head_context {
            Some(old) if old.seq() < new_ctx.seq() => {
                if st.wr_ref > 0 || st.wrbuffer_ref_head > 0 {
                    let cs = CapSnap {
                        follows: old.seq(),
                        issued: issued_now,
                        size: st.size,
                        mtime: st.mtime,
                        atime: st.atime,
                        ctime: st.ctime,
                        time_warp_seq: st.time_warp_seq,
                        context: old.clone(),
                        writing: st.wr_ref > 0,
                        dirty: st.wrbuffer_ref_head,
                        sent: false,
                    };
                    debug!(
                        follows = cs.follows,
                        dirty = cs.dirty,
                        writing = cs.writing,
                        "queued cap snap"
                    );
                    st.cap_snaps.push_back(cs);
                    st.wrbuffer_ref_head = 0;
                }
                st.head_context = Some(new_ctx);
            }
            Some(_) => {}
            None => st.head_context = Some(new_ctx),
        }
    }

    /// Authority holding this inode, preferring one issued writable
    /// caps. Returns (mds, migrate seq).
    fn write_auth_locked(&self, st: &InodeState) -> Option<(u32, u32)> {
        let mut found = None;
        for (mds, slot) in &st.caps {
            let Some(cap) = self.cap_get(*slot) else {
                continue;
            };
            found = Some((*mds, cap.mseq));
            if cap.issued & (CAP_WR | CAP_WRBUFFER | CAP_EXCL) != 0 {
                break;
            }
        }
        found
    }

    /// Flush ready cap snaps, oldest first. A capture still writing,
    /// still dirty, or sent-but-unacknowledged blocks everything
    /// younger; flushes are strictly ordered by `follows` per inode.
    pub fn flush_snaps(&self, inode: &Arc<Inode>) {
        // pass-local progress mark; never step backwards in the queue
        let mut watermark = 0u64;
        'restart: loop {
            let mut st = inode.state.lock();
            let mut pick = None;
            for (i, cs) in st.cap_snaps.iter().enumerate() {
                if cs.writing || cs.dirty > 0 || cs.sent {
                    break;
                }
                if cs.follows <= watermark {
                    continue;
                }
                pick = Some(i);
                break;
            }
            let Some(i) = pick else { return };
            let Some((mds, mseq)) = self.write_auth_locked(&st) else {
                // no cap anywhere; the next add_cap retriggers the flush
                return;
            };
            let session = Arc::clone(&self.sessions[mds as usize]);
            let Some(mut sguard) = session.state.try_lock() else {
                drop(st);
                drop(session.state.lock());
                continue 'restart;
            };

            let cs = &mut st.cap_snaps[i];
            cs.sent = true;
            watermark = cs.follows;
            sguard.seq += 1;
            debug!(ino = inode.ino, mds, follows = cs.follows, "flush snap");
            self.transport.send_cap(
                mds,
                CapMessage {
                    op: CapOp::FlushSnap,
                    seq: 0,
                    mseq,
                    caps: cs.issued,
                    wanted: 0,
                    ino: inode.ino,
                    size: cs.size,
                    max_size: 0,
                    snap_follows: cs.follows,
                    mtime: cs.mtime,
                    atime: cs.atime,
                    ctime: cs.ctime,
                    time_warp_seq: cs.time_warp_seq,
                    snap_trace: Vec::new(),
                },
            );
        }
    }

    // ---- message handling -----------------------------------------------

    /// Dispatch an incoming capability message from authority `mds`
    pub fn handle_caps(&self, mds: u32, msg: &CapMessage) -> Result<()> {
        let session = Arc::clone(self.session(mds)?);
        debug!(mds, op = ?msg.op, ino = msg.ino, "handle caps");

        let Some(inode) = self.lookup_inode(msg.ino) else {
            // no local state; the authority can forget about us
            debug!(ino = msg.ino, "unknown inode, releasing");
            self.transport
                .send_cap(mds, CapMessage::bare(CapOp::Release, msg.ino, msg.seq));
            return Ok(());
        };

        match msg.op {
            CapOp::Grant => self.handle_grant(&inode, &session, msg),
            CapOp::Trunc => self.handle_trunc(&inode, msg),
            CapOp::Released => {
                self.remove_cap(&inode, mds);
            }
            CapOp::FlushedSnap => self.handle_flushedsnap(&inode, msg),
            CapOp::Export => self.handle_export(&inode, mds, msg),
            CapOp::Import => {
                self.handle_import(&inode, mds, msg)?;
                // we may owe the old authority a release
                self.check_caps(&inode, true);
            }
            CapOp::Ack | CapOp::Release | CapOp::FlushSnap => {
                return Err(Error::bad_encoding(format!(
                    "client-side op {:?} from authority {mds}",
                    msg.op
                )));
            }
        }
        Ok(())
    }

    /// A grant is also how the authority revokes: a narrower issued
    /// set leaves `implemented` behind until local use drains.
    fn handle_grant(&self, inode: &Arc<Inode>, session: &Arc<Session>, msg: &CapMessage) {
        let mds = session.mds;
        let mut st = inode.state.lock();
        let Some(&slot) = st.caps.get(&mds) else {
            // never answer cap messages out of turn; replying to an
            // instance we do not hold would confuse the authority
            debug!(ino = inode.ino, mds, "grant for cap we do not hold");
            return;
        };
        let gen = session.state.lock().gen;
        let Some(cap) = self.cap_get(slot) else { return };
        let newcaps = msg.caps;

        // metadata updates ride along on every grant
        if msg.time_warp_seq >= st.time_warp_seq {
            st.time_warp_seq = msg.time_warp_seq;
            st.mtime = msg.mtime;
            st.atime = msg.atime;
            st.ctime = msg.ctime;
        }
        if cap.issued & (CAP_WR | CAP_WRBUFFER | CAP_EXCL) == 0 && msg.size != st.size {
            st.size = msg.size;
            st.reported_size = msg.size;
        }

        let mut wake = false;
        if msg.max_size != st.max_size {
            debug!(ino = inode.ino, from = st.max_size, to = msg.max_size, "max size");
            st.max_size = msg.max_size;
            if msg.max_size >= st.wanted_max_size {
                st.wanted_max_size = 0;
                st.requested_max_size = 0;
            }
            wake = true;
        }

        let used = st.used();
        self.table.lock().update(slot, |c| {
            c.seq = msg.seq;
            c.gen = gen;
        });

        if cap.issued & !newcaps != 0 {
            // revocation
            debug!(
                ino = inode.ino,
                from = crate::bits::cap_string(cap.issued),
                to = crate::bits::cap_string(newcaps),
                "revoking"
            );
            if used & !newcaps == 0 {
                // not using what is being taken back: ack right away
                self.table.lock().update(slot, |c| {
                    c.issued = newcaps;
                    c.implemented = newcaps;
                });
                let follows = st.head_context.as_ref().map_or(0, SnapContext::seq);
                let wanted = st.wanted();
                st.reported_size = st.size;
                self.transport.send_cap(
                    mds,
                    CapMessage {
                        op: CapOp::Ack,
                        seq: msg.seq,
                        mseq: cap.mseq,
                        caps: newcaps,
                        wanted,
                        ino: inode.ino,
                        size: st.size,
                        max_size: 0,
                        snap_follows: follows,
                        mtime: st.mtime,
                        atime: st.atime,
                        ctime: st.ctime,
                        time_warp_seq: st.time_warp_seq,
                        snap_trace: Vec::new(),
                    },
                );
                wake = true;
            } else {
                // keep implemented wide until the bits drain; the ack
                // goes out from check_caps when the last ref drops
                self.table.lock().update(slot, |c| c.issued = newcaps);
            }
        } else if cap.issued != newcaps {
            debug!(
                ino = inode.ino,
                from = crate::bits::cap_string(cap.issued),
                to = crate::bits::cap_string(newcaps),
                "grant"
            );
            // add bits only, to avoid stepping on a pending revocation
            self.table.lock().update(slot, |c| {
                c.issued = newcaps;
                c.implemented |= newcaps;
            });
            wake = true;
        }
        drop(st);
        if wake {
            inode.wq.notify_all();
        }
    }

    /// Truncation notice. Shrinks take effect in the bookkeeping
    /// immediately; the actual data drop runs as a background job the
    /// integration layer collects with [`Self::take_pending_truncate`].
    fn handle_trunc(&self, inode: &Arc<Inode>, msg: &CapMessage) {
        let mut st = inode.state.lock();
        let size = msg.size;
        if st.truncate_to.is_none() && size > st.size {
            debug!(ino = inode.ino, size, "clean forward truncate");
        } else if st.truncate_to.is_some_and(|t| size >= t) {
            debug!(ino = inode.ino, size, "truncate already queued");
        } else {
            debug!(ino = inode.ino, from = st.size, to = size, "queueing truncate");
            st.truncate_to = Some(size);
        }
        st.size = size;
        st.reported_size = size;
        drop(st);
        inode.wq.notify_all();
    }

    /// Claim the queued background truncation, if any
    #[must_use]
    pub fn take_pending_truncate(&self, inode: &Inode) -> Option<u64> {
        inode.state.lock().truncate_to.take()
    }

    /// The cap is migrating away from `mds`. Park the issued bits in
    /// the inode until the new authority imports them.
    fn handle_export(&self, inode: &Arc<Inode>, mds: u32, msg: &CapMessage) {
        let mut realms = self.realms.write();
        let mut st = inode.state.lock();

        let mut remember = true;
        let mut exported = None;
        for (m, slot) in &st.caps {
            let Some(cap) = self.cap_get(*slot) else {
                continue;
            };
            if cap.mseq > msg.mseq {
                // a newer migration already happened elsewhere
                remember = false;
            }
            if *m == mds {
                exported = Some(cap);
            }
        }
        match exported {
            Some(cap) => {
                if remember {
                    st.exporting = Some(ExportingCaps {
                        mds,
                        mseq: msg.mseq,
                        issued: cap.issued,
                    });
                }
                debug!(ino = inode.ino, mds, mseq = msg.mseq, "cap exported");
                self.remove_cap_locked(&mut realms, &mut st, inode.ino, mds);
            }
            None => warn!(ino = inode.ino, mds, "export for cap we do not hold"),
        }
    }

    /// The cap arrived at a new authority. Clears older export scratch
    /// and installs the cap under the importer.
    fn handle_import(&self, inode: &Arc<Inode>, mds: u32, msg: &CapMessage) -> Result<()> {
        {
            let mut st = inode.state.lock();
            match st.exporting {
                Some(e) if e.mseq < msg.mseq => {
                    debug!(
                        ino = inode.ino,
                        mds,
                        mseq = msg.mseq,
                        cleared = e.mds,
                        "import clears exporting state"
                    );
                    st.exporting = None;
                }
                _ => {}
            }
        }
        self.add_cap(
            inode.ino,
            mds,
            None,
            msg.caps,
            msg.seq,
            msg.mseq,
            &msg.snap_trace,
        )
    }

    /// A snap flush became durable; the capture can be dropped and the
    /// next one unblocks.
    fn handle_flushedsnap(&self, inode: &Arc<Inode>, msg: &CapMessage) {
        {
            let mut st = inode.state.lock();
            let Some(pos) = st
                .cap_snaps
                .iter()
                .position(|cs| cs.follows == msg.snap_follows)
            else {
                debug!(ino = inode.ino, follows = msg.snap_follows, "no such capture");
                return;
            };
            let cs = st.cap_snaps.remove(pos).expect("position valid");
            if cs.writing || cs.dirty > 0 {
                warn!(ino = inode.ino, follows = cs.follows, "ack for busy capture");
            }
            debug!(ino = inode.ino, follows = cs.follows, "cap snap flushed");
            // capture's context reference drops here
        }
        self.flush_snaps(inode);
        inode.wq.notify_all();
    }

    // ---- session shutdown -----------------------------------------------

    /// On session close, push out pending snap flushes and writable
    /// cap state for every inode held under `mds`.
    pub fn flush_write_caps(&self, mds: u32) -> Result<()> {
        let session = Arc::clone(self.session(mds)?);
        let slots: Vec<CapSlot> = session.state.lock().caps.clone();
        debug!(mds, caps = slots.len(), "flushing write caps");
        for slot in slots {
            let Some(cap) = self.cap_get(slot) else {
                continue;
            };
            let Some(inode) = self.lookup_inode(cap.ino) else {
                continue;
            };
            self.flush_snaps(&inode);
            if cap.implemented & (CAP_WR | CAP_WRBUFFER) == 0 {
                continue;
            }
            loop {
                let mut st = inode.state.lock();
                let used = st.used();
                let wanted = st.wanted();
                if used != 0 || wanted != 0 {
                    warn!(ino = cap.ino, used, wanted, "residual caps at shutdown");
                }
                match session.state.try_lock() {
                    Some(mut sguard) => {
                        self.send_cap_locked(&inode, &mut st, &session, &mut sguard, slot, 0, 0);
                        break;
                    }
                    None => {
                        drop(st);
                        drop(session.state.lock());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::{FILE_MODE_RDONLY, FILE_MODE_RDWR};
    use crate::snap::{encode_snap_trace, RealmInfo};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(u32, CapMessage)>>,
    }

    impl RecordingTransport {
        fn ops(&self) -> Vec<(u32, CapOp, u64)> {
            self.sent
                .lock()
                .iter()
                .map(|(mds, m)| (*mds, m.op, m.snap_follows))
                .collect()
        }
    }

    impl CapTransport for Arc<RecordingTransport> {
        fn send_cap(&self, mds: u32, msg: CapMessage) {
            self.sent.lock().push((mds, msg));
        }
    }

    const INO: u64 = 0x1000;
    const ALL: u32 = CAP_RD | CAP_RDCACHE | CAP_WR | CAP_WRBUFFER;

    fn client() -> (Arc<CapClient<Arc<RecordingTransport>>>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let client = CapClient::new(
            Arc::clone(&transport),
            3,
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        (client, transport)
    }

    fn msg(op: CapOp, ino: u64, caps: u32, seq: u32, mseq: u32) -> CapMessage {
        CapMessage {
            caps,
            mseq,
            ..CapMessage::bare(op, ino, seq)
        }
    }

    fn root_trace(seq: u64, snaps: &[u64]) -> Vec<u8> {
        encode_snap_trace(&[RealmInfo {
            ino: ROOT_REALM,
            seq,
            snaps: snaps.to_vec(),
            ..RealmInfo::default()
        }])
    }

    #[test]
    fn test_issued_is_union_of_fresh_caps() {
        let (client, _t) = client();
        client
            .add_cap(INO, 0, None, CAP_RD | CAP_RDCACHE, 1, 0, &[])
            .unwrap();
        client.add_cap(INO, 1, None, CAP_WR, 1, 0, &[]).unwrap();
        let inode = client.lookup_inode(INO).unwrap();
        assert_eq!(client.issued(&inode), CAP_RD | CAP_RDCACHE | CAP_WR);

        // a timed-out session contributes nothing
        client.session_timed_out(1).unwrap();
        assert_eq!(client.issued(&inode), CAP_RD | CAP_RDCACHE);

        // snap caps always count
        inode.state.lock().snap_caps = CAP_RDCACHE;
        assert_eq!(client.issued(&inode), CAP_RD | CAP_RDCACHE);

        // a renewed session plus a refreshed cap counts again
        client.renew_session(1).unwrap();
        client.add_cap(INO, 1, None, CAP_WR, 2, 0, &[]).unwrap();
        assert_eq!(client.issued(&inode), CAP_RD | CAP_RDCACHE | CAP_WR);
    }

    #[test]
    fn test_readd_updates_in_place() {
        let (client, _t) = client();
        client.add_cap(INO, 0, None, CAP_RD, 1, 0, &[]).unwrap();
        client.add_cap(INO, 0, None, CAP_WR, 2, 0, &[]).unwrap();
        let inode = client.lookup_inode(INO).unwrap();
        assert_eq!(inode.state.lock().caps.len(), 1);
        assert_eq!(client.session(0).unwrap().state.lock().caps.len(), 1);
        let cap = client.cap_state(&inode, 0).unwrap();
        assert_eq!(cap.issued, CAP_RD | CAP_WR);
        assert_eq!(cap.seq, 2);
    }

    #[test]
    fn test_revocation_drains_then_acks() {
        let (client, transport) = client();
        client
            .add_cap(INO, 0, Some(FILE_MODE_RDWR), ALL, 1, 0, &[])
            .unwrap();
        let inode = client.lookup_inode(INO).unwrap();
        let got = client
            .get_cap_refs(&inode, CAP_RD | CAP_RDCACHE, 0, 0)
            .unwrap()
            .unwrap();
        assert_eq!(got, CAP_RD | CAP_RDCACHE);

        // authority narrows the grant to RD while RDCACHE is in use
        client
            .handle_caps(0, &msg(CapOp::Grant, INO, CAP_RD, 2, 0))
            .unwrap();
        let cap = client.cap_state(&inode, 0).unwrap();
        assert_eq!(cap.issued, CAP_RD);
        assert_eq!(cap.implemented, ALL);
        assert!(transport.sent.lock().is_empty(), "ack before drain");

        // dropping the last cached-read ref completes the revocation
        client.put_cap_refs(&inode, CAP_RDCACHE);
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        let (mds, ack) = &sent[0];
        assert_eq!(*mds, 0);
        assert_eq!(ack.op, CapOp::Ack);
        assert_eq!(ack.caps, CAP_RD);
        drop(sent);

        let cap = client.cap_state(&inode, 0).unwrap();
        assert_eq!(cap.implemented, cap.issued);
    }

    #[test]
    fn test_grant_expands_bits() {
        let (client, transport) = client();
        client.add_cap(INO, 0, Some(FILE_MODE_RDWR), CAP_RD, 1, 0, &[]).unwrap();
        let inode = client.lookup_inode(INO).unwrap();
        client
            .handle_caps(0, &msg(CapOp::Grant, INO, CAP_RD | CAP_WR, 2, 0))
            .unwrap();
        assert_eq!(client.issued(&inode), CAP_RD | CAP_WR);
        assert!(transport.sent.lock().is_empty());
    }

    #[test]
    fn test_max_size_handshake_sends_once() {
        let (client, transport) = client();
        client
            .add_cap(INO, 0, Some(FILE_MODE_RDWR), CAP_RD | CAP_WR, 1, 0, &[])
            .unwrap();
        let inode = client.lookup_inode(INO).unwrap();

        // no ceiling yet: writes past it are range errors
        let err = client.get_cap_refs(&inode, CAP_WR, 0, 4096).unwrap_err();
        assert!(matches!(err, Error::Range { offset: 4096, limit: 0 }));

        client.request_max_size(&inode, 4096);
        {
            let sent = transport.sent.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].1.op, CapOp::Ack);
            assert_eq!(sent[0].1.max_size, 4096);
        }
        // asking again does not re-send until something changes
        client.request_max_size(&inode, 4096);
        client.check_caps(&inode, false);
        assert_eq!(transport.sent.lock().len(), 1);

        // the authority answers with a larger ceiling
        let mut grant = msg(CapOp::Grant, INO, CAP_RD | CAP_WR, 2, 0);
        grant.max_size = 1 << 20;
        client.handle_caps(0, &grant).unwrap();
        let got = client.get_cap_refs(&inode, CAP_WR, 0, 4096).unwrap().unwrap();
        assert!(got & CAP_WR != 0);
        client.put_cap_refs(&inode, got);

        // a new, larger want is a fresh handshake
        client.request_max_size(&inode, 2 << 20);
        let sent = transport.sent.lock();
        assert_eq!(sent.last().unwrap().1.max_size, 2 << 20);
    }

    #[test]
    fn test_trunc_queues_background_job() {
        let (client, _t) = client();
        client.add_cap(INO, 0, None, CAP_RD, 1, 0, &[]).unwrap();
        let inode = client.lookup_inode(INO).unwrap();
        {
            let mut st = inode.state.lock();
            st.size = 8192;
            st.reported_size = 8192;
        }

        let mut trunc = msg(CapOp::Trunc, INO, 0, 2, 0);
        trunc.size = 4096;
        client.handle_caps(0, &trunc).unwrap();
        assert_eq!(inode.state.lock().size, 4096);
        assert_eq!(client.take_pending_truncate(&inode), Some(4096));
        assert_eq!(client.take_pending_truncate(&inode), None);

        // growing the file needs no background work
        let mut grow = msg(CapOp::Trunc, INO, 0, 3, 0);
        grow.size = 16384;
        client.handle_caps(0, &grow).unwrap();
        assert_eq!(inode.state.lock().size, 16384);
        assert_eq!(client.take_pending_truncate(&inode), None);
    }

    #[test]
    fn test_snap_flush_strictly_ordered() {
        let (client, transport) = client();
        client
            .add_cap(INO, 0, Some(FILE_MODE_RDWR), ALL, 1, 0, &root_trace(100, &[100]))
            .unwrap();
        let inode = client.lookup_inode(INO).unwrap();
        let ctx100 = inode.state.lock().head_context.clone().unwrap();
        assert_eq!(ctx100.seq(), 100);

        // a sync write plus five dirty buffers against seq 100
        client.get_cap_refs(&inode, CAP_WR, 0, 0).unwrap().unwrap();
        for _ in 0..5 {
            client.get_cap_refs(&inode, CAP_WRBUFFER, 0, 0).unwrap().unwrap();
        }

        // snapshot: context moves to 110, capturing the 100 state
        client.apply_snap_trace(&root_trace(110, &[110, 100])).unwrap();
        {
            let st = inode.state.lock();
            assert_eq!(st.cap_snaps.len(), 1);
            let cs = &st.cap_snaps[0];
            assert_eq!((cs.follows, cs.writing, cs.dirty), (100, true, 5));
        }

        // new writes are fenced while the capture awaits its writes
        assert_eq!(client.get_cap_refs(&inode, CAP_WR, 0, 0).unwrap(), None);

        // the write finishes but dirty data remains: still no flush
        client.put_cap_refs(&inode, CAP_WR);
        assert!(transport.ops().iter().all(|(_, op, _)| *op != CapOp::FlushSnap));

        // dirty one buffer against the new head, then snapshot again
        client.get_cap_refs(&inode, CAP_WRBUFFER, 0, 0).unwrap().unwrap();
        let ctx110 = inode.state.lock().head_context.clone().unwrap();
        client
            .apply_snap_trace(&root_trace(120, &[120, 110, 100]))
            .unwrap();
        {
            let st = inode.state.lock();
            assert_eq!(st.cap_snaps.len(), 2);
            let cs = &st.cap_snaps[1];
            assert_eq!((cs.follows, cs.writing, cs.dirty), (110, false, 1));
        }

        // younger capture drains first; the older one still gates it
        client.put_wrbuffer_cap_refs(&inode, 1, &ctx110);
        assert!(transport.ops().iter().all(|(_, op, _)| *op != CapOp::FlushSnap));

        // older capture drains: exactly its flush goes out
        client.put_wrbuffer_cap_refs(&inode, 5, &ctx100);
        let flushes: Vec<u64> = transport
            .ops()
            .iter()
            .filter(|(_, op, _)| *op == CapOp::FlushSnap)
            .map(|(_, _, follows)| *follows)
            .collect();
        assert_eq!(flushes, vec![100]);

        // the ack releases the younger capture
        let mut acked = msg(CapOp::FlushedSnap, INO, 0, 0, 0);
        acked.snap_follows = 100;
        client.handle_caps(0, &acked).unwrap();
        let flushes: Vec<u64> = transport
            .ops()
            .iter()
            .filter(|(_, op, _)| *op == CapOp::FlushSnap)
            .map(|(_, _, follows)| *follows)
            .collect();
        assert_eq!(flushes, vec![100, 110]);

        let mut acked = msg(CapOp::FlushedSnap, INO, 0, 0, 0);
        acked.snap_follows = 110;
        client.handle_caps(0, &acked).unwrap();
        assert!(inode.state.lock().cap_snaps.is_empty());
    }

    #[test]
    fn test_export_import_migration() {
        let (client, _t) = client();
        client
            .add_cap(INO, 0, Some(FILE_MODE_RDWR), CAP_RD | CAP_WR, 1, 3, &[])
            .unwrap();
        let inode = client.lookup_inode(INO).unwrap();

        // the cap leaves authority 0 under migration seq 4
        client
            .handle_caps(0, &msg(CapOp::Export, INO, 0, 2, 4))
            .unwrap();
        {
            let st = inode.state.lock();
            assert!(st.caps.is_empty());
            assert_eq!(
                st.exporting,
                Some(ExportingCaps {
                    mds: 0,
                    mseq: 4,
                    issued: CAP_RD | CAP_WR
                })
            );
        }
        assert_eq!(client.issued(&inode), 0);

        // it lands on authority 1 with a higher migration seq
        client
            .handle_caps(1, &msg(CapOp::Import, INO, CAP_RD | CAP_WR, 1, 5))
            .unwrap();
        let st = inode.state.lock();
        assert_eq!(st.exporting, None);
        assert!(st.caps.contains_key(&1));
        drop(st);
        assert_eq!(client.issued(&inode), CAP_RD | CAP_WR);
    }

    #[test]
    fn test_unknown_inode_answers_release() {
        let (client, transport) = client();
        client
            .handle_caps(0, &msg(CapOp::Grant, 0x9999, CAP_RD, 7, 0))
            .unwrap();
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.op, CapOp::Release);
        assert_eq!(sent[0].1.ino, 0x9999);
        assert_eq!(sent[0].1.seq, 7);
    }

    #[test]
    fn test_release_deferred_through_grace_window() {
        let (client, transport) = client();
        client
            .add_cap(
                INO,
                0,
                Some(FILE_MODE_RDONLY),
                CAP_RD | CAP_RDCACHE | CAP_WR,
                1,
                0,
                &[],
            )
            .unwrap();
        let inode = client.lookup_inode(INO).unwrap();

        // WR is unwanted by a read-only opener, but release is held
        client.check_caps(&inode, false);
        assert!(transport.sent.lock().is_empty());

        std::thread::sleep(Duration::from_millis(70));
        client.check_delayed_caps();
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.op, CapOp::Ack);
        assert_eq!(sent[0].1.caps & CAP_WR, 0);
    }

    #[test]
    fn test_last_cap_unpins_inode() {
        let (client, _t) = client();
        client.add_cap(INO, 0, None, CAP_RD, 1, 0, &[]).unwrap();
        client.add_cap(INO, 1, None, CAP_RD, 1, 0, &[]).unwrap();
        let inode = client.lookup_inode(INO).unwrap();
        assert!(client.evict_inode(INO).is_err());

        assert!(!client.remove_cap(&inode, 0));
        assert!(client.remove_cap(&inode, 1));
        assert!(!inode.state.lock().pinned);
        client.evict_inode(INO).unwrap();
        assert!(client.lookup_inode(INO).is_none());
    }

    #[test]
    fn test_released_from_authority_drops_cap() {
        let (client, _t) = client();
        client.add_cap(INO, 0, None, CAP_RD, 1, 0, &[]).unwrap();
        let inode = client.lookup_inode(INO).unwrap();
        client
            .handle_caps(0, &msg(CapOp::Released, INO, 0, 2, 0))
            .unwrap();
        assert!(inode.state.lock().caps.is_empty());
        assert_eq!(client.issued(&inode), 0);
    }

    #[test]
    fn test_wait_for_caps_wakes_on_grant() {
        let (client, _t) = client();
        client
            .add_cap(INO, 0, Some(FILE_MODE_RDONLY), CAP_RD, 1, 0, &[])
            .unwrap();
        let inode = client.lookup_inode(INO).unwrap();

        let c2 = Arc::clone(&client);
        let i2 = Arc::clone(&inode);
        let waiter = std::thread::spawn(move || {
            c2.wait_for_caps(&i2, CAP_RD | CAP_RDCACHE, 0, 0, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(30));
        client
            .handle_caps(0, &msg(CapOp::Grant, INO, CAP_RD | CAP_RDCACHE, 2, 0))
            .unwrap();
        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got & (CAP_RD | CAP_RDCACHE), CAP_RD | CAP_RDCACHE);

        assert!(matches!(
            client.wait_for_caps(&inode, CAP_EXCL, 0, 0, Duration::from_millis(40)),
            Err(Error::Timeout(_))
        ));
    }

    #[test]
    fn test_flush_write_caps_on_session_close() {
        let (client, transport) = client();
        client.add_cap(INO, 0, None, ALL, 1, 0, &[]).unwrap();
        client.flush_write_caps(0).unwrap();
        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.op, CapOp::Release);
        assert_eq!(sent[0].1.wanted, 0);
    }
}
