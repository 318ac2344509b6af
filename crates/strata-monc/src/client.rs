//! Monitor client: map subscriptions, statfs, unmount

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strata_common::{CookieAllocator, Epoch, Error, Fsid, Result, Scheduler, TimerHandle};
use strata_map::MonMap;
use tracing::{debug, info, warn};

/// Initial resend interval
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Resend interval ceiling
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Consecutive unanswered sends before re-picking a monitor
const HUNT_AFTER: u32 = 3;

/// The map types a client subscribes to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapKind {
    Monitor = 0,
    Target = 1,
    Meta = 2,
}

/// Requests sent to a monitor. The transport below carries these over
/// whatever reliable bus the process wires up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonRequest {
    GetMap {
        kind: MapKind,
        fsid: Fsid,
        want: Epoch,
    },
    Statfs {
        tid: u64,
    },
    Unmount,
}

/// Outbound half of the monitor session
pub trait MonTransport: Send + Sync + 'static {
    /// Queue a request to the monitor at `rank`. Must not call back
    /// into the client.
    fn send(&self, rank: u32, req: MonRequest);
}

/// Cluster utilization summary
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Statfs {
    pub total: u64,
    pub free: u64,
    pub avail: u64,
    pub objects: u64,
}

/// Client mount lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountState {
    Mounting,
    Mounted,
    Unmounting,
    Unmounted,
}

struct SubState {
    want: Epoch,
    have: Epoch,
    delay: Duration,
    attempts: u32,
    timer: Option<TimerHandle>,
}

impl SubState {
    fn new() -> Self {
        Self {
            want: 0,
            have: 0,
            delay: BASE_DELAY,
            attempts: 0,
            timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(t) = self.timer.take() {
            t.cancel();
        }
    }
}

struct PendingStatfs {
    result: Option<Statfs>,
    delay: Duration,
    timer: Option<TimerHandle>,
}

struct Inner {
    whoami: Option<u32>,
    monmap: MonMap,
    last_mon: Option<u32>,
    subs: [SubState; 3],
    statfs: HashMap<u64, PendingStatfs>,
    mount_state: MountState,
    unmount_delay: Duration,
    unmount_timer: Option<TimerHandle>,
}

/// The monitor client
pub struct MonClient<T: MonTransport> {
    /// Self-reference handed to resend timers
    me: Weak<Self>,
    transport: T,
    scheduler: Arc<Scheduler>,
    tids: CookieAllocator,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl<T: MonTransport> MonClient<T> {
    /// Build a client over `transport`, seeded with a (possibly empty)
    /// monitor map.
    #[must_use]
    pub fn new(transport: T, scheduler: Arc<Scheduler>, monmap: MonMap) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            scheduler,
            tids: CookieAllocator::new(),
            inner: Mutex::new(Inner {
                whoami: None,
                monmap,
                last_mon: None,
                subs: [SubState::new(), SubState::new(), SubState::new()],
                statfs: HashMap::new(),
                mount_state: MountState::Mounting,
                unmount_delay: BASE_DELAY,
                unmount_timer: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Our identity, once the first monitor map reply assigned one
    #[must_use]
    pub fn whoami(&self) -> Option<u32> {
        self.inner.lock().whoami
    }

    #[must_use]
    pub fn mount_state(&self) -> MountState {
        self.inner.lock().mount_state
    }

    /// Highest epoch received for a map type
    #[must_use]
    pub fn have(&self, kind: MapKind) -> Epoch {
        self.inner.lock().subs[kind as usize].have
    }

    /// Pick a monitor: sticky if one answered before, else random
    fn pick_mon(inner: &mut Inner) -> Option<u32> {
        if inner.monmap.is_empty() {
            return None;
        }
        if let Some(m) = inner.last_mon {
            return Some(m);
        }
        let m = rand::random::<u32>() % inner.monmap.len() as u32;
        inner.last_mon = Some(m);
        Some(m)
    }

    /// A reply arrived from `rank`: confirm the sticky choice
    pub fn confirm_mon(&self, rank: u32) {
        self.inner.lock().last_mon = Some(rank);
    }

    /// Ask for a map of at least epoch `want`. No-op when that epoch
    /// (or later) already arrived; otherwise resets the backoff and
    /// sends immediately, re-sending until satisfied.
    pub fn request_map(&self, kind: MapKind, want: Epoch) {
        let mut inner = self.inner.lock();
        let sub = &mut inner.subs[kind as usize];
        if want <= sub.have || want <= sub.want {
            return;
        }
        sub.want = want;
        sub.delay = BASE_DELAY;
        sub.attempts = 0;
        sub.cancel_timer();
        debug!(?kind, want, "requesting map");
        self.send_map_request(&mut inner, kind);
    }

    /// Send one get-map and arm the resend timer. Caller holds the lock.
    fn send_map_request(&self, inner: &mut Inner, kind: MapKind) {
        let fsid = inner.monmap.fsid;
        let want = inner.subs[kind as usize].want;
        if let Some(mon) = Self::pick_mon(inner) {
            self.transport.send(mon, MonRequest::GetMap { kind, fsid, want });
        } else {
            warn!(?kind, "no monitors known yet; will retry");
        }

        let sub = &mut inner.subs[kind as usize];
        let delay = sub.delay;
        sub.delay = (sub.delay * 2).min(MAX_DELAY);
        sub.attempts += 1;
        let hunt = sub.attempts % HUNT_AFTER == 0;
        let me = self.me.clone();
        sub.timer = Some(self.scheduler.schedule(delay, move || {
            Self::resend_map(&me, kind, hunt);
        }));
    }

    fn resend_map(me: &Weak<Self>, kind: MapKind, hunt: bool) {
        let Some(client) = me.upgrade() else { return };
        let mut inner = client.inner.lock();
        let sub = &inner.subs[kind as usize];
        if sub.want == 0 || sub.have >= sub.want {
            return;
        }
        if hunt {
            // no reply in a while; try a different monitor
            inner.last_mon = None;
        }
        debug!(?kind, want = inner.subs[kind as usize].want, "re-requesting map");
        client.send_map_request(&mut inner, kind);
    }

    /// Note receipt of a map of `epoch`. Returns true when this
    /// satisfies the outstanding want (resends stop, waiters wake).
    pub fn got_map(&self, kind: MapKind, epoch: Epoch) -> bool {
        let mut inner = self.inner.lock();
        let sub = &mut inner.subs[kind as usize];
        if epoch > sub.have {
            sub.have = epoch;
        }
        if epoch < sub.want {
            debug!(?kind, epoch, want = sub.want, "map below wanted epoch");
            drop(inner);
            // waiters key on `have`, not on the outstanding want
            self.cond.notify_all();
            return false;
        }
        sub.want = 0;
        sub.delay = BASE_DELAY;
        sub.attempts = 0;
        sub.cancel_timer();
        drop(inner);
        self.cond.notify_all();
        true
    }

    /// Install a new monitor map. The first one also fixes our
    /// assigned identity.
    pub fn handle_mon_map(&self, map: MonMap, assigned: Option<u32>) {
        {
            let mut inner = self.inner.lock();
            if inner.whoami.is_none() {
                if let Some(id) = assigned {
                    info!(id, "assigned client identity");
                    inner.whoami = Some(id);
                }
            }
            if inner.mount_state == MountState::Mounting {
                inner.mount_state = MountState::Mounted;
            }
            if map.epoch > inner.monmap.epoch || inner.monmap.is_empty() {
                info!(epoch = map.epoch, mons = map.len(), "new monitor map");
                inner.monmap = map;
            }
        }
        let epoch = self.inner.lock().monmap.epoch;
        self.got_map(MapKind::Monitor, epoch);
    }

    /// Block until a map of at least `epoch` has been received
    pub fn wait_for_map(&self, kind: MapKind, epoch: Epoch, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.subs[kind as usize].have < epoch {
            if self
                .cond
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return Err(Error::Timeout(format!("{kind:?} map epoch {epoch}")));
            }
        }
        Ok(())
    }

    /// Fetch cluster utilization, blocking up to `timeout`.
    ///
    /// The request is re-sent with backoff until a reply arrives; on
    /// timeout it is cancelled and a late reply is discarded.
    pub fn do_statfs(&self, timeout: Duration) -> Result<Statfs> {
        let tid = self.tids.alloc();
        let deadline = Instant::now() + timeout;
        {
            let mut inner = self.inner.lock();
            inner.statfs.insert(
                tid,
                PendingStatfs {
                    result: None,
                    delay: BASE_DELAY,
                    timer: None,
                },
            );
            self.send_statfs(&mut inner, tid);
        }

        let mut inner = self.inner.lock();
        loop {
            if let Some(p) = inner.statfs.get(&tid) {
                if let Some(result) = p.result {
                    let p = inner.statfs.remove(&tid).unwrap();
                    if let Some(t) = p.timer {
                        t.cancel();
                    }
                    return Ok(result);
                }
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                if let Some(p) = inner.statfs.remove(&tid) {
                    if let Some(t) = p.timer {
                        t.cancel();
                    }
                }
                return Err(Error::Timeout(format!("statfs tid {tid}")));
            }
        }
    }

    fn send_statfs(&self, inner: &mut Inner, tid: u64) {
        if let Some(mon) = Self::pick_mon(inner) {
            self.transport.send(mon, MonRequest::Statfs { tid });
        }
        let Some(p) = inner.statfs.get_mut(&tid) else {
            return;
        };
        let delay = p.delay;
        p.delay = (p.delay * 2).min(MAX_DELAY);
        let me = self.me.clone();
        p.timer = Some(self.scheduler.schedule(delay, move || {
            let Some(client) = me.upgrade() else { return };
            let mut inner = client.inner.lock();
            if inner
                .statfs
                .get(&tid)
                .is_some_and(|p| p.result.is_none())
            {
                client.send_statfs(&mut inner, tid);
            }
        }));
    }

    /// Deliver a statfs reply. Replies for unknown (timed-out) tids
    /// are dropped.
    pub fn handle_statfs_reply(&self, tid: u64, stats: Statfs) {
        let mut inner = self.inner.lock();
        match inner.statfs.get_mut(&tid) {
            Some(p) => {
                p.result = Some(stats);
                if let Some(t) = p.timer.take() {
                    t.cancel();
                }
                drop(inner);
                self.cond.notify_all();
            }
            None => debug!(tid, "discarding statfs reply for departed tid"),
        }
    }

    /// Start the unmount handshake: send until the monitor acknowledges
    pub fn request_unmount(&self) {
        let mut inner = self.inner.lock();
        if matches!(
            inner.mount_state,
            MountState::Unmounting | MountState::Unmounted
        ) {
            return;
        }
        inner.mount_state = MountState::Unmounting;
        inner.unmount_delay = BASE_DELAY;
        self.send_unmount(&mut inner);
    }

    fn send_unmount(&self, inner: &mut Inner) {
        if let Some(mon) = Self::pick_mon(inner) {
            self.transport.send(mon, MonRequest::Unmount);
        }
        let delay = inner.unmount_delay;
        inner.unmount_delay = (inner.unmount_delay * 2).min(MAX_DELAY);
        let me = self.me.clone();
        inner.unmount_timer = Some(self.scheduler.schedule(delay, move || {
            let Some(client) = me.upgrade() else { return };
            let mut inner = client.inner.lock();
            if inner.mount_state == MountState::Unmounting {
                client.send_unmount(&mut inner);
            }
        }));
    }

    /// The monitor acknowledged the unmount
    pub fn handle_unmount_ack(&self) {
        let mut inner = self.inner.lock();
        inner.mount_state = MountState::Unmounted;
        if let Some(t) = inner.unmount_timer.take() {
            t.cancel();
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Block until the unmount handshake completes
    pub fn wait_for_unmount(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.mount_state != MountState::Unmounted {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return Err(Error::Timeout("unmount acknowledgment".into()));
            }
        }
        Ok(())
    }
}
