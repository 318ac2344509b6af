//! Per-authority session state

use crate::arena::CapSlot;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Mutable session state, guarded by the session mutex
#[derive(Debug)]
pub struct SessionState {
    /// Slots of every cap issued under this session
    pub caps: Vec<CapSlot>,
    /// Generation; bumped when the session times out, which makes all
    /// caps issued under earlier generations stale at once
    pub gen: u32,
    /// Caps are trusted until this instant
    pub cap_ttl: Instant,
    /// Message ordering sequence
    pub seq: u64,
}

impl SessionState {
    /// True once the lease has lapsed
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.cap_ttl
    }
}

/// A session with one metadata authority
#[derive(Debug)]
pub struct Session {
    pub mds: u32,
    pub state: Mutex<SessionState>,
}

impl Session {
    #[must_use]
    pub fn new(mds: u32, ttl: Duration) -> Self {
        Self {
            mds,
            state: Mutex::new(SessionState {
                caps: Vec::new(),
                gen: 1,
                cap_ttl: Instant::now() + ttl,
                seq: 0,
            }),
        }
    }

    /// Renewal from the authority: extend the lease
    pub fn touch(&self, ttl: Duration) {
        self.state.lock().cap_ttl = Instant::now() + ttl;
    }

    /// Session timed out: invalidate every cap in one step
    pub fn bump_gen(&self) {
        let mut st = self.state.lock();
        st.gen += 1;
        st.cap_ttl = Instant::now();
    }

    /// Current (generation, ttl-expired) pair for staleness checks
    #[must_use]
    pub fn staleness(&self) -> (u32, bool) {
        let st = self.state.lock();
        (st.gen, st.expired(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_gen_expires() {
        let s = Session::new(0, Duration::from_secs(60));
        let (gen, expired) = s.staleness();
        assert_eq!(gen, 1);
        assert!(!expired);
        s.bump_gen();
        let (gen, expired) = s.staleness();
        assert_eq!(gen, 2);
        assert!(expired);
        s.touch(Duration::from_secs(60));
        let (_, expired) = s.staleness();
        assert!(!expired);
    }
}
