//! Delayed-work scheduler
//!
//! One worker thread owns a priority queue keyed by deadline. Jobs are
//! one-shot closures; periodic work re-schedules itself. Cancellation
//! tombstones the entry, which is discarded when it pops; entries are
//! never removed from the middle of the queue.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    stopping: bool,
}

/// Handle to a scheduled job
#[derive(Clone, Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Tombstone the job; it is dropped when its deadline pops.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled or already run
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Deadline-ordered job scheduler shared by all periodic work
pub struct Scheduler {
    queue: Arc<(Mutex<Queue>, Condvar)>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the worker thread
    #[must_use]
    pub fn spawn() -> Self {
        let queue = Arc::new((Mutex::new(Queue::default()), Condvar::new()));
        let q = Arc::clone(&queue);
        let worker = std::thread::Builder::new()
            .name("strata-timer".into())
            .spawn(move || Self::run(&q))
            .expect("spawn timer thread");
        Self {
            queue,
            worker: Some(worker),
        }
    }

    /// Schedule `job` to run after `delay`
    pub fn schedule(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = TimerHandle {
            cancelled: Arc::clone(&cancelled),
        };
        let (lock, cond) = &*self.queue;
        let mut q = lock.lock();
        let seq = q.next_seq;
        q.next_seq += 1;
        q.heap.push(Reverse(Entry {
            at: Instant::now() + delay,
            seq,
            cancelled,
            job: Box::new(job),
        }));
        cond.notify_one();
        handle
    }

    fn run(queue: &(Mutex<Queue>, Condvar)) {
        let (lock, cond) = queue;
        let mut q = lock.lock();
        loop {
            if q.stopping {
                return;
            }
            let now = Instant::now();
            match q.heap.peek().map(|r| r.0.at) {
                Some(at) if at <= now => {
                    let Reverse(e) = q.heap.pop().expect("peeked just above");
                    if e.cancelled.swap(true, Ordering::AcqRel) {
                        trace!(seq = e.seq, "dropping tombstoned timer entry");
                        continue;
                    }
                    drop(q);
                    (e.job)();
                    q = lock.lock();
                }
                Some(at) => {
                    cond.wait_for(&mut q, at - now);
                }
                None => {
                    cond.wait(&mut q);
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        {
            let (lock, cond) = &*self.queue;
            lock.lock().stopping = true;
            cond.notify_all();
        }
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}
