//! Shared flags, counters, condition variables, locks, and stamps that kT
//! and dT use to hand off work.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// Counts maintained by the scheduler for diagnostics.
/// Single-writer per field: `n_kinematic_updates` only by dT,
/// `n_times_dynamic_held_back` only by dT.
#[derive(Default)]
pub struct SchedulingStats {
    n_kinematic_updates: AtomicU64,
    n_times_dynamic_held_back: AtomicU64,
}

impl SchedulingStats {
    pub fn record_kinematic_update(&self) {
        self.n_kinematic_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dynamic_held_back(&self) {
        self.n_times_dynamic_held_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn n_kinematic_updates(&self) -> u64 {
        self.n_kinematic_updates.load(Ordering::Relaxed)
    }

    pub fn n_times_dynamic_held_back(&self) -> u64 {
        self.n_times_dynamic_held_back.load(Ordering::Relaxed)
    }
}

/// A start/join latch: a worker blocks on `wait_for_start` until the
/// façade calls `start()`, and checks `should_join` after each wake to
/// decide whether to exit its outer loop.
#[derive(Default)]
pub struct Latch {
    mutex: Mutex<bool>,
    cv: Condvar,
    should_join: AtomicBool,
}

impl Latch {
    pub fn start(&self) {
        let mut started = self.mutex.lock().unwrap();
        *started = true;
        self.cv.notify_all();
    }

    pub fn request_join(&self) {
        self.should_join.store(true, Ordering::Release);
        self.start();
    }

    pub fn should_join(&self) -> bool {
        self.should_join.load(Ordering::Acquire)
    }

    /// Blocks until `start()` is called, then clears the started flag so
    /// the next user call must be signalled again.
    pub fn wait_for_start(&self) {
        let mut started = self.mutex.lock().unwrap();
        while !*started {
            started = self.cv.wait(started).unwrap();
        }
        *started = false;
    }
}

/// A one-directional freshness flag guarding a buffer hand-off, paired
/// with the condition variable the consumer blocks on.
///
/// Release/Acquire on `fresh` gives the ordering guarantee a producer
/// needs: a writer's payload is fully visible before the flag is
/// observably set.
#[derive(Default)]
pub struct FreshnessGate {
    fresh: AtomicBool,
    wake_mutex: Mutex<()>,
    cv: Condvar,
}

impl FreshnessGate {
    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    /// Producer side: called after the payload has been fully written.
    pub fn publish(&self) {
        let _guard = self.wake_mutex.lock().unwrap();
        self.fresh.store(true, Ordering::Release);
        self.cv.notify_all();
    }

    /// Consumer side: called right after draining the payload.
    pub fn clear(&self) {
        self.fresh.store(false, Ordering::Release);
    }

    /// Blocks until `publish()` is observed, looping to guard against
    /// spurious wakeups.
    pub fn wait_until_fresh(&self) {
        let guard = self.wake_mutex.lock().unwrap();
        let _guard = self
            .cv
            .wait_while(guard, |_| !self.fresh.load(Ordering::Acquire))
            .unwrap();
    }
}

/// Shared coordination state, constructed once by the façade and handed to
/// both workers as `Arc<SchedSupport>`.
pub struct SchedSupport {
    pub dynamic_start: Latch,
    pub kinematic_start: Latch,

    /// Set by kT, cleared by dT: a fresh contact list awaits dT.
    pub dynamic_owned_prod2cons: FreshnessGate,
    /// Set by dT, cleared by kT: fresh owner positions await kT.
    pub kinematic_owned_cons2prod: FreshnessGate,

    pub dynamic_owned_buffer_lock: Mutex<()>,
    pub kinematic_owned_buffer_lock: Mutex<()>,

    current_stamp_of_dynamic: AtomicU64,
    stamp_last_update_of_dynamic: AtomicU64,

    pub update_threshold: u64,

    pub stats: SchedulingStats,
}

impl SchedSupport {
    pub fn new(update_threshold: u64) -> Self {
        SchedSupport {
            dynamic_start: Latch::default(),
            kinematic_start: Latch::default(),
            dynamic_owned_prod2cons: FreshnessGate::default(),
            kinematic_owned_cons2prod: FreshnessGate::default(),
            dynamic_owned_buffer_lock: Mutex::new(()),
            kinematic_owned_buffer_lock: Mutex::new(()),
            current_stamp_of_dynamic: AtomicU64::new(0),
            stamp_last_update_of_dynamic: AtomicU64::new(0),
            update_threshold,
            stats: SchedulingStats::default(),
        }
    }

    pub fn current_stamp(&self) -> u64 {
        self.current_stamp_of_dynamic.load(Ordering::Acquire)
    }

    pub fn stamp_last_update(&self) -> u64 {
        self.stamp_last_update_of_dynamic.load(Ordering::Acquire)
    }

    /// Only dT ever calls this.
    pub fn advance_stamp(&self) {
        self.current_stamp_of_dynamic.fetch_add(1, Ordering::AcqRel);
    }

    /// Only dT ever calls this, at the moment it consumes an inbound
    /// buffer.
    pub fn mark_stamp_consumed(&self) {
        let now = self.current_stamp();
        self.stamp_last_update_of_dynamic.store(now, Ordering::Release);
    }

    /// dT has advanced `update_threshold` cycles without seeing a kT
    /// update.
    pub fn dynamic_should_wait(&self) -> bool {
        self.current_stamp() - self.stamp_last_update() >= self.update_threshold
    }

    /// kT's inbound buffer is stale: no new positions since last
    /// consumption.
    pub fn kinematic_should_wait(&self) -> bool {
        !self.kinematic_owned_cons2prod.is_fresh()
    }

    pub fn request_join_both(&self) {
        self.dynamic_start.request_join();
        self.kinematic_start.request_join();
    }
}
