//! Shared state between the Tracking, Local Mapping, Loop Closing and
//! optimizer threads of one session.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use crate::atlas::Atlas;
use crate::loop_closing::LoopClosure;

/// Shared state accessible by all threads of a session.
pub struct SharedState {
    /// The Atlas containing the map, vocabulary and calibration.
    /// Protected by RwLock: Tracking reads, the mapping side writes.
    pub atlas: RwLock<Atlas>,

    /// Flow control: when true, Tracking should not create new keyframes.
    /// Set by Local Mapping when the keyframe queue is too long.
    pub stop_keyframe_creation: AtomicBool,

    /// Request the worker threads to finish and exit.
    pub shutdown_requested: AtomicBool,

    /// Ticket of the most recently scheduled global optimization.
    latest_ticket: AtomicU64,

    /// A global optimization is scheduled or running.
    global_pending: AtomicBool,

    /// Number of keyframes fully processed by Local Mapping.
    mapped: Mutex<u64>,
    mapped_cv: Condvar,

    /// Accepted loop closures, in acceptance order.
    loop_events: Mutex<Vec<LoopClosure>>,

    pub stats: SessionStats,
}

impl SharedState {
    /// Create a new SharedState around an (empty or imported) Atlas.
    pub fn new(atlas: Atlas) -> Arc<Self> {
        Arc::new(Self {
            atlas: RwLock::new(atlas),
            stop_keyframe_creation: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            latest_ticket: AtomicU64::new(0),
            global_pending: AtomicBool::new(false),
            mapped: Mutex::new(0),
            mapped_cv: Condvar::new(),
            loop_events: Mutex::new(Vec::new()),
            stats: SessionStats::default(),
        })
    }

    /// Check if keyframe creation should be stopped (flow control).
    pub fn should_stop_keyframe_creation(&self) -> bool {
        self.stop_keyframe_creation.load(Ordering::SeqCst)
    }

    /// Set the stop_keyframe_creation flag.
    pub fn set_stop_keyframe_creation(&self, value: bool) {
        self.stop_keyframe_creation.store(value, Ordering::SeqCst);
    }

    /// Request shutdown of the worker threads.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Optimization tickets
    // ─────────────────────────────────────────────────────────────────────────

    /// Schedule a global optimization. Every earlier ticket becomes stale.
    pub fn next_ticket(&self) -> u64 {
        self.global_pending.store(true, Ordering::SeqCst);
        self.latest_ticket.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether `ticket` is still the most recently scheduled optimization.
    pub fn is_latest(&self, ticket: u64) -> bool {
        self.latest_ticket.load(Ordering::SeqCst) == ticket
    }

    /// A global optimization is scheduled and not yet finished.
    pub fn is_global_pending(&self) -> bool {
        self.global_pending.load(Ordering::SeqCst)
    }

    /// Mark the optimization for `ticket` finished. No-op for stale tickets.
    pub fn finish_ticket(&self, ticket: u64) {
        if self.is_latest(ticket) {
            self.global_pending.store(false, Ordering::SeqCst);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mapped-keyframe counter
    // ─────────────────────────────────────────────────────────────────────────

    /// Called by Local Mapping once a keyframe message is fully handled.
    pub fn notify_mapped(&self) {
        let mut mapped = self.mapped.lock();
        *mapped += 1;
        self.mapped_cv.notify_all();
    }

    pub fn mapped_count(&self) -> u64 {
        *self.mapped.lock()
    }

    /// Block until at least `target` keyframe messages were handled.
    /// Returns false on timeout or shutdown.
    pub fn wait_mapped(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut mapped = self.mapped.lock();
        while *mapped < target {
            if self.is_shutdown_requested() {
                return false;
            }
            if self.mapped_cv.wait_until(&mut mapped, deadline).timed_out() {
                return *mapped >= target;
            }
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loop events
    // ─────────────────────────────────────────────────────────────────────────

    pub fn record_loop(&self, event: LoopClosure) {
        self.loop_events.lock().push(event);
    }

    pub fn loop_events(&self) -> Vec<LoopClosure> {
        self.loop_events.lock().clone()
    }
}

/// Session counters updated lock-free from every thread.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub late_frames: AtomicU64,
    pub invalid_frames: AtomicU64,
    pub keyframes_rejected: AtomicU64,
    pub skipped_loop_searches: AtomicU64,
    pub optimizations_applied: AtomicU64,
    pub optimizations_discarded: AtomicU64,
}

impl SessionStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_received: get(&self.frames_received),
            frames_dropped: get(&self.frames_dropped),
            late_frames: get(&self.late_frames),
            invalid_frames: get(&self.invalid_frames),
            keyframes_rejected: get(&self.keyframes_rejected),
            skipped_loop_searches: get(&self.skipped_loop_searches),
            optimizations_applied: get(&self.optimizations_applied),
            optimizations_discarded: get(&self.optimizations_discarded),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub late_frames: u64,
    pub invalid_frames: u64,
    pub keyframes_rejected: u64,
    pub skipped_loop_searches: u64,
    pub optimizations_applied: u64,
    pub optimizations_discarded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::CalibratedCamera;
    use crate::vocabulary::VocabularyConfig;

    fn shared() -> Arc<SharedState> {
        let camera = CalibratedCamera::pinhole(100.0, 100.0, 50.0, 50.0, 100, 100);
        SharedState::new(Atlas::new(camera, 32, VocabularyConfig::default()).unwrap())
    }

    #[test]
    fn test_only_latest_ticket_is_current() {
        let s = shared();
        assert!(!s.is_global_pending());
        let a = s.next_ticket();
        let b = s.next_ticket();
        assert!(!s.is_latest(a));
        assert!(s.is_latest(b));
        s.finish_ticket(a);
        assert!(s.is_global_pending());
        s.finish_ticket(b);
        assert!(!s.is_global_pending());
    }

    #[test]
    fn test_wait_mapped_wakes_on_notify() {
        let s = shared();
        let s2 = Arc::clone(&s);
        let handle = std::thread::spawn(move || s2.wait_mapped(2, Duration::from_secs(5)));
        s.notify_mapped();
        s.notify_mapped();
        assert!(handle.join().unwrap());
        assert!(!s.wait_mapped(3, Duration::from_millis(10)));
    }

    #[test]
    fn test_stats_snapshot() {
        let s = shared();
        SessionStats::incr(&s.stats.frames_dropped);
        SessionStats::incr(&s.stats.frames_dropped);
        assert_eq!(s.stats.snapshot().frames_dropped, 2);
    }
}
