//! Rollover-safe sequence flags and the busy-wait discipline around them.
//!
//! Every synchronization point in the engine is a `u32` counter living in
//! shared memory. Writers publish with release ordering, readers observe
//! with acquire ordering, so data written before a `store` is visible to
//! anyone who sees the stored value. Comparisons use wrapping arithmetic
//! and stay correct when counters roll over.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Default number of polls before the progress hook is invoked.
pub const DEFAULT_SPIN_BUDGET: u32 = 10_000;

/// `true` iff `value` lies in `[threshold, threshold + window]` modulo 2^32.
#[inline]
pub const fn reached(value: u32, threshold: u32, window: u32) -> bool {
    value.wrapping_sub(threshold) <= window
}

/// A sequence counter on its own cache line.
///
/// Zero-initialized memory is a valid `SeqFlag` holding 0, which is what a
/// freshly created segment contains.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct SeqFlag {
    value: AtomicU32,
}

impl SeqFlag {
    pub const fn new(v: u32) -> Self {
        Self {
            value: AtomicU32::new(v),
        }
    }

    /// Publish `v`. Writes issued before this call are visible to a reader
    /// that observes `v`.
    #[inline]
    pub fn store(&self, v: u32) {
        self.value.store(v, Ordering::Release);
    }

    /// Observe the current value. Reads issued after this call see data
    /// published before the observed value was stored.
    #[inline]
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn reached(&self, threshold: u32, window: u32) -> bool {
        reached(self.load(), threshold, window)
    }
}

/// Hook invoked while a participant is stuck waiting on a flag, so the
/// host runtime can service unrelated progress.
pub trait Progress: Send + Sync {
    fn progress(&self);
}

impl<F> Progress for F
where
    F: Fn() + Send + Sync,
{
    fn progress(&self) {
        self()
    }
}

/// Progress hook that yields the current thread to the scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct YieldProgress;

impl Progress for YieldProgress {
    fn progress(&self) {
        std::thread::yield_now();
    }
}

/// Spin-then-progress waiter shared by every blocking point.
///
/// There is no timeout: a peer that never publishes blocks the waiter
/// forever.
#[derive(Clone)]
pub struct Waiter {
    progress: Arc<dyn Progress>,
    spin_budget: u32,
}

impl Waiter {
    pub fn new(progress: Arc<dyn Progress>, spin_budget: u32) -> Self {
        Self {
            progress,
            spin_budget: spin_budget.max(1),
        }
    }

    /// Block until `flag` reaches `threshold` within `window`.
    pub fn wait(&self, flag: &SeqFlag, threshold: u32, window: u32) {
        loop {
            for _ in 0..self.spin_budget {
                if flag.reached(threshold, window) {
                    return;
                }
                std::hint::spin_loop();
            }
            self.progress.progress();
        }
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("spin_budget", &self.spin_budget)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_reached_exact() {
        assert!(reached(5, 5, 0));
        assert!(!reached(4, 5, 0));
        assert!(!reached(6, 5, 0));
    }

    #[test]
    fn test_reached_window() {
        assert!(reached(7, 5, 3));
        assert!(reached(8, 5, 3));
        assert!(!reached(9, 5, 3));
        assert!(!reached(4, 5, 3));
    }

    #[test]
    fn test_reached_across_rollover() {
        let threshold = u32::MAX - 1;
        assert!(reached(u32::MAX - 1, threshold, 0));
        assert!(reached(u32::MAX, threshold, 3));
        assert!(reached(0, threshold, 3));
        assert!(reached(1, threshold, 3));
        assert!(!reached(2, threshold, 3));
        assert!(!reached(u32::MAX - 2, threshold, 3));
    }

    #[test]
    fn test_flag_rollover_store_load() {
        let flag = SeqFlag::new(u32::MAX);
        assert!(flag.reached(u32::MAX, 0));
        flag.store(u32::MAX.wrapping_add(1));
        assert_eq!(flag.load(), 0);
        assert!(flag.reached(u32::MAX, 1));
        assert!(!flag.reached(u32::MAX, 0));
    }

    #[test]
    fn test_seq_flag_layout() {
        assert_eq!(std::mem::align_of::<SeqFlag>(), 64);
        assert_eq!(std::mem::size_of::<SeqFlag>(), 64);
    }

    #[test]
    fn test_wait_calls_progress_until_published() {
        let flag = Arc::new(SeqFlag::new(u32::MAX - 2));
        let calls = Arc::new(AtomicUsize::new(0));

        let hook = {
            let flag = Arc::clone(&flag);
            let calls = Arc::clone(&calls);
            move || {
                // Publish on the third call so the waiter must spin past its budget.
                if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                    flag.store(1);
                }
            }
        };
        let waiter = Waiter::new(Arc::new(hook), 16);
        waiter.wait(&flag, 0, 4);

        assert_eq!(flag.load(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_wait_across_threads() {
        let flag = Arc::new(SeqFlag::default());
        let data = Arc::new(AtomicU32::new(0));

        let writer = {
            let flag = Arc::clone(&flag);
            let data = Arc::clone(&data);
            std::thread::spawn(move || {
                data.store(42, Ordering::Relaxed);
                flag.store(1);
            })
        };

        let waiter = Waiter::new(Arc::new(YieldProgress), DEFAULT_SPIN_BUDGET);
        waiter.wait(&flag, 1, 0);
        assert_eq!(data.load(Ordering::Relaxed), 42);
        writer.join().unwrap();
    }
}
