//! Cancellation token for background loops and family lifecycles.
//!
//! Background threads tick by calling `wait_for` instead of sleeping, so a
//! `cancel()` from the control plane wakes them within milliseconds. The
//! data family checks `is_cancelled` at flush admission: once its owner
//! starts shutting down, no new flush is admitted and `close` can drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Clonable cancellation flag with Condvar wakeup.
#[derive(Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and wake every waiter.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Block for at most `timeout`, waking early on cancellation.
    /// Returns true once cancelled.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut guard = self.shared.lock.lock();
        if !self.is_cancelled() {
            let _ = self.shared.cond.wait_for(&mut guard, timeout);
        }
        self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_starts_live() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_wait_returns_immediately_after_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(token.wait_for(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            (waiter.wait_for(Duration::from_secs(10)), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_timeout_without_cancel() {
        let token = CancelToken::new();
        assert!(!token.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn test_clone_observes_cancel() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
