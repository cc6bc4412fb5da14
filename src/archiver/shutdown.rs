use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::sync_ext::{CondvarExt, MutexExt};

/// Process-wide shutdown signal shared by every long-running subsystem.
///
/// Loops park on [`ShutdownSignal::wait_timeout`] instead of sleeping so a
/// trigger wakes them within one scheduler tick; backoff delays in recovery
/// and the downloader go through the same path and are therefore
/// cancellable at every suspension point.
#[derive(Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    mutex: Mutex<()>,
    cv: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Flip the flag and wake every waiter.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        let _guard = self.mutex.lock_unpoisoned();
        self.cv.notify_all();
    }

    /// Sleep for up to `dur`, returning early when shutdown fires.
    /// Returns `true` when shutdown is in effect.
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let guard = self.mutex.lock_unpoisoned();
        let (_guard, _result) = self.cv.wait_timeout_unpoisoned(guard, dur);
        self.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn wait_returns_early_once_triggered() {
        let signal = Arc::new(ShutdownSignal::new());
        let signal_clone = signal.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            signal_clone.trigger();
        });

        let start = Instant::now();
        let triggered = signal.wait_timeout(Duration::from_secs(30));
        handle.join().unwrap();

        assert!(triggered);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_times_out_when_not_triggered() {
        let signal = ShutdownSignal::new();
        let triggered = signal.wait_timeout(Duration::from_millis(10));
        assert!(!triggered);
        assert!(!signal.is_triggered());
    }
}
