//! One-shot broadcast shutdown signal.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A one-shot broadcast signal.
///
/// Any number of producers may trigger it without blocking; any number of
/// consumers may poll or wait on it. Once triggered it stays triggered.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Non-blocking and idempotent.
    pub fn trigger(&self) {
        let (flag, condvar) = &*self.inner;
        let mut triggered = flag.lock().expect("shutdown lock poisoned");
        if !*triggered {
            *triggered = true;
            condvar.notify_all();
        }
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().expect("shutdown lock poisoned")
    }

    /// Waits up to `timeout` for the signal; returns true once fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, condvar) = &*self.inner;
        let mut triggered = flag.lock().expect("shutdown lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !*triggered {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = condvar
                .wait_timeout(triggered, remaining)
                .expect("shutdown lock poisoned");
            triggered = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_idempotent() {
        let signal = Shutdown::new();
        assert!(!signal.is_triggered());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());
    }

    #[test]
    fn test_wait_times_out_when_untriggered() {
        let signal = Shutdown::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_wakes_on_trigger() {
        let signal = Shutdown::new();
        let waiter = signal.clone();
        let handle =
            std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_clones_share_state() {
        let signal = Shutdown::new();
        let observer = signal.clone();
        signal.trigger();
        assert!(observer.is_triggered());
        assert!(observer.wait_timeout(Duration::ZERO));
    }
}
