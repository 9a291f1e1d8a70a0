//! Completion handles for engine operations.
//!
//! The engine resolves operations on its runtime thread; callers block on a
//! channel-backed handle with a deadline. No async runtime is involved.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

use crate::types::LogIndex;
use crate::{RaftError, RaftResult};

/// The resolving side of an operation, held by the engine runtime.
///
/// Built from a closure so the runtime can route resolutions either to a
/// local waiting caller or back out over the peer transport (forwarded
/// proposals).
pub(crate) struct Completer<T> {
    complete: Box<dyn FnOnce(RaftResult<T>) + Send>,
}

impl<T> Completer<T> {
    /// Wraps a resolution callback.
    pub fn new(complete: impl FnOnce(RaftResult<T>) + Send + 'static) -> Self {
        Self {
            complete: Box::new(complete),
        }
    }

    /// Resolves the operation.
    pub fn resolve(self, result: RaftResult<T>) {
        (self.complete)(result);
    }
}

/// The waiting side of an operation.
///
/// Dropping the future abandons the wait; a late resolution is discarded
/// harmlessly.
pub struct RaftFuture<T> {
    rx: Receiver<RaftResult<T>>,
    deadline: Instant,
}

impl<T> RaftFuture<T> {
    /// Creates a linked future/completer pair with the given deadline.
    pub(crate) fn with_timeout(timeout: Duration) -> (Self, Completer<T>)
    where
        T: Send + 'static,
    {
        let (tx, rx): (SyncSender<RaftResult<T>>, _) = mpsc::sync_channel(1);
        let completer = Completer::new(move |result| {
            // The waiter may have timed out and dropped the receiver.
            let _ = tx.try_send(result);
        });
        (
            Self {
                rx,
                deadline: Instant::now() + timeout,
            },
            completer,
        )
    }

    /// Creates a future that is already resolved.
    pub(crate) fn ready(result: RaftResult<T>) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let _ = tx.try_send(result);
        Self {
            rx,
            deadline: Instant::now(),
        }
    }

    /// Blocks until the operation resolves, the deadline passes, or the
    /// engine shuts down.
    pub fn wait(self) -> RaftResult<T> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RaftError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(RaftError::Shutdown),
        }
    }
}

/// Resolves once a proposal is committed and applied locally.
pub type ApplyFuture = RaftFuture<()>;

/// Resolves with the log index of a committed configuration change.
pub type ConfigFuture = RaftFuture<LogIndex>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_before_wait() {
        let (future, completer) = RaftFuture::<()>::with_timeout(Duration::from_secs(1));
        completer.resolve(Ok(()));
        assert!(future.wait().is_ok());
    }

    #[test]
    fn test_wait_times_out() {
        let (future, _completer) = RaftFuture::<()>::with_timeout(Duration::from_millis(10));
        assert!(matches!(future.wait(), Err(RaftError::Timeout)));
    }

    #[test]
    fn test_dropped_completer_reads_as_shutdown() {
        let (future, completer) = RaftFuture::<()>::with_timeout(Duration::from_secs(5));
        drop(completer);
        assert!(matches!(future.wait(), Err(RaftError::Shutdown)));
    }

    #[test]
    fn test_late_resolution_is_discarded() {
        let (future, completer) = RaftFuture::<()>::with_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(future.wait(), Err(RaftError::Timeout)));
        // The waiter is gone; resolving must not panic or block.
        completer.resolve(Ok(()));
    }

    #[test]
    fn test_ready_future() {
        let future = RaftFuture::ready(Ok(7u64));
        assert_eq!(future.wait().unwrap(), 7);
    }
}
