//! Cooperative cancellation of an estimation request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a request should stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// [CancellationToken::cancel] was called
    Cancelled,
    /// The deadline has passed
    DeadlineExceeded,
}

/// Shared cancellation flag with an optional deadline.
///
/// Clones share the same flag. Chunks check the token before starting, chunks already
/// running are not interrupted.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// Token which only fires when cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Token which also fires once `timeout` has elapsed from now
    pub fn with_timeout(timeout: Duration) -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the token has fired
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Reason why the token fired, if it did
    pub fn reason(&self) -> Option<CancelReason> {
        if self.cancelled.load(Ordering::SeqCst) {
            Some(CancelReason::Cancelled)
        } else if self.deadline.map_or(false, |d| Instant::now() >= d) {
            Some(CancelReason::DeadlineExceeded)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert_eq!(clone.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_deadline() {
        assert_eq!(
            CancellationToken::with_timeout(Duration::ZERO).reason(),
            Some(CancelReason::DeadlineExceeded)
        );
        assert!(!CancellationToken::with_timeout(Duration::from_secs(3600)).is_cancelled());
    }
}
