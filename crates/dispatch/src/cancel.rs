//! Cancellation tokens for detaching waiters
//!
//! A requester that loses interest in a pending result cancels its token.
//! The waiter stays in its group (membership is append-only) but is skipped
//! when the result is fanned out.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cancellation token shared between a requester and its waiter
///
/// # Example
///
/// ```
/// use pixcache_dispatch::CancellationToken;
///
/// let token = CancellationToken::new();
/// let waiter_token = token.clone();
///
/// token.cancel();
/// assert!(waiter_token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Detach. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether any clone has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fresh_token_is_live() {
        assert!(!CancellationToken::new().is_cancelled());
        assert!(!CancellationToken::default().is_cancelled());
    }

    #[test]
    fn test_cancel_seen_by_every_clone() {
        let requester = CancellationToken::new();
        let waiter = requester.clone();

        requester.cancel();
        requester.cancel();
        assert!(waiter.is_cancelled());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let token = CancellationToken::new();
        let remote = token.clone();

        thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(token.is_cancelled());
    }
}
