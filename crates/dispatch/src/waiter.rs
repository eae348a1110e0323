//! Waiters and the handles used to block on them

use crate::cancel::CancellationToken;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a [`WaitHandle`] returned without a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The waiter was dropped without delivery (group cleared, starter gone)
    #[error("waiter was dropped before a result was delivered")]
    Closed,

    /// The deadline passed before delivery
    #[error("timed out waiting for result")]
    TimedOut,
}

/// A registered interest in the result of a pending fetch.
///
/// The delivery callback runs at most once, on the thread that completes the
/// group, and never while any dispatcher lock is held.
pub struct Waiter<R> {
    token: CancellationToken,
    deliver: Box<dyn FnOnce(R) + Send>,
}

impl<R: Send + 'static> Waiter<R> {
    /// A waiter that invokes `callback` with the result
    pub fn new(callback: impl FnOnce(R) + Send + 'static) -> Self {
        Self {
            token: CancellationToken::new(),
            deliver: Box::new(callback),
        }
    }

    /// A waiter paired with a handle that can block until delivery
    pub fn channel() -> (Self, WaitHandle<R>) {
        let slot = Arc::new(Slot::new());
        let sender = SlotSender {
            slot: Arc::clone(&slot),
            sent: false,
        };
        let waiter = Self::new(move |result| sender.send(result));
        let handle = WaitHandle {
            slot,
            token: waiter.token.clone(),
        };
        (waiter, handle)
    }
}

impl<R> Waiter<R> {
    /// Use an existing token instead of a fresh one
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Token that detaches this waiter when cancelled
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run the callback unless detached. Returns whether it ran.
    pub(crate) fn deliver(self, result: R) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        (self.deliver)(result);
        true
    }
}

impl<R> fmt::Debug for Waiter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

enum SlotState<R> {
    Pending,
    Ready(R),
    Taken,
    Closed,
}

struct Slot<R> {
    state: Mutex<SlotState<R>>,
    cv: Condvar,
}

impl<R> Slot<R> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            cv: Condvar::new(),
        }
    }

    fn set(&self, next: SlotState<R>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = next;
        }
        self.cv.notify_all();
    }
}

/// Writes into a slot; marks it closed if dropped unsent
struct SlotSender<R> {
    slot: Arc<Slot<R>>,
    sent: bool,
}

impl<R> SlotSender<R> {
    fn send(mut self, result: R) {
        self.sent = true;
        self.slot.set(SlotState::Ready(result));
    }
}

impl<R> Drop for SlotSender<R> {
    fn drop(&mut self) {
        if !self.sent {
            self.slot.set(SlotState::Closed);
        }
    }
}

/// Blocking side of [`Waiter::channel`].
///
/// Waiting never holds a dispatcher lock, so a starter can always complete.
/// Dropping the handle is a valid way to lose interest; calling
/// [`WaitHandle::cancel`] additionally skips the delivery.
pub struct WaitHandle<R> {
    slot: Arc<Slot<R>>,
    token: CancellationToken,
}

impl<R> WaitHandle<R> {
    /// Block until the result is delivered or the waiter is dropped
    pub fn wait(&self) -> Result<R, WaitError> {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = Self::take(&mut state) {
                return result;
            }
            self.slot.cv.wait(&mut state);
        }
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = Self::take(&mut state) {
                return result;
            }
            if self.slot.cv.wait_until(&mut state, deadline).timed_out() {
                return Self::take(&mut state).unwrap_or(Err(WaitError::TimedOut));
            }
        }
    }

    /// Take the result if it has already arrived
    pub fn try_take(&self) -> Option<Result<R, WaitError>> {
        let mut state = self.slot.state.lock();
        Self::take(&mut state)
    }

    /// Detach: a later delivery is skipped
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn take(state: &mut SlotState<R>) -> Option<Result<R, WaitError>> {
        match std::mem::replace(state, SlotState::Taken) {
            SlotState::Ready(result) => Some(Ok(result)),
            SlotState::Closed => {
                *state = SlotState::Closed;
                Some(Err(WaitError::Closed))
            }
            SlotState::Taken => {
                *state = SlotState::Closed;
                Some(Err(WaitError::Closed))
            }
            SlotState::Pending => {
                *state = SlotState::Pending;
                None
            }
        }
    }
}
