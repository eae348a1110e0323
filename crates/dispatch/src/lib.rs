//! pixcache request coalescing
//!
//! Ensures at most one outstanding fetch per key. Concurrent requesters for
//! the same key share the single outcome, delivered to each of them exactly
//! once and in the order they joined.
//!
//! # Example
//!
//! ```
//! use pixcache_dispatch::{CoalescingDispatcher, Role, Waiter};
//!
//! let dispatcher = CoalescingDispatcher::<&str, Result<u32, String>>::new();
//!
//! let (waiter, handle) = Waiter::channel();
//! if dispatcher.request_or_join("photo.jpg", waiter) == Role::Starter {
//!     // ... fetch and decode outside any lock ...
//!     dispatcher.complete(&"photo.jpg", Ok(1024));
//! }
//! assert_eq!(handle.wait().unwrap(), Ok(1024));
//! ```

mod cancel;
mod dispatcher;
mod waiter;

pub use cancel::CancellationToken;
pub use dispatcher::{CoalescingDispatcher, DispatchStats, Role};
pub use waiter::{WaitError, WaitHandle, Waiter};
