//! # ring-limit
//!
//! `ring-limit` provides a lock-free sliding window rate limiter.
//!
//! ## Core Philosophy
//!
//! The window is split into a fixed ring of time buckets. A single atomic aggregate
//! counter tracks the permits granted across the live buckets, and every state transition
//! (granting permits or rotating the ring) is a Compare-And-Swap against a snapshot of that
//! counter. Callers never take a lock and never block.
//!
//! ## Key Concepts
//!
//! * **Lock-Free**: No `Mutex` or `RwLock` anywhere in the limiter.
//! * **Lazy Rotation**: Buckets age out at the moment of a request, there are no
//!   background timers.
//! * **Partial Grants**: `acquire(n)` may grant fewer than `n` permits. It returns `0`
//!   when the budget is exhausted rather than failing.
//!
//! ## Example
//!
//! ```rust
//! use ring_limit::Limiter;
//! use ring_limit::SlidingWindow;
//! use std::time::Duration;
//!
//! let limiter = SlidingWindow::new(100, Duration::from_secs(1), 10).unwrap();
//!
//! assert_eq!(limiter.acquire(60), 60);
//! assert_eq!(limiter.acquire(60), 40);
//! assert!(!limiter.get_one());
//! ```

use std::fmt::Debug;
use std::time::Duration;

mod bucket;
mod error;
mod sliding_window;

pub use error::ConfigError;
pub use sliding_window::SlidingWindow;

/// The admission interface shared by limiters.
///
/// Limiters must be `Send` and `Sync` to be shared across threads via `Arc`.
pub trait Limiter: Debug {
    /// Attempts to acquire `permits` permits.
    ///
    /// Returns the number actually granted, anywhere from `0` to `permits`.
    /// This method never blocks and never fails.
    fn acquire(&self, permits: u64) -> u64;

    /// Attempts to acquire all `permits` at once.
    ///
    /// Either every permit is granted or none is charged. Requesting `0` always succeeds.
    fn try_acquire(&self, permits: u64) -> bool;

    /// Attempts to acquire exactly one permit.
    fn get_one(&self) -> bool {
        self.acquire(1) == 1
    }

    /// A hint for how long a denied caller should wait before capacity may be released.
    fn retry_after(&self) -> Duration;
}
