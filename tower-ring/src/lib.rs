//! # Tower Ring
//!
//! `tower-ring` gates a [Tower](https://github.com/tower-rs/tower) service on a
//! [`ring_limit::Limiter`].
//!
//! ## Weighted Requests
//!
//! Each request may cost more than one permit ([`RateLimitLayer::with_permits`]). Limiters
//! grant permits partially, so a service that is short of permits keeps what it was granted
//! and only asks for the remainder on its next readiness check. A heavy request is never
//! starved by lighter ones that keep slipping into the budget first.
//!
//! Kept permits belong to the service instance. A service that may be dropped while still
//! short, as behind load shedding, should acquire all-or-nothing instead
//! ([`RateLimitLayer::with_partial_grants`]). [`ManagedRateLimitLayer`] always does.
//!
//! ## The Managed Stack
//!
//! [`ManagedRateLimitLayer`] composes the limiter with a deadline and load shedding:
//!
//! 1. **Load Shedding**: Rejects with `RingError::Overloaded` when the permits are not
//!    available at the readiness check, instead of queuing the request.
//! 2. **Timeouts**: Fails with `RingError::Timeout` if the inner service exceeds the deadline.
//! 3. **Error Mapping**: Converts internal Tower errors into the cloneable [`RingError`].
//!
//! The plain [`RateLimitLayer`] waits instead, sleeping on the limiter's
//! [`retry_after`](ring_limit::Limiter::retry_after) hint until its permits are granted.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`RingError`], allowing automatic conversion
//!   to HTTP status codes (408, 429, 503, 500).

mod error;
mod layer;
mod managed_layer;
mod service;

#[cfg(test)]
mod tests;

pub use error::RingError;
pub use layer::RateLimitLayer;
pub use managed_layer::ManagedRateLimitLayer;
pub use service::ResponseFuture;
pub use service::RateLimitService;
