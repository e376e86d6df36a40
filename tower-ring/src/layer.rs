use std::sync::Arc;
use std::time::Duration;

use ring_limit::Limiter;
use tower::Layer;

use crate::service::RateLimitService;

/// Applies a [`Limiter`] to requests.
#[derive(Debug)]
pub struct RateLimitLayer<L>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    permits: u64,
    partial_grants: bool,
    fail_fast: bool,
    timeout: Option<Duration>,
}

impl<L> Clone for RateLimitLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            permits: self.permits,
            partial_grants: self.partial_grants,
            fail_fast: self.fail_fast,
            timeout: self.timeout,
        }
    }
}

impl<L> RateLimitLayer<L>
where
    L: Limiter + ?Sized,
{
    /// Create a RateLimitLayer charging one permit per request.
    pub fn new(limiter: Arc<L>) -> Self {
        RateLimitLayer {
            limiter,
            permits: 1,
            partial_grants: true,
            fail_fast: false,
            timeout: None,
        }
    }

    /// Set the number of permits each request costs.
    ///
    /// A cost of zero admits every request without consulting the limiter.
    pub fn with_permits(mut self, permits: u64) -> Self {
        self.permits = permits;
        self
    }

    /// Set whether permits granted short of the full cost are kept for the next check.
    ///
    /// Defaults to `true`. With `false` every check is all-or-nothing, which lets heavier
    /// requests be starved by lighter ones but never charges permits for a request that
    /// is not served.
    pub fn with_partial_grants(mut self, partial_grants: bool) -> Self {
        self.partial_grants = partial_grants;
        self
    }

    /// Set whether the service should fail immediately when short of permits.
    ///
    /// If `true`, the service returns `RingError::RateLimited` instead of sleeping
    /// until the limiter may release capacity.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set a unified timeout for both waiting for permits and request execution.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<L, S> Layer<S> for RateLimitLayer<L>
where
    L: ?Sized,
{
    type Service = RateLimitService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = RateLimitService::new(service, self.limiter.clone())
            .with_permits(self.permits)
            .with_partial_grants(self.partial_grants)
            .with_fail_fast(self.fail_fast);
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}
