use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use ring_limit::Limiter;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneSyncService;

use crate::RateLimitService;
use crate::RingError;

/// A non-blocking rate limiting stack with a hard deadline.
///
/// Requests are never queued behind the limiter:
/// - **LoadShedding (`RingError::Overloaded`)**: the limiter could not grant the
///   request's permits (or the inner service is busy) at the readiness check.
/// - **Timeout (`RingError::Timeout`)**: the inner service took longer than `max_wait`.
///
/// A shed service is dropped, so permits are acquired all-or-nothing here: a request
/// either gets its whole cost or is shed without charging the limiter.
pub struct ManagedRateLimitLayer<L, Req>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    permits: u64,
    max_wait: Duration,
    _phantom: PhantomData<fn(Req)>,
}

// Deriving Clone would require Req: Clone
impl<L, Req> Clone for ManagedRateLimitLayer<L, Req>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            permits: self.permits,
            max_wait: self.max_wait,
            _phantom: PhantomData,
        }
    }
}

impl<S, L, Req> Layer<S> for ManagedRateLimitLayer<L, Req>
where
    L: Limiter + ?Sized + Send + Sync + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Send + 'static,
{
    type Service = BoxCloneSyncService<Req, S::Response, BoxError>;

    fn layer(&self, inner: S) -> Self::Service {
        let rl = RateLimitService::new(inner, self.limiter.clone())
            .with_permits(self.permits)
            .with_partial_grants(false);

        // Timeout is outer to put a hard deadline on waiting and execution together
        let svc = tower::ServiceBuilder::new()
            .map_err(|err: BoxError| {
                if err.is::<tower::timeout::error::Elapsed>() {
                    BoxError::from(RingError::Timeout)
                } else if err.is::<tower::load_shed::error::Overloaded>() {
                    BoxError::from(RingError::Overloaded)
                } else if err.is::<RingError>() {
                    err
                } else {
                    BoxError::from(RingError::Inner(err.to_string()))
                }
            })
            .timeout(self.max_wait)
            .load_shed()
            .service(rl);

        BoxCloneSyncService::new(svc)
    }
}

impl<L, Req> ManagedRateLimitLayer<L, Req>
where
    L: Limiter + ?Sized,
{
    pub fn new(limiter: Arc<L>, max_wait: Duration) -> Self {
        Self {
            limiter,
            permits: 1,
            max_wait,
            _phantom: PhantomData,
        }
    }

    /// Set the number of permits each request costs.
    pub fn with_permits(mut self, permits: u64) -> Self {
        self.permits = permits;
        self
    }
}
