use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use tokio::time::Instant;
use tokio::time::Sleep;
use tokio::time::Timeout;
use tokio::time::sleep;
use tokio::time::timeout;
use tower::BoxError;
use tower::Service;
use tracing::debug;
use tracing::trace;

use ring_limit::Limiter;

use crate::error::RingError;

#[derive(Clone, Debug)]
struct RateLimitServiceMetrics {
    permits_granted: Counter<u64>,
    requests_throttled: Counter<u64>,
}

/// Admits requests once the limiter has granted their permits.
#[derive(Debug)]
pub struct RateLimitService<L, S>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    /// Permits charged per request
    permits: u64,
    /// Permits still needed before the next request is admitted
    owed: u64,
    sleep: Option<Pin<Box<Sleep>>>,
    /// Keep partial grants across polls instead of acquiring all permits at once
    partial_grants: bool,
    fail_fast: bool,
    timeout: Option<Duration>,
    wait_start: Option<Instant>,
    instruments: RateLimitServiceMetrics,
}

pin_project! {
    /// The inner service future, bounded by whatever is left of the timeout.
    #[project = ResponseFutureProj]
    pub enum ResponseFuture<F> {
        Bounded {
            #[pin]
            inner: Timeout<F>,
        },
        Unbounded {
            #[pin]
            inner: F,
        },
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: From<BoxError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Bounded { inner } => match ready!(inner.poll(cx)) {
                Ok(res) => Poll::Ready(res),
                Err(_) => Poll::Ready(Err(E::from(BoxError::from(RingError::Timeout)))),
            },
            ResponseFutureProj::Unbounded { inner } => inner.poll(cx),
        }
    }
}

// Pin<Box<Sleep>> cannot be cloned, and granted permits belong to this instance
impl<L, S> Clone for RateLimitService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            permits: self.permits,
            owed: self.permits,
            sleep: None,
            partial_grants: self.partial_grants,
            fail_fast: self.fail_fast,
            timeout: self.timeout,
            wait_start: None,
            instruments: self.instruments.clone(),
        }
    }
}

impl<L, S, Req> Service<Req> for RateLimitService<L, S>
where
    L: Limiter + ?Sized + Send + Sync + 'static,
    S: Service<Req, Error = BoxError>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. Finish any back-off in progress
        if let Some(fut) = self.sleep.as_mut() {
            ready!(fut.as_mut().poll(cx));
            self.sleep = None;
        }

        // 2. Check inner service readiness FIRST to avoid consuming permits for nothing
        ready!(self.inner.poll_ready(cx))?;

        if self.owed == 0 {
            return Poll::Ready(Ok(()));
        }

        // 3. Collect what we can of the permits still owed
        let remaining = match (self.timeout, self.wait_start) {
            (Some(timeout), Some(start)) => {
                let remaining = timeout.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    self.wait_start = None;
                    debug!(owed = self.owed, "timed out waiting for permits");
                    return Poll::Ready(Err(RingError::Timeout.into()));
                }
                Some(remaining)
            }
            (timeout, _) => timeout,
        };

        let granted = if self.partial_grants {
            self.limiter.acquire(self.owed)
        } else if self.limiter.try_acquire(self.owed) {
            self.owed
        } else {
            0
        };
        if granted > 0 {
            self.owed -= granted;
            self.instruments.permits_granted.add(granted, &[]);
        }
        if self.owed == 0 {
            return Poll::Ready(Ok(()));
        }

        self.instruments.requests_throttled.add(1, &[]);
        let retry_after = self.limiter.retry_after();
        trace!(granted, owed = self.owed, ?retry_after, "short of permits");

        if self.fail_fast {
            return Poll::Ready(Err(RingError::RateLimited { retry_after }.into()));
        }

        self.wait_start.get_or_insert_with(Instant::now);
        let nap = remaining.map_or(retry_after, |remaining| retry_after.min(remaining));
        let mut nap = Box::pin(sleep(nap));
        if nap.as_mut().poll(cx).is_pending() {
            self.sleep = Some(nap);
        } else {
            // Capacity may already be back
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.owed = self.permits;
        let start = self.wait_start.take();

        match self.timeout {
            Some(t) => {
                let budget = start.map_or(t, |s| t.saturating_sub(s.elapsed()));
                ResponseFuture::Bounded {
                    inner: timeout(budget, self.inner.call(req)),
                }
            }
            None => ResponseFuture::Unbounded {
                inner: self.inner.call(req),
            },
        }
    }
}

impl<L, S> RateLimitService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        let meter = global::meter("rate_limit_service");
        let instruments = RateLimitServiceMetrics {
            permits_granted: meter.u64_counter("permits_granted").build(),
            requests_throttled: meter.u64_counter("requests_throttled").build(),
        };

        Self {
            inner,
            limiter,
            permits: 1,
            owed: 1,
            sleep: None,
            partial_grants: true,
            fail_fast: false,
            timeout: None,
            wait_start: None,
            instruments,
        }
    }

    pub fn with_permits(mut self, permits: u64) -> Self {
        self.permits = permits;
        self.owed = permits;
        self
    }

    /// Whether permits granted before the full cost is available are kept.
    ///
    /// With `false`, each readiness check acquires the whole cost or nothing. Use this
    /// when the service may be dropped while short of permits, e.g. behind load
    /// shedding, so that no permits are charged without a request being served.
    pub fn with_partial_grants(mut self, partial_grants: bool) -> Self {
        self.partial_grants = partial_grants;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Permits still needed before the next request is admitted.
    pub fn owed(&self) -> u64 {
        self.owed
    }
}
