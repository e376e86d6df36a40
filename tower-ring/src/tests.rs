use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::future::Ready;
use futures::future::ready;
use quanta::Clock;
use ring_limit::Limiter;
use ring_limit::SlidingWindow;
use tokio::time::advance;
use tokio::time::pause;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use super::*;

#[derive(Clone, Debug)]
struct MockService {
    pub count: Arc<AtomicUsize>,
}

impl MockService {
    fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Service<()> for MockService {
    type Response = ();
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(()))
    }
}

fn mocked(rate: u64, window: Duration, buckets: u32) -> (Arc<SlidingWindow>, Arc<quanta::Mock>) {
    let (clock, mock) = Clock::mock();
    let limiter = SlidingWindow::with_clock(rate, window, buckets, clock).unwrap();
    (Arc::new(limiter), mock)
}

fn ring_error(err: BoxError) -> RingError {
    err.downcast_ref::<RingError>()
        .cloned()
        .unwrap_or_else(|| panic!("expected a RingError, got {err}"))
}

#[tokio::test]
async fn test_poll_ready_backpressure() {
    pause();

    // Two buckets of 50ms
    let (limiter, mock) = mocked(2, Duration::from_millis(100), 2);
    let mut service = RateLimitService::new(MockService::new(), limiter);

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();
    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();

    // The third request must wait for bucket 0 to leave the window
    let mut ready_fut = ServiceExt::<()>::ready(&mut service);
    tokio::select! {
        _ = &mut ready_fut => panic!("Should be throttled!"),
        _ = tokio::time::sleep(Duration::from_millis(10)) => {}
    }

    mock.increment(Duration::from_millis(120));
    advance(Duration::from_millis(50)).await;

    ready_fut.await.expect("Should recover");
    service.call(()).await.unwrap();
}

#[tokio::test]
async fn test_fail_fast_reports_retry_after() {
    let (limiter, _mock) = mocked(1, Duration::from_millis(100), 1);
    let mut service = RateLimitService::new(MockService::new(), limiter).with_fail_fast(true);

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();

    let err = ServiceExt::<()>::ready(&mut service)
        .await
        .map(|_| ())
        .unwrap_err();
    match ring_error(err) {
        RingError::RateLimited { retry_after } => {
            assert_eq!(retry_after, Duration::from_nanos(100_000_001))
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn test_weighted_request_keeps_partial_grants() {
    let (limiter, mock) = mocked(5, Duration::from_millis(100), 1);
    let mock_count = Arc::new(AtomicUsize::new(0));
    let mut service = RateLimitLayer::new(Arc::clone(&limiter))
        .with_permits(3)
        .with_fail_fast(true)
        .layer(MockService {
            count: mock_count.clone(),
        });

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();

    // Only 2 of the 3 permits are left in this window
    assert!(ServiceExt::<()>::ready(&mut service).await.is_err());
    assert_eq!(service.owed(), 1);
    assert_eq!(limiter.outstanding(), 5);

    // The next window only has to supply the missing permit
    mock.increment(Duration::from_millis(101));
    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();

    assert_eq!(service.owed(), 3);
    assert_eq!(limiter.outstanding(), 1);
    assert_eq!(mock_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_free_requests_bypass_the_limiter() {
    let (limiter, _mock) = mocked(0, Duration::from_secs(1), 4);
    let mut service = RateLimitLayer::new(limiter)
        .with_permits(0)
        .layer(MockService::new());

    for _ in 0..10 {
        ServiceExt::<()>::ready(&mut service).await.unwrap();
        service.call(()).await.unwrap();
    }
}

#[tokio::test]
async fn test_timeout_while_waiting_for_permits() {
    pause();

    let (limiter, _mock) = mocked(1, Duration::from_secs(10), 1);
    let mut service = RateLimitLayer::new(limiter)
        .with_timeout(Duration::from_millis(50))
        .layer(MockService::new());

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();

    let err = ServiceExt::<()>::ready(&mut service)
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(ring_error(err), RingError::Timeout));
}

#[tokio::test]
async fn test_timeout_while_executing() {
    pause();

    let limiter = Arc::new(SlidingWindow::new(10, Duration::from_secs(1), 10).unwrap());
    let slow = tower::service_fn(|_: ()| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, BoxError>(())
    });
    let mut service = RateLimitLayer::new(limiter)
        .with_timeout(Duration::from_millis(20))
        .layer(slow);

    let err = ServiceExt::<()>::ready(&mut service)
        .await
        .unwrap()
        .call(())
        .await
        .unwrap_err();
    assert!(matches!(ring_error(err), RingError::Timeout));
}

#[tokio::test]
async fn test_layer_integration() {
    let limiter = SlidingWindow::new(100, Duration::from_secs(1), 10).unwrap();

    let mut service = ServiceBuilder::new()
        .layer(RateLimitLayer::new(Arc::new(limiter)))
        .service(MockService::new());

    ServiceExt::<()>::ready(&mut service)
        .await
        .unwrap()
        .call(())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shared_state_across_clones() {
    let rl = SlidingWindow::new(1, Duration::from_secs(10), 1).unwrap();
    let layer = RateLimitLayer::new(Arc::new(rl));

    let mut svc1 = layer.layer(MockService::new());
    let mut svc2 = layer.layer(MockService::new());

    ServiceExt::<()>::ready(&mut svc1)
        .await
        .unwrap()
        .call(())
        .await
        .unwrap();

    // svc2 should now be throttled because svc1 used the permit
    assert!(futures::poll!(ServiceExt::<()>::ready(&mut svc2)).is_pending());
}

#[tokio::test]
async fn test_concurrent_hammer() {
    let capacity = 50;
    let limiter = Arc::new(SlidingWindow::new(capacity, Duration::from_secs(10), 10).unwrap());

    let mock_count = Arc::new(AtomicUsize::new(0));
    let service = RateLimitService::new(
        MockService {
            count: mock_count.clone(),
        },
        limiter,
    );
    let service = tower::buffer::Buffer::new(service, 100);

    let mut handles = vec![];
    for _ in 0..100 {
        let mut svc = service.clone();
        handles.push(tokio::spawn(async move {
            let _ = svc.ready().await.expect("Service should stay healthy");
            svc.call(()).await
        }));
    }

    // Half the requests stay pending behind the limiter, so stop waiting after a while
    let mut completed = 0;
    let timeout = tokio::time::sleep(Duration::from_millis(50));
    tokio::pin!(timeout);

    for h in handles {
        tokio::select! {
            res = h => {
                res.expect("Task panicked").expect("Call failed");
                completed += 1;
            }
            _ = &mut timeout => break,
        }
    }

    assert_eq!(mock_count.load(Ordering::SeqCst), capacity as usize);
    assert_eq!(completed, capacity as usize);
}

#[tokio::test]
async fn test_managed_layer_sheds_excess() {
    let capacity = 5;
    let limiter = SlidingWindow::new(capacity, Duration::from_secs(60), 6).unwrap();
    let layer = ManagedRateLimitLayer::new(Arc::new(limiter), Duration::from_millis(100));

    let mock_count = Arc::new(AtomicUsize::new(0));
    let service = ServiceBuilder::new().layer(layer).service(MockService {
        count: mock_count.clone(),
    });

    let mut handles = vec![];
    for _ in 0..20 {
        let mut cloned_svc = service.clone();
        handles.push(tokio::spawn(async move {
            let ready_svc = cloned_svc.ready().await?;
            ready_svc.call(()).await
        }));
    }

    let mut success = 0;
    let mut shed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => success += 1,
            Err(err) => {
                assert!(matches!(ring_error(err), RingError::Overloaded));
                shed += 1;
            }
        }
    }

    assert_eq!(success, capacity);
    assert_eq!(shed, 15);
    assert_eq!(mock_count.load(Ordering::SeqCst), capacity as usize);
}

#[tokio::test]
async fn test_all_or_nothing_grants_charge_nothing_when_short() {
    let (limiter, _mock) = mocked(5, Duration::from_millis(100), 1);
    let mut service = RateLimitLayer::new(Arc::clone(&limiter))
        .with_permits(3)
        .with_partial_grants(false)
        .with_fail_fast(true)
        .layer(MockService::new());

    ServiceExt::<()>::ready(&mut service).await.unwrap();
    service.call(()).await.unwrap();

    assert!(ServiceExt::<()>::ready(&mut service).await.is_err());
    assert_eq!(service.owed(), 3);
    assert_eq!(limiter.outstanding(), 3);
}

#[tokio::test]
async fn test_managed_layer_sheds_without_charging() {
    let (limiter, _mock) = mocked(5, Duration::from_secs(60), 6);
    let layer =
        ManagedRateLimitLayer::new(Arc::clone(&limiter), Duration::from_millis(100)).with_permits(3);

    let mock_count = Arc::new(AtomicUsize::new(0));
    let service = ServiceBuilder::new().layer(layer).service(MockService {
        count: mock_count.clone(),
    });

    let mut first = service.clone();
    first.ready().await.unwrap().call(()).await.unwrap();

    // Two permits are left, one short of the next request
    let mut second = service.clone();
    let err = second.ready().await.unwrap().call(()).await.unwrap_err();
    assert!(matches!(ring_error(err), RingError::Overloaded));
    drop(second);

    assert_eq!(limiter.outstanding(), 3);
    assert_eq!(mock_count.load(Ordering::SeqCst), 1);
    assert!(limiter.try_acquire(2));
}
