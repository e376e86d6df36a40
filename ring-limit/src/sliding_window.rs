use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;
use tracing::debug;
use tracing::trace;

use crate::ConfigError;
use crate::Limiter;
use crate::bucket::Bucket;
use crate::bucket::UNSET;

/// Cache-line aligned counter so CAS traffic on the aggregate does not
/// invalidate the line holding the ring pointer and timing constants.
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheLineU64(AtomicU64);

/// A Sliding Window limiter backed by a ring of time buckets.
///
/// The window is divided into `bucket_count` slices. The head bucket collects the permits
/// granted during the current slice. When it ages out, the oldest bucket is evicted and
/// becomes the new head. `aggregate` approximates the sum of the arrivals of every bucket
/// except the next one to be evicted, and it is the only value checked against `rate`.
///
/// The aggregate and the per-bucket counts are updated by separate atomic operations, so a
/// reader may briefly see them disagree. Every rotation recomputes the aggregate from the
/// buckets, which corrects any such drift.
#[derive(Debug)]
pub struct SlidingWindow {
    aggregate: CacheLineU64,
    rate: u64,
    ring: Box<[Bucket]>,
    bucket_count: u32,
    head: AtomicU32,
    bucket_ns: u64,
    clock: Clock,
    anchor: Instant,
}

impl SlidingWindow {
    /// Creates a new `SlidingWindow` limiter.
    ///
    /// # Arguments
    ///
    /// * `rate` - The maximum number of permits granted within one window.
    /// * `window` - The duration of the sliding window.
    /// * `buckets` - The number of slices the window is divided into.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroBuckets`] if `buckets` is zero.
    pub fn new(rate: u64, window: Duration, buckets: u32) -> Result<Self, ConfigError> {
        Self::with_clock(rate, window, buckets, Clock::new())
    }

    /// Creates a new `SlidingWindow` limiter reading time from `clock`.
    pub fn with_clock(
        rate: u64,
        window: Duration,
        buckets: u32,
        clock: Clock,
    ) -> Result<Self, ConfigError> {
        if buckets == 0 {
            return Err(ConfigError::ZeroBuckets);
        }

        let anchor = clock.now();
        // Windows beyond u64 nanoseconds (~584 years) saturate
        let window_ns = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        let bucket_ns = window_ns / buckets as u64;
        let ring = (0..buckets).map(|_| Bucket::default()).collect();

        debug!(
            rate,
            ?window,
            buckets,
            bucket_ns,
            "created sliding window limiter"
        );

        Ok(Self {
            aggregate: CacheLineU64::default(),
            rate,
            ring,
            bucket_count: buckets,
            head: AtomicU32::new(0),
            bucket_ns,
            clock,
            anchor,
        })
    }

    /// The permit budget per window.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// The number of buckets in the ring.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// The lifetime of a single bucket.
    pub fn bucket_duration(&self) -> Duration {
        Duration::from_nanos(self.bucket_ns)
    }

    /// The effective window, which may be slightly shorter than requested because the
    /// bucket duration is truncated to whole nanoseconds.
    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.window_ns())
    }

    /// The permits currently counted against the budget.
    pub fn outstanding(&self) -> u64 {
        self.aggregate.0.load(Ordering::Acquire)
    }

    #[inline]
    fn now(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }

    #[inline]
    fn window_ns(&self) -> u64 {
        self.bucket_ns.saturating_mul(self.bucket_count as u64)
    }

    /// Sum of arrivals over every bucket except `skip`.
    fn sum_except(&self, skip: usize) -> u64 {
        self.ring
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != skip)
            .map(|(_, bucket)| bucket.arrivals())
            .sum()
    }

    /// Start time for the bucket that follows one created at `previous`.
    ///
    /// New heads are placed on the bucket grid, so a head left stale by an idle gap stays
    /// stale and is rotated again. Once the gap exceeds the window, the grid is pulled
    /// forward so that catching up never takes more than one lap of the ring.
    #[inline]
    fn next_created_at(&self, previous: u64, now: u64) -> u64 {
        previous
            .saturating_add(self.bucket_ns)
            .max(now.saturating_sub(self.window_ns()))
    }

    /// Rotates the ring as needed, then grants up to `permits`. When `partial` is false,
    /// anything short of the full request grants nothing.
    fn admit(&self, permits: u64, partial: bool) -> u64 {
        let now = self.now();
        self.ring[self.head.load(Ordering::Acquire) as usize].stamp_if_unset(now);

        loop {
            let old = self.aggregate.0.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            let current = &self.ring[head as usize];

            // 1. Rotate if the head has aged out
            if current.age(now) > self.bucket_ns {
                let evict = (head + 1) % self.bucket_count;
                let fresh = self.sum_except(evict as usize);

                if self
                    .aggregate
                    .0
                    .compare_exchange(old, fresh, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    let created_at = self.next_created_at(current.created_at(), now);
                    self.ring[evict as usize].reset(created_at);
                    self.head.store(evict, Ordering::Release);
                    trace!(evicted = evict, aggregate = fresh, created_at, "rotated ring");
                }
                continue;
            }

            // 2. Grant from the current bucket
            let room = self.rate as i128 - old as i128;
            if room <= 0 {
                return 0;
            }
            let room = room as u64;
            if !partial && permits > room {
                return 0;
            }
            let grant = permits.min(room);
            if grant == 0 {
                return 0;
            }

            if self
                .aggregate
                .0
                .compare_exchange(old, old + grant, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                current.record(grant);
                return grant;
            }
        }
    }
}

impl Limiter for SlidingWindow {
    fn acquire(&self, permits: u64) -> u64 {
        self.admit(permits, true)
    }

    fn try_acquire(&self, permits: u64) -> bool {
        permits == 0 || self.admit(permits, false) == permits
    }

    fn retry_after(&self) -> Duration {
        let head = &self.ring[self.head.load(Ordering::Acquire) as usize];
        match head.created_at() {
            UNSET => Duration::ZERO,
            created_at => {
                let expires = created_at
                    .saturating_add(self.bucket_ns)
                    .saturating_add(1);
                Duration::from_nanos(expires.saturating_sub(self.now()))
            }
        }
    }
}
