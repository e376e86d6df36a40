use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Timestamp of a bucket that has never been the head.
pub(crate) const UNSET: u64 = u64::MAX;

/// One time slice of the ring.
///
/// Timestamps are nanoseconds from the owning limiter's clock anchor.
#[derive(Debug)]
pub(crate) struct Bucket {
    /// Permits granted while this bucket was the head
    arrivals: AtomicU64,
    /// When this bucket became the head, or `UNSET`
    created_at: AtomicU64,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            arrivals: AtomicU64::new(0),
            created_at: AtomicU64::new(UNSET),
        }
    }
}

impl Bucket {
    #[inline]
    pub(crate) fn arrivals(&self) -> u64 {
        self.arrivals.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn record(&self, granted: u64) {
        self.arrivals.fetch_add(granted, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn created_at(&self) -> u64 {
        self.created_at.load(Ordering::Acquire)
    }

    /// Stamps the creation time if the bucket has never been used.
    #[inline]
    pub(crate) fn stamp_if_unset(&self, now: u64) {
        let _ = self
            .created_at
            .compare_exchange(UNSET, now, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Recycles the bucket in place as a fresh slice starting at `created_at`.
    #[inline]
    pub(crate) fn reset(&self, created_at: u64) {
        self.arrivals.store(0, Ordering::Release);
        self.created_at.store(created_at, Ordering::Release);
    }

    /// Nanoseconds this bucket has been alive at `now`.
    ///
    /// An unset bucket, or one stamped by a caller whose clock read was later than
    /// `now`, has age zero.
    #[inline]
    pub(crate) fn age(&self, now: u64) -> u64 {
        match self.created_at() {
            UNSET => 0,
            created_at => now.saturating_sub(created_at),
        }
    }
}
