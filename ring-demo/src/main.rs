use std::sync::Arc;
use std::sync::Barrier;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use ring_limit::Limiter;
use ring_limit::SlidingWindow;
use tracing::error;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Hammer a sliding window limiter from many threads.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Permits allowed per window
    #[arg(long, default_value_t = 100_000)]
    rate: u64,

    /// Length of the sliding window
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    window: Duration,

    /// Number of buckets the window is split into
    #[arg(long, default_value_t = 10)]
    buckets: u32,

    /// Number of concurrent callers
    #[arg(long, default_value_t = 100)]
    workers: usize,

    /// Calls made by each caller
    #[arg(long, default_value_t = 10_000)]
    loops: usize,

    /// Pause between two calls of one caller
    #[arg(long, default_value = "100us", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Permits requested per call, 1 uses `get_one`
    #[arg(long, default_value_t = 1)]
    permits: u64,
}

#[derive(Default)]
struct Tally {
    success: AtomicU64,
    fail: AtomicU64,
}

fn run_worker(
    limiter: &SlidingWindow,
    tally: &Tally,
    args: &Args,
) -> Result<Histogram<u64>, BoxError> {
    let mut latency = Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3)?;

    for _ in 0..args.loops {
        let call_start = Instant::now();
        let granted = if args.permits == 1 {
            limiter.get_one() as u64
        } else {
            limiter.acquire(args.permits)
        };
        latency.saturating_record(call_start.elapsed().as_nanos() as u64);

        tally.success.fetch_add(granted, Ordering::Relaxed);
        tally
            .fail
            .fetch_add(args.permits - granted, Ordering::Relaxed);
        thread::sleep(args.interval);
    }

    Ok(latency)
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Arc::new(Args::parse());

    let limiter = SlidingWindow::new(args.rate, args.window, args.buckets)
        .inspect_err(|err| error!(error = %err, "invalid limiter configuration"))?;
    let limiter = Arc::new(limiter);
    let tally = Arc::new(Tally::default());

    info!(
        cores = thread::available_parallelism().map_or(1, |n| n.get()),
        workers = args.workers,
        loops = args.loops,
        permits = args.permits,
        "starting"
    );

    let barrier = Arc::new(Barrier::new(args.workers + 1));
    let mut handles = Vec::with_capacity(args.workers);
    for _ in 0..args.workers {
        let limiter = Arc::clone(&limiter);
        let tally = Arc::clone(&tally);
        let args = Arc::clone(&args);
        let bar = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            bar.wait();
            run_worker(&limiter, &tally, &args)
        }));
    }

    barrier.wait();
    let start = Instant::now();

    let mut latency = Histogram::<u64>::new_with_bounds(1, 60_000_000_000, 3)?;
    for handle in handles {
        let worker = handle.join().map_err(|_| "worker thread panicked")??;
        latency.add(&worker)?;
    }
    let elapsed = start.elapsed();

    let success = tally.success.load(Ordering::Relaxed);
    let fail = tally.fail.load(Ordering::Relaxed);

    println!("--- {} ---", humantime::format_duration(args.window));
    println!("Buckets:         {}", limiter.bucket_count());
    println!("Bucket Duration: {:.2?}", limiter.bucket_duration());
    println!("Success/Fail:    {}/{}", success, fail);
    println!("Elapsed:         {} ms", elapsed.as_millis());
    println!(
        "Success Rate:    {:.2} permits/sec",
        success as f64 / elapsed.as_secs_f64()
    );

    if !args.window.is_zero() {
        let per_sec = args.rate as f64 / args.window.as_secs_f64();
        let expected_min = (per_sec * elapsed.as_secs() as f64) as u64;
        println!(
            "Expected:        [{}, {}]",
            expected_min,
            expected_min.saturating_add(args.rate)
        );
    }

    println!("P50 (Acquire):   {}ns", latency.value_at_quantile(0.5));
    println!("P99 (Acquire):   {}ns", latency.value_at_quantile(0.99));
    println!("Max (Acquire):   {}ns", latency.max());

    Ok(())
}
