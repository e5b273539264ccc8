use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::info;

use weft_sync::Mutex;

/// Contention stress runner for the adaptive mutex.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Number of worker threads contending for one mutex.
    #[arg(short, long, default_value_t = 8)]
    threads: usize,

    /// Lock/unlock iterations per thread.
    #[arg(short, long, default_value_t = 100_000)]
    iterations: u64,

    /// Microseconds to hold the lock per iteration.
    #[arg(long, default_value_t = 0)]
    hold_us: u64,

    /// Acquire with this relative deadline (in milliseconds) instead of
    /// waiting forever; timed-out attempts are counted and retried as the
    /// next iteration.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Default)]
struct Totals {
    acquired: u64,
    timed_out: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    info!(
        "starting: {} threads x {} iterations, hold {} us, timeout {:?}",
        args.threads, args.iterations, args.hold_us, args.timeout_ms
    );

    let counter = Arc::new(Mutex::new(0u64));
    let hold = Duration::from_micros(args.hold_us);
    let timeout = args.timeout_ms.map(Duration::from_millis);

    let started = Instant::now();
    let workers: Vec<_> = (0..args.threads)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let mut totals = Totals::default();
                for _ in 0..args.iterations {
                    let guard = match timeout {
                        Some(timeout) => counter.try_lock_for(timeout),
                        None => Some(counter.lock()),
                    };
                    match guard {
                        Some(mut guard) => {
                            *guard += 1;
                            if !hold.is_zero() {
                                thread::sleep(hold);
                            }
                            totals.acquired += 1;
                        }
                        None => totals.timed_out += 1,
                    }
                }
                totals
            })
        })
        .collect();

    let mut totals = Totals::default();
    for worker in workers {
        let worker_totals = worker.join().expect("worker panicked");
        totals.acquired += worker_totals.acquired;
        totals.timed_out += worker_totals.timed_out;
    }
    let elapsed = started.elapsed();

    assert_eq!(*counter.lock(), totals.acquired);

    info!(
        "finished in {:.3}s: {} acquisitions ({:.0}/s), {} timeouts",
        elapsed.as_secs_f64(),
        totals.acquired,
        totals.acquired as f64 / elapsed.as_secs_f64(),
        totals.timed_out,
    );
}
