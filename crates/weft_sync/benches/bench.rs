use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, black_box, Criterion};

use weft_sync::Mutex;

fn uncontended(c: &mut Criterion) {
    let mutex = Mutex::new(0u64);
    c.bench_function("Mutex::lock uncontended", |b| {
        b.iter(|| {
            *mutex.lock() += 1;
        })
    });
    c.bench_function("Mutex::try_lock uncontended", |b| {
        b.iter(|| {
            if let Some(mut guard) = mutex.try_lock() {
                *guard += 1;
            }
        })
    });
    black_box(mutex.lock());
}

fn contended(c: &mut Criterion) {
    c.bench_function("Mutex::lock 4 threads x 10k", |b| {
        b.iter(|| {
            let counter = Arc::new(Mutex::new(0u64));
            let threads: Vec<_> = (0..4)
                .map(|_| {
                    let counter = Arc::clone(&counter);
                    thread::spawn(move || {
                        for _ in 0..10_000 {
                            *counter.lock() += 1;
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }
            assert_eq!(*counter.lock(), 40_000);
        })
    });
}

criterion_group!(benches, uncontended, contended);
criterion_main!(benches);
