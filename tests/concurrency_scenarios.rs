//! Multi-threaded integration tests for the end-to-end scenarios in the
//! specification's testable-properties section: read concurrency (reads
//! overlap each other but never an update) and reclamation stress (freed
//! allocations track completed callbacks once the engine quiesces).

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use rwlog::Engine;

/// Counts net allocations (allocs minus frees) made through the global
/// allocator, so reclamation can be checked without a leak-detection tool.
struct CountingAllocator;

static LIVE: AtomicI64 = AtomicI64::new(0);

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        LIVE.fetch_add(1, Ordering::Relaxed);
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        LIVE.fetch_sub(1, Ordering::Relaxed);
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

/// Scenario 4: one low-rate update submitter, eight read submitters whose
/// callbacks track concurrent occupancy. Expect overlapping reads (gauge
/// max >= 2) and mutual exclusion against updates (gauge is 0 whenever an
/// update callback runs).
#[test]
fn read_concurrency_probe() {
    let engine = Arc::new(Engine::new());
    let concurrent_reads = Arc::new(AtomicU32::new(0));
    let max_concurrent_reads = Arc::new(AtomicU32::new(0));
    let update_violations = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(9));

    let writer = {
        let engine = engine.clone();
        let concurrent_reads = concurrent_reads.clone();
        let violations = update_violations.clone();
        let start = start.clone();
        thread::spawn(move || {
            start.wait();
            let deadline = Instant::now() + Duration::from_millis(300);
            while Instant::now() < deadline {
                let concurrent_reads = concurrent_reads.clone();
                let violations = violations.clone();
                engine.submit_update(None, move || {
                    if concurrent_reads.load(Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(200));
                });
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let concurrent_reads = concurrent_reads.clone();
            let max_concurrent_reads = max_concurrent_reads.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                let deadline = Instant::now() + Duration::from_millis(300);
                while Instant::now() < deadline {
                    let concurrent_reads = concurrent_reads.clone();
                    let max_concurrent_reads = max_concurrent_reads.clone();
                    engine.submit_read(None, move || {
                        let now = concurrent_reads.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent_reads.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(100));
                        concurrent_reads.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    engine.sync();

    assert_eq!(update_violations.load(Ordering::SeqCst), 0);
    assert!(
        max_concurrent_reads.load(Ordering::SeqCst) >= 2,
        "expected at least two reads to overlap, saw max {}",
        max_concurrent_reads.load(Ordering::SeqCst)
    );
}

/// Scenario 5: many submitters hammering one engine, then dropped. Net live
/// allocations attributable to the engine (measured as the delta across the
/// engine's lifetime) must settle back to at most the overhead of one
/// pending tail segment once every callback has run and the engine itself
/// has been torn down.
#[test]
fn reclamation_stress_settles_to_baseline() {
    let before = LIVE.load(Ordering::SeqCst);

    {
        let engine = Arc::new(Engine::new());
        let total_callbacks = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                let total_callbacks = total_callbacks.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    let deadline = Instant::now() + Duration::from_millis(400);
                    while Instant::now() < deadline {
                        let total_callbacks = total_callbacks.clone();
                        if i % 2 == 0 {
                            engine.submit_update(None, move || {
                                total_callbacks.fetch_add(1, Ordering::SeqCst);
                            });
                        } else {
                            engine.submit_read(None, move || {
                                total_callbacks.fetch_add(1, Ordering::SeqCst);
                            });
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        engine.sync();
        assert!(total_callbacks.load(Ordering::SeqCst) > 0);
    }

    // Engine dropped: its head chain, gate, and final tail segment are gone.
    // Live allocation count should return to (roughly) where it started;
    // some slack is allowed for allocator/runtime bookkeeping unrelated to
    // the engine itself.
    let after = LIVE.load(Ordering::SeqCst);
    assert!(
        after - before <= 8,
        "expected live allocations to settle near baseline, before={before} after={after}"
    );
}
