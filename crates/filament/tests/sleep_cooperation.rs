//! Hooked sleeps suspend fibers, not worker threads: two 1-second
//! sleeps on a single-worker pool finish in about 1 second total.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use filament::{hook, IoManager};

#[test]
fn two_hooked_sleeps_share_one_worker() {
    let iom = IoManager::new(1, true, "sleep-coop").unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let done = done.clone();
        iom.schedule(move || {
            hook::sleep(1);
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    // With use_caller the pool has no spawned workers; everything runs
    // inside stop() on this thread.
    let start = Instant::now();
    iom.stop();
    let elapsed = start.elapsed();

    assert_eq!(done.load(Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_millis(950), "finished too early: {:?}", elapsed);
    assert!(
        elapsed < Duration::from_millis(1800),
        "sleeps did not overlap: {:?}",
        elapsed
    );
}
