//! Timer laws against a live reactor: one-shot timers fire exactly
//! once, and a recurring timer can reshape and cancel itself from its
//! own callback.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use filament::{IoManager, Timer};

#[test]
fn one_shot_timer_fires_exactly_once() {
    let iom = IoManager::new(1, false, "timer-once").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    let timer = iom.add_timer(
        50,
        move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    assert!(common::wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    // Already fired: nothing left to cancel.
    assert!(!timer.cancel());

    iom.stop();
}

#[test]
fn recurring_timer_reshapes_and_cancels_itself() {
    let iom = IoManager::new(1, false, "timer-self").unwrap();

    let fire_times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let handle: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));

    let timer = {
        let fire_times = fire_times.clone();
        let handle = handle.clone();
        iom.add_timer(
            100,
            move || {
                let count = {
                    let mut times = fire_times.lock().unwrap();
                    times.push(Instant::now());
                    times.len()
                };
                if count == 3 {
                    handle.lock().unwrap().as_ref().unwrap().reset(50, true);
                }
                if count == 6 {
                    handle.lock().unwrap().take().unwrap().cancel();
                }
            },
            true,
        )
    };
    *handle.lock().unwrap() = Some(timer);

    assert!(
        common::wait_until(Duration::from_secs(3), || fire_times.lock().unwrap().len() >= 6),
        "recurring timer stalled"
    );
    std::thread::sleep(Duration::from_millis(300));

    let times = fire_times.lock().unwrap().clone();
    assert_eq!(times.len(), 6, "callback ran after cancel");

    // After the reset at count 3, fires 4..6 come on the 50ms cadence.
    for pair in times[3..].windows(2) {
        let delta = pair[1] - pair[0];
        assert!(delta >= Duration::from_millis(30), "delta {:?}", delta);
        assert!(delta < Duration::from_millis(300), "delta {:?}", delta);
    }

    iom.stop();
}
