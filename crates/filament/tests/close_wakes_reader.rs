//! Cancellation semantics of parked readers: a hooked close shakes a
//! reader loose with EBADF immediately, and SO_RCVTIMEO surfaces as
//! ETIMEDOUT.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use filament::{hook, IoManager};

type ReadOutcome = (libc::ssize_t, libc::c_int, Duration);

#[test]
fn close_wakes_parked_reader_with_ebadf() {
    let iom = IoManager::new(2, false, "close-wake").unwrap();
    let (read_end, write_end) = common::registered_socketpair();

    let outcome: Arc<Mutex<Option<ReadOutcome>>> = Arc::new(Mutex::new(None));

    {
        let outcome = outcome.clone();
        iom.schedule(move || {
            let mut buf = [0u8; 64];
            let start = Instant::now();
            let n = unsafe {
                hook::read(read_end, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            let errno = common::last_errno();
            *outcome.lock().unwrap() = Some((n, errno, start.elapsed()));
        });
    }
    iom.schedule(move || {
        hook::usleep(50_000);
        hook::close(read_end);
    });

    assert!(
        common::wait_until(Duration::from_secs(2), || outcome.lock().unwrap().is_some()),
        "reader stayed parked after close"
    );
    iom.stop();
    assert_eq!(iom.pending_event_count(), 0);

    let (n, errno, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(n, -1);
    assert_eq!(errno, libc::EBADF);
    assert!(elapsed >= Duration::from_millis(40), "woke before close: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "woke too late: {:?}", elapsed);

    unsafe { libc::close(write_end) };
}

#[test]
fn recv_timeout_surfaces_as_etimedout() {
    let iom = IoManager::new(1, false, "rcvtimeo").unwrap();
    let (read_end, write_end) = common::registered_socketpair();

    let outcome: Arc<Mutex<Option<ReadOutcome>>> = Arc::new(Mutex::new(None));

    {
        let outcome = outcome.clone();
        iom.schedule(move || {
            let tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 200_000,
            };
            let rc = unsafe {
                hook::setsockopt(
                    read_end,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const libc::timeval as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            assert_eq!(rc, 0);

            let mut buf = [0u8; 64];
            let start = Instant::now();
            let n = unsafe {
                hook::read(read_end, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            let errno = common::last_errno();
            *outcome.lock().unwrap() = Some((n, errno, start.elapsed()));
        });
    }

    assert!(
        common::wait_until(Duration::from_secs(2), || outcome.lock().unwrap().is_some()),
        "read never timed out"
    );
    iom.stop();

    let (n, errno, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(n, -1);
    assert_eq!(errno, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(190), "too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "too slow: {:?}", elapsed);

    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
}
