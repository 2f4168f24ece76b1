//! Hooked connect to a blackhole address honors the configured
//! `tcp.connect.timeout`.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use filament::{config, hook, IoManager};

#[test]
fn hooked_connect_times_out_per_config() {
    let iom = IoManager::new(1, false, "conn-timeout").unwrap();

    // The hook layer registered this key and listens for changes.
    config::lookup(
        "tcp.connect.timeout",
        5000i64,
        "hooked connect timeout in milliseconds",
    )
    .set(300);

    type Outcome = (libc::c_int, libc::c_int, Duration);
    let outcome: Arc<Mutex<Option<Outcome>>> = Arc::new(Mutex::new(None));

    {
        let outcome = outcome.clone();
        iom.schedule(move || {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);

            // Non-routable test address: SYNs go nowhere.
            let addr = common::sockaddr_in([10, 255, 255, 1], 1);
            let start = Instant::now();
            let rc = unsafe {
                hook::connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            let errno = common::last_errno();
            *outcome.lock().unwrap() = Some((rc, errno, start.elapsed()));
            hook::close(fd);
        });
    }

    assert!(
        common::wait_until(Duration::from_secs(3), || outcome.lock().unwrap().is_some()),
        "connect never returned"
    );
    iom.stop();

    let (rc, errno, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(rc, -1);
    assert_eq!(errno, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(290), "too fast: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "too slow: {:?}", elapsed);
}
