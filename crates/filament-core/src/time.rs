//! Monotonic clock
//!
//! All deadlines in the runtime are milliseconds on this clock. It reads
//! `CLOCK_MONOTONIC_RAW`, which is immune to NTP slew and settimeofday
//! jumps; the timer wheel's rollover detection exists only as a second
//! line of defense.

/// Milliseconds since an arbitrary fixed point (boot). Non-decreasing.
#[inline]
pub fn monotonic_ms() -> u64 {
    let ts = raw_clock();
    ts.tv_sec as u64 * 1_000 + ts.tv_nsec as u64 / 1_000_000
}

/// Microseconds since the same fixed point as [`monotonic_ms`].
#[inline]
pub fn monotonic_us() -> u64 {
    let ts = raw_clock();
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

#[inline]
fn raw_clock() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Cannot fail for a valid clock id on Linux.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    ts
}
