//! OS thread helpers

use std::cell::Cell;

thread_local! {
    static CACHED_TID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// Kernel thread id of the calling thread (`gettid`).
///
/// Cached per thread; used for pinning tasks to a specific worker.
#[inline]
pub fn thread_id() -> libc::pid_t {
    CACHED_TID.with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return cached;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
        cell.set(tid);
        tid
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable_within_thread() {
        assert_eq!(thread_id(), thread_id());
    }

    #[test]
    fn test_thread_id_differs_across_threads() {
        let main_tid = thread_id();
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main_tid, other);
    }
}
