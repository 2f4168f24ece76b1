//! Eventfd wake notifier
//!
//! The reactor parks in `epoll_wait`; writing the eventfd breaks it out
//! so it can re-check the ready queue and timer wheel. Eventfd counter
//! semantics coalesce any number of notifies into a single wakeup.

use std::io;
use std::os::unix::io::RawFd;

use filament_core::error::{Result, RuntimeError};

pub struct EventFdNotifier {
    fd: RawFd,
}

impl EventFdNotifier {
    /// Create a fresh non-blocking eventfd. Closed on drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(RuntimeError::Io(io::Error::last_os_error()));
        }
        Ok(EventFdNotifier { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wake the poller. Best-effort; a pending, unread notification is
    /// as good as a new one.
    pub fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // EAGAIN means the counter is saturated, i.e. a wakeup is
            // already pending.
            if errno != libc::EAGAIN {
                log::error!("eventfd notify failed: errno {}", errno);
            }
        }
    }

    /// Consume pending notifications after the poller woke up.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_then_drain() {
        let notifier = EventFdNotifier::create().unwrap();
        notifier.notify();
        notifier.notify();

        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(
                notifier.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);
        assert_eq!(val, 2);

        // Drained: further reads would block (EAGAIN).
        let n = unsafe {
            libc::read(
                notifier.fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, -1);
        notifier.drain(); // no-op on empty counter
    }
}
