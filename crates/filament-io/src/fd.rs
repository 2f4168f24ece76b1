//! File-descriptor registry
//!
//! Tracks, per fd the hook layer has seen: whether it is a socket,
//! whether the *user* asked for non-blocking mode, whether the kernel
//! side is already non-blocking, and the configured send/recv deadlines.
//!
//! Sockets are switched to `O_NONBLOCK` at creation so every hooked
//! syscall observes `EAGAIN` instead of blocking the worker thread; the
//! user-visible flag is emulated separately (see `hook::fcntl`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// Deadline value meaning "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which configured deadline applies to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: read-family calls.
    Recv,
    /// `SO_SNDTIMEO`: write-family calls.
    Send,
}

/// Per-fd bookkeeping for the hook layer.
pub struct FdEntry {
    fd: libc::c_int,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    is_closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdEntry {
    fn new(fd: libc::c_int) -> FdEntry {
        let mut is_socket = false;
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == 0 {
            is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        }

        let mut sys_nonblock = false;
        if is_socket {
            // Force kernel-side non-blocking; the hook relies on EAGAIN.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && (flags & libc::O_NONBLOCK) == 0 {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        FdEntry {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> libc::c_int {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    /// The user's view of `O_NONBLOCK`, independent of the kernel flag.
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide fd registry. Entries are created lazily on first use and
/// removed when the fd is closed through the hook layer.
pub struct FdRegistry {
    entries: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

impl FdRegistry {
    fn new() -> FdRegistry {
        FdRegistry {
            entries: RwLock::new(vec![None; 64]),
        }
    }

    /// The process singleton.
    pub fn instance() -> &'static FdRegistry {
        static INSTANCE: OnceLock<FdRegistry> = OnceLock::new();
        INSTANCE.get_or_init(FdRegistry::new)
    }

    /// Fetch the entry for `fd`, creating it when `create` is set.
    pub fn get(&self, fd: libc::c_int, create: bool) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        {
            let entries = self.entries.read();
            match entries.get(fd as usize) {
                Some(Some(entry)) => return Some(entry.clone()),
                Some(None) if !create => return None,
                None if !create => return None,
                _ => {}
            }
        }

        let mut entries = self.entries.write();
        if fd as usize >= entries.len() {
            // Grown by half, never shrunk.
            entries.resize(fd as usize * 3 / 2 + 1, None);
        }
        if let Some(existing) = &entries[fd as usize] {
            return Some(existing.clone());
        }
        let entry = Arc::new(FdEntry::new(fd));
        entries[fd as usize] = Some(entry.clone());
        Some(entry)
    }

    /// Forget the entry for `fd`.
    pub fn del(&self, fd: libc::c_int) {
        if fd < 0 {
            return;
        }
        let mut entries = self.entries.write();
        if let Some(slot) = entries.get_mut(fd as usize) {
            *slot = None;
        }
    }
}
