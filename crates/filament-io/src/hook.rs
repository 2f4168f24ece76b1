//! Hooked blocking syscalls
//!
//! POSIX-shaped replacements for the blocking calls a fiber is allowed
//! to make. On a worker thread (hook enabled) an operation that would
//! block instead registers interest with the reactor and yields the
//! calling fiber; the worker is free to run other fibers until the fd
//! becomes ready or the configured deadline fires. Everywhere else the
//! functions collapse to the raw libc call.
//!
//! Two shapes cover everything here:
//!
//! - **sleep**: arm a one-shot timer that re-schedules the fiber, yield.
//! - **I/O**: try the raw call; on `EAGAIN` arm a conditional timeout
//!   timer plus an fd event, yield, and retry on wakeup. A timeout
//!   surfaces as `-1`/`ETIMEDOUT`, a close as `-1`/`EBADF`.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use filament_core::config;
use filament_runtime::{tls, Fiber};

use crate::fd::{FdRegistry, TimeoutKind, NO_TIMEOUT};
use crate::iomanager::{Event, IoManager};

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);
static HOOK_CONFIG_INIT: Once = Once::new();

/// Wire the `tcp.connect.timeout` config key to the hooked `connect`
/// deadline. Idempotent; `IoManager::new` calls it.
pub(crate) fn init_hook_config() {
    HOOK_CONFIG_INIT.call_once(|| {
        let var = config::lookup(
            "tcp.connect.timeout",
            5000i64,
            "hooked connect timeout in milliseconds",
        );
        CONNECT_TIMEOUT_MS.store(to_timeout_ms(var.value()), Ordering::Release);
        var.add_listener(|old, new| {
            log::info!("tcp connect timeout changed from {} to {}", old, new);
            CONNECT_TIMEOUT_MS.store(to_timeout_ms(*new), Ordering::Release);
        });
    });
}

fn to_timeout_ms(v: i64) -> u64 {
    if v < 0 {
        NO_TIMEOUT
    } else {
        v as u64
    }
}

fn connect_timeout_ms() -> u64 {
    init_hook_config();
    CONNECT_TIMEOUT_MS.load(Ordering::Acquire)
}

#[inline]
fn errno() -> libc::c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: libc::c_int) {
    unsafe {
        *libc::__errno_location() = e;
    }
}

/// Shared between a parked I/O call and its timeout timer: 0 while the
/// wait is live, otherwise the errno the waiter must report.
#[derive(Default)]
struct CancelFlag(AtomicI32);

impl CancelFlag {
    #[inline]
    fn set(&self, e: libc::c_int) {
        self.0.store(e, Ordering::Release);
    }

    #[inline]
    fn get(&self) -> libc::c_int {
        self.0.load(Ordering::Acquire)
    }
}

/// The I/O pattern shared by the accept/read/write families.
unsafe fn do_io(
    fd: libc::c_int,
    name: &'static str,
    event: Event,
    timeout_kind: TimeoutKind,
    raw: impl Fn() -> libc::ssize_t,
) -> libc::ssize_t {
    if !tls::hook_enabled() {
        return raw();
    }
    let Some(entry) = FdRegistry::instance().get(fd, false) else {
        return raw();
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return raw();
    }

    let timeout_ms = entry.timeout_ms(timeout_kind);
    let cancel = Arc::new(CancelFlag::default());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block. Park this fiber on the reactor.
        let Some(iom) = IoManager::current() else {
            // Hook enabled but no reactor on this thread: report the
            // EAGAIN the raw call produced.
            return n;
        };

        let timer = if timeout_ms != NO_TIMEOUT {
            let weak_cancel = Arc::downgrade(&cancel);
            let weak_iom = Arc::downgrade(&iom);
            Some(iom.add_conditional_timer(
                timeout_ms,
                move || {
                    let Some(cancel) = weak_cancel.upgrade() else {
                        return;
                    };
                    if cancel.get() != 0 {
                        return;
                    }
                    cancel.set(libc::ETIMEDOUT);
                    if let Some(iom) = weak_iom.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                Arc::downgrade(&cancel),
                false,
            ))
        } else {
            None
        };

        if let Err(err) = iom.add_event(fd, event) {
            log::error!("{}: add_event({}, {:?}) failed: {}", name, fd, event, err);
            if let Some(timer) = timer {
                timer.cancel();
            }
            return -1;
        }

        Fiber::yield_now();

        if let Some(timer) = timer {
            timer.cancel();
        }
        let cancelled = cancel.get();
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Woken by readiness: retry the raw call.
    }
}

// ── Sleep family ──

fn hooked_sleep_ms(ms: u64) {
    let Some(iom) = IoManager::current() else {
        // Worker of a reactor-less scheduler; nothing to park on.
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    let weak_iom = Arc::downgrade(&iom);
    iom.add_timer(
        ms,
        move || {
            if let Some(iom) = weak_iom.upgrade() {
                iom.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    Fiber::yield_now();
}

pub fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if !tls::hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    hooked_sleep_ms(seconds as u64 * 1_000);
    0
}

pub fn usleep(usec: libc::useconds_t) -> libc::c_int {
    if !tls::hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    hooked_sleep_ms(usec as u64 / 1_000);
    0
}

/// # Safety
///
/// `req` must point to a valid timespec; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> libc::c_int {
    if !tls::hook_enabled() {
        return libc::nanosleep(req, rem);
    }
    let req = &*req;
    let ms = req.tv_sec as u64 * 1_000 + req.tv_nsec as u64 / 1_000_000;
    hooked_sleep_ms(ms);
    0
}

// ── Socket lifecycle ──

pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> libc::c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !tls::hook_enabled() || fd < 0 {
        return fd;
    }
    // Eagerly registered: the entry's constructor flips the fd to
    // non-blocking so every later hooked call sees EAGAIN, not a block.
    FdRegistry::instance().get(fd, true);
    fd
}

/// Hooked `connect` with an explicit deadline.
///
/// # Safety
///
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> libc::c_int {
    if !tls::hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(entry) = FdRegistry::instance().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if !(n == -1 && errno() == libc::EINPROGRESS) {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };
    let cancel = Arc::new(CancelFlag::default());
    let timer = if timeout_ms != NO_TIMEOUT {
        let weak_cancel = Arc::downgrade(&cancel);
        let weak_iom = Arc::downgrade(&iom);
        Some(iom.add_conditional_timer(
            timeout_ms,
            move || {
                let Some(cancel) = weak_cancel.upgrade() else {
                    return;
                };
                if cancel.get() != 0 {
                    return;
                }
                cancel.set(libc::ETIMEDOUT);
                if let Some(iom) = weak_iom.upgrade() {
                    iom.cancel_event(fd, Event::WRITE);
                }
            },
            Arc::downgrade(&cancel),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::WRITE) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(timer) = timer {
                timer.cancel();
            }
            let cancelled = cancel.get();
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(err) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            log::error!("connect: add_event({}, WRITE) failed: {}", fd, err);
        }
    }

    // The socket is writable (or the wait failed); SO_ERROR tells which.
    let mut error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut libc::c_int as *mut libc::c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// # Safety
///
/// See [`connect_with_timeout`].
pub unsafe fn connect(
    fd: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::c_int {
    connect_with_timeout(fd, addr, addrlen, connect_timeout_ms())
}

/// # Safety
///
/// `addr`/`addrlen` follow the raw `accept` contract (both may be null).
pub unsafe fn accept(
    fd: libc::c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::c_int {
    let client = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        libc::accept(fd, addr, addrlen) as libc::ssize_t
    }) as libc::c_int;
    if client >= 0 {
        FdRegistry::instance().get(client, true);
    }
    client
}

// ── Read family ──

/// # Safety
///
/// `buf` must be valid for `count` bytes of writes.
pub unsafe fn read(fd: libc::c_int, buf: *mut libc::c_void, count: libc::size_t) -> libc::ssize_t {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || {
        libc::read(fd, buf, count)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: libc::c_int, iov: *const libc::iovec, iovcnt: libc::c_int) -> libc::ssize_t {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || {
        libc::readv(fd, iov, iovcnt)
    })
}

/// # Safety
///
/// `buf` must be valid for `len` bytes of writes.
pub unsafe fn recv(
    fd: libc::c_int,
    buf: *mut libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
) -> libc::ssize_t {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || {
        libc::recv(fd, buf, len, flags)
    })
}

/// # Safety
///
/// Raw `recvfrom` contract.
pub unsafe fn recvfrom(
    fd: libc::c_int,
    buf: *mut libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::ssize_t {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
///
/// Raw `recvmsg` contract.
pub unsafe fn recvmsg(fd: libc::c_int, msg: *mut libc::msghdr, flags: libc::c_int) -> libc::ssize_t {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── Write family ──

/// # Safety
///
/// `buf` must be valid for `count` bytes of reads.
pub unsafe fn write(
    fd: libc::c_int,
    buf: *const libc::c_void,
    count: libc::size_t,
) -> libc::ssize_t {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || {
        libc::write(fd, buf, count)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(
    fd: libc::c_int,
    iov: *const libc::iovec,
    iovcnt: libc::c_int,
) -> libc::ssize_t {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || {
        libc::writev(fd, iov, iovcnt)
    })
}

/// # Safety
///
/// `buf` must be valid for `len` bytes of reads.
pub unsafe fn send(
    fd: libc::c_int,
    buf: *const libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
) -> libc::ssize_t {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || {
        libc::send(fd, buf, len, flags)
    })
}

/// # Safety
///
/// Raw `sendto` contract.
pub unsafe fn sendto(
    fd: libc::c_int,
    buf: *const libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
    to: *const libc::sockaddr,
    tolen: libc::socklen_t,
) -> libc::ssize_t {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        libc::sendto(fd, buf, len, flags, to, tolen)
    })
}

/// # Safety
///
/// Raw `sendmsg` contract.
pub unsafe fn sendmsg(
    fd: libc::c_int,
    msg: *const libc::msghdr,
    flags: libc::c_int,
) -> libc::ssize_t {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── fd teardown and option plumbing ──

pub fn close(fd: libc::c_int) -> libc::c_int {
    if !tls::hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if let Some(entry) = FdRegistry::instance().get(fd, false) {
        entry.set_closed();
        if let Some(iom) = IoManager::current() {
            // Wake every parked waiter; their retried syscall reports
            // EBADF against the closed fd.
            iom.cancel_all(fd);
        }
        FdRegistry::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// Hooked `fcntl` for the integer-argument commands.
///
/// Setting `O_NONBLOCK` only updates the user-visible flag; the kernel
/// side stays non-blocking because the hook depends on it. Querying
/// returns the user's view.
pub fn fcntl(fd: libc::c_int, cmd: libc::c_int, arg: libc::c_long) -> libc::c_int {
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg as libc::c_int;
            let entry = FdRegistry::instance().get(fd, false);
            match entry {
                Some(entry) if !entry.is_closed() && entry.is_socket() => {
                    entry.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    if entry.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, arg) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, arg) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            let entry = FdRegistry::instance().get(fd, false);
            match entry {
                Some(entry) if !entry.is_closed() && entry.is_socket() => {
                    if entry.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Hooked `ioctl`: `FIONBIO` is routed through the same user-visible
/// non-blocking emulation as `fcntl`.
///
/// # Safety
///
/// `arg` must match what `request` expects.
pub unsafe fn ioctl(fd: libc::c_int, request: libc::c_ulong, arg: *mut libc::c_void) -> libc::c_int {
    if request == libc::FIONBIO as libc::c_ulong {
        let user_nonblock = *(arg as *const libc::c_int) != 0;
        if let Some(entry) = FdRegistry::instance().get(fd, false) {
            if !entry.is_closed() && entry.is_socket() {
                entry.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
///
/// Raw `getsockopt` contract.
pub unsafe fn getsockopt(
    fd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> libc::c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// Hooked `setsockopt`: `SO_RCVTIMEO`/`SO_SNDTIMEO` are captured into
/// the fd entry so the I/O pattern can enforce them.
///
/// # Safety
///
/// Raw `setsockopt` contract.
pub unsafe fn setsockopt(
    fd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    if tls::hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(entry) = FdRegistry::instance().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1_000 + tv.tv_usec as u64 / 1_000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            entry.set_timeout_ms(kind, ms);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}
