//! Shared plumbing for the end-to-end tests.
#![allow(dead_code)]

use std::time::{Duration, Instant};

pub fn sockaddr_in(addr: [u8; 4], port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_be_bytes(addr).to_be(),
        },
        sin_zero: [0; 8],
    }
}

/// Bind a listening TCP socket on 127.0.0.1 with an ephemeral port.
pub fn loopback_listener() -> (libc::c_int, u16) {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket() failed");

        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let addr = sockaddr_in([127, 0, 0, 1], 0);
        let rc = libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rc, 0, "bind() failed");
        assert_eq!(libc::listen(fd, 16), 0, "listen() failed");

        let mut bound: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        libc::getsockname(
            fd,
            &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        );
        (fd, u16::from_be(bound.sin_port))
    }
}

/// Connected AF_UNIX stream pair, both ends registered with the fd
/// registry (and therefore kernel-nonblocking) so hooked I/O applies.
pub fn registered_socketpair() -> (libc::c_int, libc::c_int) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair() failed");
    filament::FdRegistry::instance().get(fds[0], true).unwrap();
    filament::FdRegistry::instance().get(fds[1], true).unwrap();
    (fds[0], fds[1])
}

/// Poll `pred` every 10ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

pub fn last_errno() -> libc::c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
