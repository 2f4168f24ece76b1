//! One accept/send on a server fiber, one connect/recv on a client
//! fiber, both through the hooked syscalls.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filament::{hook, FdRegistry, IoManager};

#[test]
fn accept_send_recv_round_trip() {
    let iom = IoManager::new(2, false, "echo").unwrap();

    let (listen_fd, port) = common::loopback_listener();
    // Register the listener so hooked accept parks instead of blocking.
    FdRegistry::instance().get(listen_fd, true).unwrap();

    let served = Arc::new(AtomicBool::new(false));
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let served = served.clone();
        iom.schedule(move || {
            let client =
                unsafe { hook::accept(listen_fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            assert!(client >= 0, "accept failed: errno {}", common::last_errno());

            let msg = b"hello world";
            let n = unsafe {
                hook::send(client, msg.as_ptr() as *const libc::c_void, msg.len(), 0)
            };
            assert_eq!(n, msg.len() as libc::ssize_t);

            hook::close(client);
            served.store(true, Ordering::SeqCst);
        });
    }

    {
        let received = received.clone();
        iom.schedule(move || {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);

            let addr = common::sockaddr_in([127, 0, 0, 1], port);
            let rc = unsafe {
                hook::connect(
                    fd,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            assert_eq!(rc, 0, "connect failed: errno {}", common::last_errno());

            let mut buf = [0u8; 1024];
            let mut got = 0usize;
            while got < 11 {
                let n = unsafe {
                    hook::recv(
                        fd,
                        buf[got..].as_mut_ptr() as *mut libc::c_void,
                        buf.len() - got,
                        0,
                    )
                };
                assert!(n > 0, "recv failed: errno {}", common::last_errno());
                got += n as usize;
            }
            received.lock().unwrap().extend_from_slice(&buf[..got]);
            hook::close(fd);
        });
    }

    assert!(
        common::wait_until(Duration::from_secs(5), || {
            served.load(Ordering::SeqCst) && received.lock().unwrap().len() >= 11
        }),
        "echo did not complete"
    );
    iom.stop();

    assert_eq!(&received.lock().unwrap()[..11], b"hello world");
    unsafe { libc::close(listen_fd) };
}
