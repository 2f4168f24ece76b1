//! epoll reactor
//!
//! `IoManager` extends the scheduler with an epoll loop as its idle task
//! and owns the timer wheel. Fibers (or plain callbacks) register
//! interest in (fd, direction); when `epoll_wait` reports readiness the
//! waiter is pushed back onto the ready queue of its scheduler.
//!
//! One waiter per (fd, direction): arming an already-armed direction is
//! a programming fault.

use std::cell::RefCell;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use filament_core::error::{Result, RuntimeError};
use filament_core::state::FiberState;
use filament_runtime::scheduler::{Reactor, ScheduleTask, Scheduler, ANY_WORKER};
use filament_runtime::timer::{Timer, TimerWheel};
use filament_runtime::Fiber;

use crate::hook;
use crate::notifier::EventFdNotifier;

/// I/O readiness directions, bit-compatible with `EPOLLIN`/`EPOLLOUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(libc::EPOLLIN as u32);
    pub const WRITE: Event = Event(libc::EPOLLOUT as u32);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keep only the READ/WRITE bits of a raw epoll mask.
    #[inline]
    pub const fn from_epoll(raw: u32) -> Event {
        Event(raw & (Event::READ.0 | Event::WRITE.0))
    }

    #[inline]
    pub const fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn without(self, other: Event) -> Event {
        Event(self.0 & !other.0)
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

enum WaitTask {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

/// A parked waiter for one direction of one fd.
struct Waiter {
    scheduler: Weak<Scheduler>,
    task: WaitTask,
    pin: libc::pid_t,
}

#[derive(Default)]
struct SlotState {
    armed: u32,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

/// Per-fd event slot. The slot vector only needs the outer lock for
/// growth; event mutation takes this fine-grained lock.
struct FdSlot {
    fd: RawFd,
    state: Mutex<SlotState>,
}

thread_local! {
    static CURRENT_IO: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

const MAX_EVENTS: usize = 256;
/// Upper bound on one epoll wait, so the wake pipe is drained and the
/// stop predicate re-checked even on a quiet reactor.
const MAX_WAIT_MS: u64 = 3000;

/// Scheduler + epoll reactor + timer wheel.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerWheel>,
    epoll_fd: RawFd,
    notifier: EventFdNotifier,
    slots: RwLock<Vec<Option<Arc<FdSlot>>>>,
    /// Number of currently armed (fd, direction) registrations.
    pending_events: AtomicUsize,
    weak_self: Weak<IoManager>,
}

impl IoManager {
    /// Create the reactor and start its worker pool.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(RuntimeError::Io(io::Error::last_os_error()));
        }
        let notifier = EventFdNotifier::create()?;

        // Edge-triggered registration of the wake eventfd; the counter
        // is drained in full on every wakeup.
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: notifier.fd() as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, notifier.fd(), &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(RuntimeError::Io(err));
        }

        hook::init_hook_config();

        let scheduler = Scheduler::new(threads, use_caller, name);
        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let wake = {
                let weak = weak.clone();
                move || {
                    if let Some(iom) = weak.upgrade() {
                        iom.tickle();
                    }
                }
            };
            IoManager {
                scheduler,
                timers: TimerWheel::new(wake),
                epoll_fd,
                notifier,
                slots: RwLock::new(Vec::new()),
                pending_events: AtomicUsize::new(0),
                weak_self: weak.clone(),
            }
        });

        let reactor: Weak<dyn Reactor> = iom.weak_self.clone();
        iom.scheduler.install_reactor(reactor);
        CURRENT_IO.with(|cell| *cell.borrow_mut() = Some(iom.weak_self.clone()));

        iom.scheduler.start();
        Ok(iom)
    }

    /// The IoManager whose pool the calling thread belongs to.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Submit a closure to the pool.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule(f);
    }

    /// Submit a ready fiber to the pool.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    /// Drain and shut down the pool. See [`Scheduler::stop`].
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Arm a one-shot timer. Callbacks run on pool workers.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.timers.add_timer(delay_ms, callback, recurring)
    }

    /// Arm a timer suppressed if `witness` died before it fires.
    pub fn add_conditional_timer<W: Send + Sync + 'static>(
        &self,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        witness: Weak<W>,
        recurring: bool,
    ) -> Timer {
        self.timers
            .add_conditional_timer(delay_ms, callback, witness, recurring)
    }

    /// Register interest in `event` on `fd`, waking the calling fiber
    /// when it fires. The caller must yield right after.
    pub fn add_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let fiber = Fiber::current();
        assert_eq!(
            fiber.state(),
            FiberState::Running,
            "add_event caller must be a running fiber"
        );
        self.add_waiter(fd, event, WaitTask::Fiber(fiber))
    }

    /// Register interest in `event` on `fd`, scheduling `callback` when
    /// it fires.
    pub fn add_event_callback(
        &self,
        fd: RawFd,
        event: Event,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.add_waiter(fd, event, WaitTask::Callback(Box::new(callback)))
    }

    fn add_waiter(&self, fd: RawFd, event: Event, task: WaitTask) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "exactly one direction per registration"
        );
        let slot = self.slot_for(fd);
        let mut state = slot.state.lock();
        assert!(
            state.armed & event.bits() == 0,
            "fd {} direction {:?} armed twice",
            fd,
            event
        );

        let op = if state.armed == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_update(fd, op, state.armed | event.bits())?;

        state.armed |= event.bits();
        self.pending_events.fetch_add(1, Ordering::SeqCst);

        let scheduler = Scheduler::current().unwrap_or_else(|| self.scheduler.clone());
        let waiter = Waiter {
            scheduler: Arc::downgrade(&scheduler),
            task,
            pin: ANY_WORKER,
        };
        match event {
            Event::READ => state.read = Some(waiter),
            _ => state.write = Some(waiter),
        }
        Ok(())
    }

    /// Disarm without firing. Returns false if the direction was not
    /// armed.
    pub fn remove_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(slot) = self.lookup_slot(fd) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.armed & event.bits() == 0 {
            return false;
        }

        let remaining = state.armed & !event.bits();
        let op = if remaining == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(fd, op, remaining).is_err() {
            return false;
        }

        state.armed = remaining;
        match event {
            Event::READ => state.read = None,
            _ => state.write = None,
        }
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm and fire the waiter once, as if the event had occurred.
    /// Used by timeouts and `close` to shake loose parked fibers.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(slot) = self.lookup_slot(fd) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.armed & event.bits() == 0 {
            return false;
        }

        let remaining = state.armed & !event.bits();
        let op = if remaining == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let _ = self.epoll_update(fd, op, remaining);

        self.fire_locked(&mut state, event);
        true
    }

    /// Fire every armed waiter on `fd` and drop the registration.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(slot) = self.lookup_slot(fd) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.armed == 0 {
            return false;
        }

        let _ = self.epoll_update(fd, libc::EPOLL_CTL_DEL, 0);
        if state.armed & Event::READ.bits() != 0 {
            self.fire_locked(&mut state, Event::READ);
        }
        if state.armed & Event::WRITE.bits() != 0 {
            self.fire_locked(&mut state, Event::WRITE);
        }
        debug_assert_eq!(state.armed, 0);
        true
    }

    /// Number of armed (fd, direction) registrations.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Clear the direction bit and push its waiter onto the owning
    /// scheduler.
    fn fire_locked(&self, state: &mut SlotState, event: Event) {
        debug_assert!(state.armed & event.bits() != 0);
        state.armed &= !event.bits();
        let waiter = match event {
            Event::READ => state.read.take(),
            _ => state.write.take(),
        };
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        let Some(waiter) = waiter else { return };
        let Some(scheduler) = waiter.scheduler.upgrade() else {
            log::warn!("waiter scheduler is gone, dropping wakeup");
            return;
        };
        let task = match waiter.task {
            WaitTask::Fiber(fiber) => ScheduleTask::fiber(fiber),
            WaitTask::Callback(cb) => ScheduleTask::callback(cb),
        };
        scheduler.submit(task.pinned_to(waiter.pin));
    }

    fn epoll_update(&self, fd: RawFd, op: libc::c_int, armed_bits: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | armed_bits,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            let events = ev.events;
            log::error!(
                "epoll_ctl(op={}, fd={}, events={:#x}) failed: {}",
                op,
                fd,
                events,
                err
            );
            return Err(RuntimeError::Io(err));
        }
        Ok(())
    }

    fn lookup_slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        if fd < 0 {
            return None;
        }
        self.slots.read().get(fd as usize).and_then(Clone::clone)
    }

    fn slot_for(&self, fd: RawFd) -> Arc<FdSlot> {
        assert!(fd >= 0, "invalid fd {}", fd);
        if let Some(slot) = self.lookup_slot(fd) {
            return slot;
        }

        let mut slots = self.slots.write();
        if fd as usize >= slots.len() {
            // Grown by half, never shrunk.
            let new_len = (fd as usize * 3 / 2 + 1).max(64);
            slots.resize(new_len, None);
        }
        slots[fd as usize]
            .get_or_insert_with(|| {
                Arc::new(FdSlot {
                    fd,
                    state: Mutex::new(SlotState::default()),
                })
            })
            .clone()
    }

    /// The reactor loop, run as the idle fiber of every worker.
    fn idle_loop(&self) {
        log::debug!("{}: reactor idle loop entered", self.scheduler.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.scheduler.stopping() {
                log::debug!("{}: reactor idle loop exiting", self.scheduler.name());
                break;
            }

            let timeout = self.timers.next_delay_ms().min(MAX_WAIT_MS) as libc::c_int;
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("epoll_wait failed: {}", err);
                continue;
            }

            // Expired timers go to the ready queue before fd dispatch.
            let callbacks = self.timers.drain_expired();
            if !callbacks.is_empty() {
                self.scheduler.submit_all(
                    callbacks
                        .into_iter()
                        .map(|cb| ScheduleTask::callback(move || cb())),
                );
            }

            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                if fd == self.notifier.fd() {
                    self.notifier.drain();
                    continue;
                }
                let Some(slot) = self.lookup_slot(fd) else {
                    continue;
                };
                let mut state = slot.state.lock();

                let mut raw = ev.events;
                // Errors and hangups wake every armed direction so the
                // waiter re-runs its syscall and observes the error.
                if raw & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    raw |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.armed;
                }
                let ready = Event::from_epoll(raw).bits() & state.armed;
                if ready == 0 {
                    continue;
                }

                // Re-arm what is left before firing.
                let remaining = state.armed & !ready;
                let op = if remaining == 0 {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if self.epoll_update(slot.fd, op, remaining).is_err() {
                    continue;
                }

                if ready & Event::READ.bits() != 0 {
                    self.fire_locked(&mut state, Event::READ);
                }
                if ready & Event::WRITE.bits() != 0 {
                    self.fire_locked(&mut state, Event::WRITE);
                }
            }

            // Hand control back to the worker loop so it can drain the
            // tasks this pass produced.
            Fiber::yield_now();
        }
    }
}

impl Reactor for IoManager {
    fn tickle(&self) {
        // Nobody is parked in epoll_wait; the queue check in the worker
        // loop will pick the task up anyway.
        if !self.scheduler.has_idle_workers() {
            return;
        }
        self.notifier.notify();
    }

    fn run_idle(&self) {
        self.idle_loop();
    }

    fn extra_stopping(&self) -> bool {
        !self.timers.has_timer() && self.pending_events.load(Ordering::SeqCst) == 0
    }

    fn on_worker_start(&self) {
        CURRENT_IO.with(|cell| *cell.borrow_mut() = Some(self.weak_self.clone()));
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        assert!(
            self.scheduler.stop_requested(),
            "{}: IoManager dropped without stop()",
            self.scheduler.name()
        );
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bit_algebra() {
        let both = Event::READ | Event::WRITE;
        assert!(both.contains(Event::READ));
        assert!(both.contains(Event::WRITE));
        assert_eq!(both.without(Event::READ), Event::WRITE);
        assert_eq!(both & Event::READ, Event::READ);
        assert!(Event::NONE.is_empty());
        assert!(!both.is_empty());
    }

    #[test]
    fn test_event_tracks_epoll_bits() {
        assert_eq!(Event::READ.bits(), libc::EPOLLIN as u32);
        assert_eq!(Event::WRITE.bits(), libc::EPOLLOUT as u32);
        // Error bits are stripped; only directions survive.
        let raw = (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32;
        assert_eq!(Event::from_epoll(raw), Event::READ);
    }
}
