//! N:M fiber scheduler
//!
//! A pool of worker threads drains a shared FIFO of tasks (fibers or
//! plain closures). Each worker owns an idle fiber it falls into when
//! the queue is empty; by default the idle fiber just yields until the
//! scheduler drains and stops, and a reactor (see `filament-io`) can
//! replace it with an epoll wait.
//!
//! With `use_caller` the constructing thread is counted as a worker: its
//! worker loop lives in a dedicated anchor fiber that is resumed when
//! the caller invokes `stop()`, so the caller drains the pool in-thread
//! instead of burning an extra OS thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use parking_lot::Mutex;

use filament_core::os;
use filament_core::state::FiberState;

use crate::fiber::Fiber;
use crate::tls;

/// Pin value meaning "any worker may take the task".
pub const ANY_WORKER: libc::pid_t = -1;

enum TaskKind {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

/// One unit of schedulable work, optionally pinned to a worker tid.
pub struct ScheduleTask {
    kind: TaskKind,
    thread: libc::pid_t,
}

impl ScheduleTask {
    pub fn fiber(fiber: Arc<Fiber>) -> Self {
        ScheduleTask {
            kind: TaskKind::Fiber(fiber),
            thread: ANY_WORKER,
        }
    }

    pub fn callback(f: impl FnOnce() + Send + 'static) -> Self {
        ScheduleTask {
            kind: TaskKind::Callback(Box::new(f)),
            thread: ANY_WORKER,
        }
    }

    /// Bind the task to the worker with the given kernel tid.
    pub fn pinned_to(mut self, tid: libc::pid_t) -> Self {
        self.thread = tid;
        self
    }
}

/// Extension points a reactor installs on a scheduler. The Rust shape of
/// the original's virtual methods: tickle, the idle body, an additional
/// stop predicate, and a per-worker init hook.
pub trait Reactor: Send + Sync {
    /// Wake one idle worker out of its wait.
    fn tickle(&self);

    /// Body of the idle fiber. Must yield regularly and return once
    /// `Scheduler::stopping` holds.
    fn run_idle(&self);

    /// Extra condition that must hold before the pool may stop
    /// (e.g. no pending timers, no armed fd events).
    fn extra_stopping(&self) -> bool {
        true
    }

    /// Runs at the top of every worker loop, on the worker thread.
    fn on_worker_start(&self) {}
}

/// Shared FIFO scheduler over a fixed set of worker threads.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Kernel tids of all workers, caller first when `use_caller`.
    thread_ids: Mutex<Vec<libc::pid_t>>,
    /// Spawned workers; excludes the caller.
    worker_count: usize,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
    use_caller: bool,
    /// Anchor fiber running the caller's worker loop; consumed by `stop`.
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: libc::pid_t,
    reactor: OnceLock<Weak<dyn Reactor>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers.
    ///
    /// When `use_caller` is set the constructing thread counts as worker
    /// #0 and must eventually call [`stop`](Self::stop) itself.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one worker");

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut worker_count = threads;
            let mut root_thread = ANY_WORKER;
            let mut caller_fiber = None;
            let mut thread_ids = Vec::new();

            if use_caller {
                worker_count -= 1;
                // Materialize this thread's root fiber; the caller anchor
                // below swaps against it.
                Fiber::current();
                assert!(
                    tls::current_scheduler().is_none(),
                    "thread already participates in a scheduler"
                );

                let weak = weak.clone();
                let anchor = Fiber::new(
                    move || {
                        if let Some(sched) = weak.upgrade() {
                            sched.worker_loop();
                        }
                    },
                    0,
                    false,
                )
                .expect("caller anchor fiber allocation failed");

                root_thread = os::thread_id();
                thread_ids.push(root_thread);
                caller_fiber = Some(anchor);
            }

            let sched = Scheduler {
                name: name.to_string(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(thread_ids),
                worker_count,
                active_workers: AtomicUsize::new(0),
                idle_workers: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                started: AtomicBool::new(false),
                use_caller,
                caller_fiber: Mutex::new(caller_fiber),
                root_thread,
                reactor: OnceLock::new(),
            };

            if use_caller {
                tls::set_current_scheduler(weak.clone());
                tls::set_scheduler_anchor(sched.caller_fiber.lock().as_ref().unwrap().clone());
            }
            sched
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler the calling thread participates in.
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler()
    }

    /// Install the reactor extension. May happen once, before `start`.
    pub fn install_reactor(&self, reactor: Weak<dyn Reactor>) {
        assert!(
            self.reactor.set(reactor).is_ok(),
            "reactor already installed"
        );
    }

    fn reactor(&self) -> Option<Arc<dyn Reactor>> {
        self.reactor.get().and_then(Weak::upgrade)
    }

    /// Spawn the worker threads. Idempotent; returns once every worker
    /// has reported its tid.
    pub fn start(self: &Arc<Self>) {
        if self.stopping.load(Ordering::Acquire) {
            log::error!("{}: start() on a stopping scheduler", self.name);
            return;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("{}: starting {} worker threads", self.name, self.worker_count);

        let (tid_tx, tid_rx) = mpsc::channel();
        {
            let mut threads = self.threads.lock();
            for i in 0..self.worker_count {
                let sched = self.clone();
                let tid_tx = tid_tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-{}", self.name, i))
                    .spawn(move || {
                        let _ = tid_tx.send(os::thread_id());
                        drop(tid_tx);
                        sched.worker_loop();
                    })
                    .expect("failed to spawn scheduler worker");
                threads.push(handle);
            }
        }
        drop(tid_tx);

        let mut ids = self.thread_ids.lock();
        for _ in 0..self.worker_count {
            if let Ok(tid) = tid_rx.recv() {
                ids.push(tid);
            }
        }
    }

    /// Submit a closure to run on any worker.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.submit(ScheduleTask::callback(f));
    }

    /// Submit a ready fiber to be resumed on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(ScheduleTask::fiber(fiber));
    }

    /// Submit one task; wakes an idle worker if the queue was empty.
    pub fn submit(&self, task: ScheduleTask) {
        let was_empty = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        // Tickle outside the lock.
        if was_empty {
            self.tickle();
        }
    }

    /// Submit a batch under one lock acquisition, tickling at most once.
    pub fn submit_all(&self, tasks: impl IntoIterator<Item = ScheduleTask>) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(tasks);
            was_empty && queue.len() > before
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn tickle(&self) {
        if let Some(reactor) = self.reactor() {
            reactor.tickle();
        } else {
            log::trace!("{}: tickle", self.name);
        }
    }

    /// Kernel tids of all workers (caller first when `use_caller`).
    pub fn worker_tids(&self) -> Vec<libc::pid_t> {
        self.thread_ids.lock().clone()
    }

    /// Whether any worker is currently parked in the idle fiber.
    pub fn has_idle_workers(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) > 0
    }

    pub fn idle_worker_count(&self) -> usize {
        self.idle_workers.load(Ordering::Acquire)
    }

    /// Full stop predicate: stop requested, queue drained, no task being
    /// dispatched, and the reactor (if any) has nothing pending.
    pub fn stopping(&self) -> bool {
        self.base_stopping() && self.reactor().is_none_or(|r| r.extra_stopping())
    }

    fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_workers.load(Ordering::Acquire) == 0
    }

    /// Whether `stop` has been requested (the queue may still hold work).
    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Drain every pending task, then shut the workers down and join
    /// them. With `use_caller`, must be invoked on the constructing
    /// thread — the caller's anchor fiber drains the queue here.
    pub fn stop(self: &Arc<Self>) {
        if self.stopping() {
            return;
        }
        log::debug!("{}: stop", self.name);
        self.stopping.store(true, Ordering::Release);

        if self.use_caller {
            assert!(
                Self::current().is_some_and(|s| Arc::ptr_eq(&s, self)),
                "{}: stop() must run on the caller thread",
                self.name
            );
        } else {
            assert!(
                !Self::current().is_some_and(|s| Arc::ptr_eq(&s, self)),
                "{}: stop() invoked from inside the pool",
                self.name
            );
        }

        for _ in 0..self.worker_count {
            self.tickle();
        }

        let caller = self.caller_fiber.lock().take();
        if caller.is_some() {
            self.tickle();
        }
        if let Some(anchor) = caller {
            anchor.resume();
            log::debug!("{}: caller worker drained", self.name);
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// The per-worker dispatch loop.
    fn worker_loop(self: &Arc<Self>) {
        let my_tid = os::thread_id();
        log::debug!("{}: worker {} running", self.name, my_tid);

        tls::set_hook_enabled(true);
        tls::set_current_scheduler(Arc::downgrade(self));
        if my_tid != self.root_thread {
            // Spawned worker: the thread's root fiber is the anchor.
            tls::set_scheduler_anchor(Fiber::current());
        }
        if let Some(reactor) = self.reactor() {
            reactor.on_worker_start();
        }

        let idle_fiber = {
            let sched = self.clone();
            Fiber::new(move || sched.idle_task(), 0, true).expect("idle fiber allocation failed")
        };
        // Reusable carrier for closure tasks.
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_others = false;
            let mut task = None;
            {
                let mut queue = self.queue.lock();
                let mut idx = 0;
                while idx < queue.len() {
                    let candidate = &queue[idx];
                    if candidate.thread != ANY_WORKER && candidate.thread != my_tid {
                        // Pinned elsewhere; make sure that worker looks.
                        tickle_others = true;
                        idx += 1;
                        continue;
                    }
                    if let TaskKind::Fiber(fiber) = &candidate.kind {
                        // An event firing can re-schedule a fiber before it
                        // finished yielding on another worker. Leave it in
                        // the queue until the yield completes.
                        let state = fiber.state();
                        if state == FiberState::Running || state == FiberState::Yielding {
                            idx += 1;
                            continue;
                        }
                    }
                    task = queue.remove(idx);
                    self.active_workers.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                if task.is_some() {
                    tickle_others |= idx < queue.len();
                }
            }
            if tickle_others {
                self.tickle();
            }

            match task.map(|t| t.kind) {
                Some(TaskKind::Fiber(fiber)) => {
                    fiber.resume();
                    self.active_workers.fetch_sub(1, Ordering::SeqCst);
                }
                Some(TaskKind::Callback(callback)) => {
                    let carrier = match cb_fiber.take() {
                        Some(f) if f.state() == FiberState::Term => {
                            f.reset(callback);
                            f
                        }
                        _ => Fiber::new(callback, 0, true)
                            .expect("callback carrier fiber allocation failed"),
                    };
                    carrier.resume();
                    self.active_workers.fetch_sub(1, Ordering::SeqCst);
                    // Keep the carrier only if the closure ran to
                    // completion; a suspended carrier now belongs to
                    // whoever re-schedules it.
                    if carrier.state() == FiberState::Term {
                        cb_fiber = Some(carrier);
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        log::debug!("{}: idle fiber finished, worker {} exiting", self.name, my_tid);
                        break;
                    }
                    self.idle_workers.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_workers.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        log::debug!("{}: worker {} exited", self.name, my_tid);
    }

    /// Idle fiber body: delegate to the reactor, or busy-yield until the
    /// pool may stop.
    fn idle_task(&self) {
        match self.reactor() {
            Some(reactor) => reactor.run_idle(),
            None => {
                log::trace!("{}: idle", self.name);
                while !self.stopping() {
                    Fiber::yield_now();
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Destroying a pool that was never stopped is a programming
        // fault; threads would be left running against freed state.
        assert!(
            self.stopping.load(Ordering::Acquire),
            "{}: dropped without stop()",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_spawned_workers_run_closures() {
        let sched = Scheduler::new(2, false, "t-basic");
        sched.start();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let hits = hits.clone();
            sched.schedule(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        std::thread::spawn(|| {
            let sched = Scheduler::new(1, true, "t-caller");
            sched.start();
            let hits = Arc::new(AtomicUsize::new(0));
            for _ in 0..8 {
                let hits = hits.clone();
                sched.schedule(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
            // No spawned workers: everything runs inside stop().
            assert_eq!(hits.load(Ordering::SeqCst), 0);
            sched.stop();
            assert_eq!(hits.load(Ordering::SeqCst), 8);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_fifo_order_on_single_worker() {
        let sched = Scheduler::new(1, false, "t-fifo");
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..16 {
            let order = order.clone();
            sched.schedule(move || order.lock().push(tag));
        }
        sched.start();
        sched.stop();
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_scheduled_fiber_is_resumed() {
        let sched = Scheduler::new(1, false, "t-fiber");
        sched.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let fiber = Fiber::new(
            move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        )
        .unwrap();
        sched.schedule_fiber(fiber.clone());
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_pinned_task_runs_on_its_worker() {
        let sched = Scheduler::new(3, false, "t-pin");
        sched.start();
        let tids = sched.worker_tids();
        assert_eq!(tids.len(), 3);
        let target = tids[1];

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..24 {
            let seen = seen.clone();
            sched.submit(
                ScheduleTask::callback(move || {
                    seen.lock().push(os::thread_id());
                })
                .pinned_to(target),
            );
        }
        // Give the pinned worker time to drain before stop.
        std::thread::sleep(Duration::from_millis(200));
        sched.stop();
        let seen = seen.lock();
        assert_eq!(seen.len(), 24);
        assert!(seen.iter().all(|&tid| tid == target));
    }

    #[test]
    fn test_yielding_closure_completes() {
        let sched = Scheduler::new(2, false, "t-yield");
        sched.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        sched.schedule(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
            // A bare yield does not re-enqueue; re-schedule ourselves first.
            let me = Fiber::current();
            Scheduler::current().unwrap().schedule_fiber(me);
            Fiber::yield_now();
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(200));
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
