//! Deadline-ordered timer wheel
//!
//! Timers are kept in an ordered map keyed by `(deadline_ms, timer id)`;
//! the id is a stable tiebreaker, so timers with equal deadlines fire in
//! insertion order. The wheel itself never runs callbacks — the reactor
//! drains the expired set and submits the callbacks to the scheduler.
//!
//! Inserting a new earliest timer invokes the wheel's wake hook so the
//! reactor can shorten its `epoll_wait` timeout.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use filament_core::time::monotonic_ms;

/// Clock regressions larger than this drain the whole wheel, on the
/// theory that the timestamps it was built from are garbage.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Deadline with no timeout.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Callback carried by a timer. Cloned out of the wheel at fire time and
/// run by a scheduler worker.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerEntry {
    id: u64,
    recurring: bool,
    /// Mutated only under the wheel's write lock; atomics purely for
    /// interior mutability.
    period_ms: AtomicU64,
    deadline_ms: AtomicU64,
    callback: Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    #[inline]
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::Relaxed), self.id)
    }
}

/// Handle to a timer in a wheel. Cloneable; cheap.
#[derive(Clone)]
pub struct Timer {
    entry: Arc<TimerEntry>,
    wheel: Weak<TimerWheel>,
}

impl Timer {
    /// Remove the timer and drop its callback without firing it.
    /// Returns false if it already fired, was cancelled, or the wheel is
    /// gone.
    pub fn cancel(&self) -> bool {
        let Some(wheel) = self.wheel.upgrade() else {
            return false;
        };
        let mut timers = wheel.timers.write();
        let mut callback = self.entry.callback.lock();
        if callback.is_none() {
            return false;
        }
        *callback = None;
        timers.remove(&self.entry.key());
        true
    }

    /// Push the deadline out to now + period.
    pub fn refresh(&self) -> bool {
        let Some(wheel) = self.wheel.upgrade() else {
            return false;
        };
        let mut timers = wheel.timers.write();
        if self.entry.callback.lock().is_none() {
            return false;
        }
        if timers.remove(&self.entry.key()).is_none() {
            return false;
        }
        let deadline = monotonic_ms() + self.entry.period_ms.load(Ordering::Relaxed);
        self.entry.deadline_ms.store(deadline, Ordering::Relaxed);
        timers.insert(self.entry.key(), self.entry.clone());
        true
    }

    /// Change the period. With `from_now` the new deadline counts from
    /// the current time, otherwise from the original arming instant.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        let Some(wheel) = self.wheel.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut timers = wheel.timers.write();
            if self.entry.callback.lock().is_none() {
                return false;
            }
            if period_ms == self.entry.period_ms.load(Ordering::Relaxed) && !from_now {
                return true;
            }
            if timers.remove(&self.entry.key()).is_none() {
                return false;
            }
            let start = if from_now {
                monotonic_ms()
            } else {
                self.entry.deadline_ms.load(Ordering::Relaxed)
                    - self.entry.period_ms.load(Ordering::Relaxed)
            };
            self.entry.period_ms.store(period_ms, Ordering::Relaxed);
            self.entry
                .deadline_ms
                .store(start + period_ms, Ordering::Relaxed);
            at_front = wheel.insert_locked(&mut timers, self.entry.clone());
        }
        if at_front {
            (wheel.wake)();
        }
        true
    }
}

/// Ordered collection of pending timers.
pub struct TimerWheel {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerEntry>>>,
    /// Set when the wake hook fired for the current front; cleared when
    /// the reactor reads the next delay. Avoids a wake storm while the
    /// reactor is already on its way.
    tickled: AtomicBool,
    prev_now_ms: AtomicU64,
    next_id: AtomicU64,
    wake: Box<dyn Fn() + Send + Sync>,
}

impl TimerWheel {
    /// Create a wheel whose `wake` hook interrupts the reactor's wait
    /// when a new earliest deadline appears.
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Arc<TimerWheel> {
        Arc::new(TimerWheel {
            timers: RwLock::new(BTreeMap::new()),
            tickled: AtomicBool::new(false),
            prev_now_ms: AtomicU64::new(monotonic_ms()),
            next_id: AtomicU64::new(0),
            wake: Box::new(wake),
        })
    }

    /// Arm a timer `delay_ms` from now.
    pub fn add_timer(
        self: &Arc<Self>,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let entry = Arc::new(TimerEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(delay_ms),
            deadline_ms: AtomicU64::new(monotonic_ms() + delay_ms),
            callback: Mutex::new(Some(Arc::new(callback))),
        });
        let at_front = {
            let mut timers = self.timers.write();
            self.insert_locked(&mut timers, entry.clone())
        };
        if at_front {
            (self.wake)();
        }
        Timer {
            entry,
            wheel: Arc::downgrade(self),
        }
    }

    /// Arm a timer whose callback only runs if `witness` is still alive
    /// at fire time.
    pub fn add_conditional_timer<W: Send + Sync + 'static>(
        self: &Arc<Self>,
        delay_ms: u64,
        callback: impl Fn() + Send + Sync + 'static,
        witness: Weak<W>,
        recurring: bool,
    ) -> Timer {
        let guarded = move || {
            if witness.upgrade().is_some() {
                callback();
            }
        };
        self.add_timer(delay_ms, guarded, recurring)
    }

    /// Milliseconds until the earliest deadline: 0 if already expired,
    /// [`NO_TIMEOUT`] if the wheel is empty.
    pub fn next_delay_ms(&self) -> u64 {
        self.tickled.store(false, Ordering::Release);
        let timers = self.timers.read();
        match timers.keys().next() {
            None => NO_TIMEOUT,
            Some(&(deadline, _)) => deadline.saturating_sub(monotonic_ms()),
        }
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.timers.read().is_empty()
    }

    /// Pop every expired timer and return the callbacks to run, in
    /// deadline order. Recurring timers are re-armed at now + period
    /// (drift-absorbing, no catch-up).
    pub fn drain_expired(&self) -> Vec<TimerCallback> {
        self.drain_expired_at(monotonic_ms())
    }

    fn drain_expired_at(&self, now_ms: u64) -> Vec<TimerCallback> {
        let mut timers = self.timers.write();
        let rollover = self.detect_rollover(now_ms);
        if timers.is_empty() {
            return Vec::new();
        }
        if !rollover {
            match timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now_ms => {}
                _ => return Vec::new(),
            }
        }

        let expired: Vec<Arc<TimerEntry>> = if rollover {
            log::warn!("monotonic clock rolled over, expiring all timers");
            std::mem::take(&mut *timers).into_values().collect()
        } else {
            let rest = timers.split_off(&(now_ms + 1, 0));
            std::mem::replace(&mut *timers, rest).into_values().collect()
        };

        let mut callbacks = Vec::with_capacity(expired.len());
        for entry in expired {
            let mut slot = entry.callback.lock();
            let Some(callback) = slot.clone() else {
                continue;
            };
            if entry.recurring {
                entry
                    .deadline_ms
                    .store(now_ms + entry.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
                drop(slot);
                timers.insert(entry.key(), entry.clone());
            } else {
                *slot = None;
            }
            callbacks.push(callback);
        }
        callbacks
    }

    /// Insert under an already-held write lock; returns whether the wake
    /// hook should fire (new front, not yet signalled).
    fn insert_locked(
        &self,
        timers: &mut BTreeMap<(u64, u64), Arc<TimerEntry>>,
        entry: Arc<TimerEntry>,
    ) -> bool {
        let key = entry.key();
        timers.insert(key, entry);
        let at_front = timers.keys().next() == Some(&key);
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn detect_rollover(&self, now_ms: u64) -> bool {
        let prev = self.prev_now_ms.swap(now_ms, Ordering::AcqRel);
        now_ms < prev && now_ms < prev.wrapping_sub(ROLLOVER_WINDOW_MS)
    }
}
