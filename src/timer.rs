// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Monotonic one-shot and recurring timers.
//!
//! Pending timers are ordered by deadline, ties broken by registration
//! order. The I/O manager bounds its readiness wait with
//! [`TimerManager::next_timeout`] and drains due callbacks with
//! [`TimerManager::fire_expired`] from its idle loop.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::error;

use crate::fiber::{Parker, Wakeup};

/// Shared, re-invocable timer callback.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Witness for conditional timers; the callback only fires while the
/// witness is still alive.
pub type TimerWitness = Weak<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerStatus {
    Pending,
    Fired,
    Canceled,
}

type TimerKey = (Instant, u64);

struct TimerEntry {
    seq: u64,
    delay: Duration,
    recurring: bool,
    callback: TimerCallback,
    witness: Option<TimerWitness>,
    state: Mutex<EntryState>,
}

struct EntryState {
    key: Option<TimerKey>,
    status: TimerStatus,
}

struct TimerState {
    entries: BTreeMap<TimerKey, Arc<TimerEntry>>,
    next_seq: u64,
}

struct TimerShared {
    state: Mutex<TimerState>,
    // Invoked whenever the earliest deadline may have changed, so a
    // blocked poller can recompute its wait.
    wake_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Handle to a registered timer.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
    shared: Weak<TimerShared>,
}

impl TimerHandle {
    /// Cancels the timer. Idempotent; a timer that already fired stays
    /// fired.
    pub fn cancel(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock().unwrap();
        let mut entry_state = self.entry.state.lock().unwrap();
        if entry_state.status == TimerStatus::Pending {
            entry_state.status = TimerStatus::Canceled;
        }
        if let Some(key) = entry_state.key.take() {
            state.entries.remove(&key);
        }
    }

    /// Re-arms the timer to fire `new_delay` from now. With
    /// `only_if_sooner`, deadlines already nearer than that are kept.
    pub fn reset(&self, new_delay: Duration, only_if_sooner: bool) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let new_deadline = Instant::now() + new_delay;
        {
            let mut state = shared.state.lock().unwrap();
            let mut entry_state = self.entry.state.lock().unwrap();
            if entry_state.status == TimerStatus::Canceled {
                return;
            }
            if let Some(key) = entry_state.key {
                if only_if_sooner && key.0 <= new_deadline {
                    return;
                }
                state.entries.remove(&key);
            }
            let key = (new_deadline, self.entry.seq);
            entry_state.key = Some(key);
            entry_state.status = TimerStatus::Pending;
            state.entries.insert(key, self.entry.clone());
        }
        shared_wake(&shared);
    }

    /// Re-arms the timer to its original delay from now.
    pub fn refresh(&self) {
        self.reset(self.entry.delay, false);
    }
}

fn shared_wake(shared: &TimerShared) {
    if let Some(hook) = shared.wake_hook.lock().unwrap().as_ref() {
        hook();
    }
}

/// Orders and dispatches timers. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            shared: Arc::new(TimerShared {
                state: Mutex::new(TimerState {
                    entries: BTreeMap::new(),
                    next_seq: 0,
                }),
                wake_hook: Mutex::new(None),
            }),
        }
    }

    /// Installs the hook invoked whenever the earliest deadline may have
    /// moved. The I/O manager points this at its waker.
    pub fn set_wake_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.wake_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Registers a one-shot timer.
    pub fn register_timer<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(delay, Arc::new(callback), false, None)
    }

    /// Registers a timer that re-arms itself each time it fires.
    pub fn register_recurring<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(delay, Arc::new(callback), true, None)
    }

    /// Registers a one-shot timer that only fires while `witness` is still
    /// alive at firing time.
    pub fn register_conditional_timer<F>(
        &self,
        delay: Duration,
        callback: F,
        witness: TimerWitness,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(delay, Arc::new(callback), false, Some(witness))
    }

    fn register(
        &self,
        delay: Duration,
        callback: TimerCallback,
        recurring: bool,
        witness: Option<TimerWitness>,
    ) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let entry = {
            let mut state = self.shared.state.lock().unwrap();
            let seq = state.next_seq;
            state.next_seq += 1;
            let key = (deadline, seq);
            let entry = Arc::new(TimerEntry {
                seq,
                delay,
                recurring,
                callback,
                witness,
                state: Mutex::new(EntryState {
                    key: Some(key),
                    status: TimerStatus::Pending,
                }),
            });
            state.entries.insert(key, entry.clone());
            entry
        };
        shared_wake(&self.shared);
        TimerHandle {
            entry,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Time until the earliest pending deadline, zero if already due, or
    /// `None` when no timer is pending.
    pub fn next_timeout(&self) -> Option<Duration> {
        let state = self.shared.state.lock().unwrap();
        let (deadline, _) = state.entries.keys().next()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Removes every timer whose deadline has passed and returns their
    /// callbacks in deadline order. Recurring timers are re-armed.
    pub fn process_expired(&self) -> Vec<TimerCallback> {
        let now = Instant::now();
        let mut fired = Vec::new();
        let mut state = self.shared.state.lock().unwrap();
        loop {
            let Some((&key, _)) = state.entries.iter().next() else {
                break;
            };
            if key.0 > now {
                break;
            }
            let entry = state.entries.remove(&key).expect("key just observed");
            let mut entry_state = entry.state.lock().unwrap();
            entry_state.key = None;
            if entry_state.status != TimerStatus::Pending {
                continue;
            }
            if let Some(witness) = &entry.witness {
                if witness.strong_count() == 0 {
                    entry_state.status = TimerStatus::Canceled;
                    continue;
                }
            }
            entry_state.status = TimerStatus::Fired;
            if entry.recurring {
                let key = (now + entry.delay, entry.seq);
                entry_state.key = Some(key);
                entry_state.status = TimerStatus::Pending;
                drop(entry_state);
                fired.push(entry.callback.clone());
                state.entries.insert(key, entry);
            } else {
                drop(entry_state);
                fired.push(entry.callback.clone());
            }
        }
        fired
    }

    /// Runs every due callback, suppressing (and logging) panics so the
    /// caller's idle loop stays live.
    pub fn fire_expired(&self) {
        for callback in self.process_expired() {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!("timer callback panicked; suppressed");
            }
        }
    }
}

/// Suspends the current fiber (or blocks the current thread) for `delay`.
pub fn sleep(timers: &TimerManager, delay: Duration) {
    let parker = Parker::new();
    let resumer = Mutex::new(Some(parker.resumer()));
    let _handle = timers.register_timer(delay, move || {
        if let Some(resumer) = resumer.lock().unwrap().take() {
            resumer.resume(Wakeup::Resume);
        }
    });
    let _ = parker.park();
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn timers_fire_in_deadline_order_with_insertion_ties() {
        let timers = TimerManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3 {
            let log = log.clone();
            timers.register_timer(Duration::ZERO, move || log.lock().unwrap().push(index));
        }
        std::thread::sleep(Duration::from_millis(1));
        for callback in timers.process_expired() {
            callback();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cancel_is_idempotent_and_suppresses_firing() {
        let timers = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handle = timers.register_timer(Duration::ZERO, move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        handle.cancel();
        std::thread::sleep(Duration::from_millis(1));
        timers.fire_expired();
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[test]
    fn conditional_timer_skips_dead_witness() {
        let timers = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let witness: Arc<dyn std::any::Any + Send + Sync> = Arc::new(());
        timers.register_conditional_timer(
            Duration::ZERO,
            move || {
                count2.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&witness),
        );
        drop(witness);
        std::thread::sleep(Duration::from_millis(1));
        timers.fire_expired();
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[test]
    fn reset_only_if_sooner_keeps_nearer_deadline() {
        let timers = TimerManager::new();
        let handle = timers.register_timer(Duration::from_millis(5), || {});
        handle.reset(Duration::from_secs(60), true);
        let next = timers.next_timeout().unwrap();
        assert!(next <= Duration::from_millis(5));
    }

    #[test]
    fn recurring_timer_rearms() {
        let timers = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        timers.register_recurring(Duration::ZERO, move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(1));
            timers.fire_expired();
        }
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn panicking_callback_is_suppressed() {
        let timers = TimerManager::new();
        timers.register_timer(Duration::ZERO, || panic!("boom"));
        std::thread::sleep(Duration::from_millis(1));
        timers.fire_expired();
    }

    #[test]
    fn sleep_blocks_for_at_least_the_delay() {
        let timers = TimerManager::new();
        let timers2 = timers.clone();
        let poller = std::thread::spawn(move || {
            for _ in 0..100 {
                std::thread::sleep(Duration::from_millis(1));
                timers2.fire_expired();
            }
        });
        let start = Instant::now();
        sleep(&timers, Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
        poller.join().unwrap();
    }
}
