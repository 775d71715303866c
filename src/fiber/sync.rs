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

//! Mutual exclusion that parks fibers instead of blocking worker threads.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use super::{Parker, Resumer, Wakeup};

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<Resumer>,
}

/// A mutex whose contended `lock` suspends the calling fiber, freeing the
/// worker thread to run other fibers. On a non-fiber thread it degrades to
/// ordinary thread blocking. The guard releases on drop, so the lock is
/// always released on unwind.
#[derive(Debug, Default)]
pub struct FiberMutex<T> {
    lock: Mutex<LockState>,
    data: Mutex<T>,
}

impl<T> FiberMutex<T> {
    pub fn new(value: T) -> Self {
        FiberMutex {
            lock: Mutex::new(LockState::default()),
            data: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        loop {
            let mut state = self.lock.lock().unwrap();
            if !state.locked {
                state.locked = true;
                drop(state);
                // Uncontended by construction; only the logical lock holder
                // touches the data mutex.
                let data = self.data.lock().unwrap();
                return FiberMutexGuard {
                    mutex: self,
                    data: Some(data),
                };
            }
            let parker = Parker::new();
            state.waiters.push_back(parker.resumer());
            drop(state);
            let _ = parker.park();
        }
    }

    fn unlock(&self) {
        let next = {
            let mut state = self.lock.lock().unwrap();
            state.locked = false;
            state.waiters.pop_front()
        };
        if let Some(resumer) = next {
            resumer.resume(Wakeup::Resume);
        }
    }
}

#[derive(Debug)]
pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
    data: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for FiberMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.data.as_ref().expect("guard accessed after release")
    }
}

impl<T> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data.as_mut().expect("guard accessed after release")
    }
}

impl<T> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.data.take();
        self.mutex.unlock();
    }
}

/// Condition variable companion to [`FiberMutex`].
#[derive(Debug, Default)]
pub struct FiberCondition {
    waiters: Mutex<VecDeque<Resumer>>,
}

impl FiberCondition {
    pub fn new() -> Self {
        FiberCondition::default()
    }

    /// Atomically releases `guard` and suspends until notified, then
    /// reacquires the mutex. Spurious wakeups are possible; callers loop on
    /// their predicate.
    pub fn wait<'a, T>(&self, guard: FiberMutexGuard<'a, T>) -> FiberMutexGuard<'a, T> {
        let mutex = guard.mutex;
        let parker = Parker::new();
        self.waiters.lock().unwrap().push_back(parker.resumer());
        drop(guard);
        let _ = parker.park();
        mutex.lock()
    }

    pub fn notify_one(&self) {
        let next = self.waiters.lock().unwrap().pop_front();
        if let Some(resumer) = next {
            resumer.resume(Wakeup::Resume);
        }
    }

    pub fn notify_all(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
        for resumer in waiters {
            resumer.resume(Wakeup::Resume);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fiber::Scheduler;
    use std::sync::Arc;

    #[test]
    fn uncontended_lock_round_trips() {
        let mutex = FiberMutex::new(1);
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(2, *mutex.lock());
    }

    #[test]
    fn contended_fibers_serialize() {
        let scheduler = Scheduler::new(2);
        let mutex = Arc::new(FiberMutex::new(Vec::new()));
        for index in 0..4 {
            let mutex = mutex.clone();
            scheduler
                .spawn(move || {
                    let mut guard = mutex.lock();
                    guard.push(index);
                    guard.push(index);
                })
                .unwrap();
        }
        scheduler.wait_idle();
        let log = mutex.lock();
        // Entries from the same fiber are adjacent; no interleaving inside
        // a critical section.
        for pair in log.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
        assert_eq!(8, log.len());
        scheduler.stop();
    }

    #[test]
    fn condition_wakes_waiting_fiber() {
        let scheduler = Scheduler::new(2);
        let shared = Arc::new((FiberMutex::new(false), FiberCondition::new()));
        let shared2 = shared.clone();
        scheduler
            .spawn(move || {
                let (mutex, cond) = &*shared2;
                let mut guard = mutex.lock();
                while !*guard {
                    guard = cond.wait(guard);
                }
            })
            .unwrap();
        let shared3 = shared.clone();
        scheduler
            .spawn(move || {
                let (mutex, cond) = &*shared3;
                *mutex.lock() = true;
                cond.notify_all();
            })
            .unwrap();
        scheduler.wait_idle();
        assert!(*shared.0.lock());
        scheduler.stop();
    }
}
