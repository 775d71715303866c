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

//! The multiplexer assigning ready fibers to a fixed pool of worker
//! threads.
//!
//! Workers loop taking the head of the ready queue and switching into it;
//! when the fiber yields it is requeued at the tail, giving FIFO order per
//! submission thread. There is no global ordering guarantee across
//! threads. An idle worker blocks on the queue condvar; readiness from the
//! I/O manager and timers arrives as [`Scheduler::schedule`] calls.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::trace;

use super::{Fiber, FiberState, SwitchReason};

/// Returned when work is submitted after [`Scheduler::stop`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("scheduler is stopped")]
pub struct SchedulerStopped;

#[derive(Debug, Default)]
struct ReadyQueue {
    ready: VecDeque<Fiber>,
    active: usize,
}

#[derive(Debug)]
struct SchedulerShared {
    queue: Mutex<ReadyQueue>,
    work_cond: Condvar,
    idle_cond: Condvar,
    stopping: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

thread_local! {
    static IS_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Handle to a scheduler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Starts a scheduler with `workers` worker threads.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0);
        let scheduler = Scheduler {
            shared: Arc::new(SchedulerShared {
                queue: Mutex::new(ReadyQueue::default()),
                work_cond: Condvar::new(),
                idle_cond: Condvar::new(),
                stopping: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        };
        let mut handles = scheduler.shared.workers.lock().unwrap();
        for index in 0..workers {
            let worker = scheduler.clone();
            let handle = std::thread::Builder::new()
                .name(format!("scheduler-worker-{index}"))
                .spawn(move || worker.run())
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }
        drop(handles);
        scheduler
    }

    /// Creates a fiber running `entry` and schedules it.
    pub fn spawn<F>(&self, entry: F) -> Result<Fiber, SchedulerStopped>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Fiber::new(Box::new(entry));
        self.schedule(&fiber)?;
        Ok(fiber)
    }

    /// Places a fiber at the tail of the ready queue.
    pub fn schedule(&self, fiber: &Fiber) -> Result<(), SchedulerStopped> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(SchedulerStopped);
        }
        fiber.inner.set_state(FiberState::Ready);
        let mut queue = self.shared.queue.lock().unwrap();
        queue.ready.push_back(fiber.clone());
        self.shared.work_cond.notify_one();
        Ok(())
    }

    /// Places a fiber at the head of the ready queue, ahead of everything
    /// already waiting. Used for direct handoff.
    pub fn schedule_front(&self, fiber: &Fiber) -> Result<(), SchedulerStopped> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(SchedulerStopped);
        }
        fiber.inner.set_state(FiberState::Ready);
        let mut queue = self.shared.queue.lock().unwrap();
        queue.ready.push_front(fiber.clone());
        self.shared.work_cond.notify_one();
        Ok(())
    }

    /// Drains the ready queue and stops the workers. Subsequent `spawn` and
    /// `schedule` calls fail with [`SchedulerStopped`]. Joins the worker
    /// threads unless called from a worker or fiber.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.work_cond.notify_all();
        let on_pool = IS_WORKER.with(Cell::get) || super::in_fiber();
        if !on_pool {
            let handles = std::mem::take(&mut *self.shared.workers.lock().unwrap());
            for handle in handles {
                let _ = handle.join();
            }
        }
    }

    /// Blocks until no fiber is ready or running. Suspended fibers do not
    /// count; they are someone else's responsibility to resume.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        while !queue.ready.is_empty() || queue.active > 0 {
            queue = self.shared.idle_cond.wait(queue).unwrap();
        }
    }

    /// Worker-thread main loop: take a ready fiber, switch into it, repeat.
    /// Returns once the scheduler is stopping and the queue has drained.
    fn run(&self) {
        IS_WORKER.with(|flag| flag.set(true));
        loop {
            let fiber = {
                let mut queue = self.shared.queue.lock().unwrap();
                loop {
                    if let Some(fiber) = queue.ready.pop_front() {
                        queue.active += 1;
                        break fiber;
                    }
                    if self.shared.stopping.load(Ordering::Acquire) {
                        return;
                    }
                    queue = self.shared.work_cond.wait(queue).unwrap();
                }
            };
            trace!(fiber = fiber.id(), "switching in");
            let reason = fiber.switch_in(self);
            let mut queue = self.shared.queue.lock().unwrap();
            queue.active -= 1;
            if reason == SwitchReason::Yielded {
                queue.ready.push_back(fiber);
                self.shared.work_cond.notify_one();
            }
            if queue.active == 0 && queue.ready.is_empty() {
                self.shared.idle_cond.notify_all();
            }
        }
    }
}

/// Direct handoff: schedule `other` ahead of the queue, then yield the
/// current fiber to the tail.
pub fn yield_to(other: &Fiber) {
    let scheduler = super::current_scheduler().expect("yield_to called outside a fiber");
    let _ = scheduler.schedule_front(other);
    super::yield_now();
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn spawn_after_stop_fails() {
        let scheduler = Scheduler::new(1);
        scheduler.stop();
        assert_eq!(Err(SchedulerStopped), scheduler.spawn(|| {}).map(|_| ()));
    }

    #[test]
    fn submission_order_is_fifo_per_thread() {
        let scheduler = Scheduler::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for index in 0..8 {
            let order = order.clone();
            scheduler
                .spawn(move || order.lock().unwrap().push(index))
                .unwrap();
        }
        scheduler.wait_idle();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
        scheduler.stop();
    }

    #[test]
    fn multiple_workers_drain_the_queue() {
        let scheduler = Scheduler::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let count = count.clone();
            scheduler
                .spawn(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        scheduler.wait_idle();
        assert_eq!(32, count.load(Ordering::SeqCst));
        scheduler.stop();
    }
}
