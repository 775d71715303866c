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

//! Cooperatively scheduled execution units.
//!
//! A [`Fiber`] is a resumable unit of work multiplexed onto the
//! [`Scheduler`]'s worker pool. Each fiber is backed by a lazily-started OS
//! thread whose execution is gated by a run-permit handshake with the
//! worker driving it, so at most one fiber per worker executes at a time
//! and every suspension point is explicit: [`yield_now`], [`Parker::park`],
//! a contended [`sync::FiberMutex`], managed I/O, or a timer sleep.
//!
//! Cancellation is value-typed. A resumer injects a [`Wakeup`] when it
//! schedules a suspended fiber; the parked operation observes it on return
//! and converts `Wakeup::Abort` into an `OperationAborted` error. No unwind
//! state crosses a switch.

pub mod scheduler;
pub mod sync;

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::error;

pub use scheduler::{Scheduler, SchedulerStopped};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created, never run.
    Init,
    /// In the scheduler's ready queue.
    Ready,
    /// Currently executing on a worker.
    Running,
    /// Parked, referenced by an external resumer.
    Suspended,
    /// Ran to completion.
    Terminated,
    /// Terminated by a panic.
    Except,
}

/// The value a resumer injects when scheduling a suspended fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// Proceed normally.
    Resume,
    /// The awaited operation was cancelled; fail with `OperationAborted`.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchReason {
    Yielded,
    Parked,
    Finished,
}

/// Run-permit handshake primitive between workers and a fiber thread.
/// Counting, so that an early post (a resumer fires before the fiber has
/// finished parking) is not lost.
#[derive(Debug, Default)]
struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn post(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;
    }
}

/// Switch events flowing from a fiber back to whichever worker is waiting
/// on it. The reason travels with the event so two workers racing on the
/// same fiber each observe exactly one switch.
#[derive(Debug, Default)]
struct EventGate {
    events: Mutex<std::collections::VecDeque<SwitchReason>>,
    cond: Condvar,
}

impl EventGate {
    fn post(&self, reason: SwitchReason) {
        let mut events = self.events.lock().unwrap();
        events.push_back(reason);
        self.cond.notify_one();
    }

    fn wait(&self) -> SwitchReason {
        let mut events = self.events.lock().unwrap();
        loop {
            if let Some(reason) = events.pop_front() {
                return reason;
            }
            events = self.cond.wait(events).unwrap();
        }
    }
}

pub(crate) struct FiberInner {
    id: u64,
    state: Mutex<FiberState>,
    entry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    resume_sem: Semaphore,
    events: EventGate,
    wakeup: Mutex<Option<Wakeup>>,
    started: AtomicBool,
}

impl std::fmt::Debug for FiberInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberInner")
            .field("id", &self.id)
            .field("state", &*self.state.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl FiberInner {
    fn set_state(&self, state: FiberState) {
        *self.state.lock().unwrap() = state;
    }
}

/// Handle to a fiber. Cheap to clone; all clones refer to the same fiber.
#[derive(Debug, Clone)]
pub struct Fiber {
    pub(crate) inner: Arc<FiberInner>,
}

impl Fiber {
    pub(crate) fn new(entry: Box<dyn FnOnce() + Send>) -> Self {
        Fiber {
            inner: Arc::new(FiberInner {
                id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(FiberState::Init),
                entry: Mutex::new(Some(entry)),
                resume_sem: Semaphore::default(),
                events: EventGate::default(),
                wakeup: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Unique identity of this fiber.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FiberState {
        *self.inner.state.lock().unwrap()
    }

    pub(crate) fn inject(&self, wakeup: Wakeup) {
        *self.inner.wakeup.lock().unwrap() = Some(wakeup);
    }

    /// Switches a worker into this fiber and blocks the worker until the
    /// fiber yields, parks, or finishes.
    pub(crate) fn switch_in(&self, scheduler: &Scheduler) -> SwitchReason {
        if !self.inner.started.swap(true, Ordering::AcqRel) {
            let inner = self.inner.clone();
            let scheduler = scheduler.clone();
            std::thread::Builder::new()
                .name(format!("fiber-{}", inner.id))
                .spawn(move || fiber_main(inner, scheduler))
                .expect("failed to spawn fiber thread");
        }
        self.inner.resume_sem.post();
        self.inner.events.wait()
    }
}

struct CurrentFiber {
    inner: Arc<FiberInner>,
    scheduler: Scheduler,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentFiber>> = const { RefCell::new(None) };
}

fn fiber_main(inner: Arc<FiberInner>, scheduler: Scheduler) {
    inner.resume_sem.wait();
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(CurrentFiber {
            inner: inner.clone(),
            scheduler,
        });
    });
    inner.set_state(FiberState::Running);
    let entry = inner
        .entry
        .lock()
        .unwrap()
        .take()
        .expect("fiber resumed twice");
    let result = catch_unwind(AssertUnwindSafe(entry));
    match result {
        Ok(()) => inner.set_state(FiberState::Terminated),
        Err(payload) => {
            let message = panic_message(&payload);
            error!(fiber = inner.id, %message, "fiber terminated by panic");
            inner.set_state(FiberState::Except);
        }
    }
    inner.events.post(SwitchReason::Finished);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Whether the calling thread is executing a fiber.
pub fn in_fiber() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

/// The fiber executing on this thread, if any.
pub fn current_fiber() -> Option<Fiber> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|cur| Fiber {
                inner: cur.inner.clone(),
            })
    })
}

pub(crate) fn current_scheduler() -> Option<Scheduler> {
    CURRENT.with(|current| current.borrow().as_ref().map(|cur| cur.scheduler.clone()))
}

/// Voluntarily returns control to the scheduler; the current fiber is
/// requeued at the tail of the ready queue.
pub fn yield_now() {
    let (inner, _) = must_current("yield_now");
    inner.set_state(FiberState::Ready);
    inner.events.post(SwitchReason::Yielded);
    inner.resume_sem.wait();
    inner.set_state(FiberState::Running);
}

fn must_current(op: &str) -> (Arc<FiberInner>, Scheduler) {
    CURRENT.with(|current| {
        let borrowed = current.borrow();
        let cur = borrowed
            .as_ref()
            .unwrap_or_else(|| panic!("{op} called outside a fiber"));
        (cur.inner.clone(), cur.scheduler.clone())
    })
}

fn park_current() -> Wakeup {
    let (inner, _) = must_current("park");
    inner.set_state(FiberState::Suspended);
    inner.events.post(SwitchReason::Parked);
    inner.resume_sem.wait();
    inner.set_state(FiberState::Running);
    let result = inner.wakeup.lock().unwrap().take().unwrap_or(Wakeup::Resume);
    result
}

#[derive(Debug)]
struct ThreadParker {
    slot: Mutex<Option<Wakeup>>,
    cond: Condvar,
}

impl ThreadParker {
    fn new() -> Self {
        ThreadParker {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn park(&self) -> Wakeup {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(wakeup) = slot.take() {
                return wakeup;
            }
            slot = self.cond.wait(slot).unwrap();
        }
    }

    fn unpark(&self, wakeup: Wakeup) {
        *self.slot.lock().unwrap() = Some(wakeup);
        self.cond.notify_one();
    }
}

/// One-shot suspension point for the calling context.
///
/// Captures the current fiber when called on a worker, and falls back to
/// blocking the calling thread otherwise, so stream primitives remain
/// usable from plain threads (notably tests). Hand the [`Resumer`] to
/// whatever will produce the wakeup, then call [`Parker::park`].
#[derive(Debug)]
pub struct Parker(ParkerImpl);

#[derive(Debug)]
enum ParkerImpl {
    Fiber { fiber: Fiber, scheduler: Scheduler },
    Thread(Arc<ThreadParker>),
}

impl Parker {
    pub fn new() -> Self {
        CURRENT.with(|current| match current.borrow().as_ref() {
            Some(cur) => Parker(ParkerImpl::Fiber {
                fiber: Fiber {
                    inner: cur.inner.clone(),
                },
                scheduler: cur.scheduler.clone(),
            }),
            None => Parker(ParkerImpl::Thread(Arc::new(ThreadParker::new()))),
        })
    }

    /// A handle that resumes this parker exactly once.
    pub fn resumer(&self) -> Resumer {
        match &self.0 {
            ParkerImpl::Fiber { fiber, scheduler } => Resumer(ResumerImpl::Fiber {
                fiber: fiber.clone(),
                scheduler: scheduler.clone(),
            }),
            ParkerImpl::Thread(parker) => Resumer(ResumerImpl::Thread(parker.clone())),
        }
    }

    /// Suspends until the matching [`Resumer`] fires.
    pub fn park(self) -> Wakeup {
        match self.0 {
            ParkerImpl::Fiber { fiber, .. } => {
                debug_assert_eq!(
                    Some(fiber.id()),
                    current_fiber().map(|f| f.id()),
                    "parker must park on its own fiber"
                );
                park_current()
            }
            ParkerImpl::Thread(parker) => parker.park(),
        }
    }
}

impl Default for Parker {
    fn default() -> Self {
        Parker::new()
    }
}

/// Resumes a suspended [`Parker`], injecting a [`Wakeup`]. Safe to call
/// from any thread or fiber.
#[derive(Debug)]
pub struct Resumer(ResumerImpl);

#[derive(Debug)]
enum ResumerImpl {
    Fiber { fiber: Fiber, scheduler: Scheduler },
    Thread(Arc<ThreadParker>),
}

impl Resumer {
    pub fn resume(self, wakeup: Wakeup) {
        match self.0 {
            ResumerImpl::Fiber { fiber, scheduler } => {
                fiber.inject(wakeup);
                if scheduler.schedule(&fiber).is_err() {
                    error!(fiber = fiber.id(), "resumed fiber on stopped scheduler");
                }
            }
            ResumerImpl::Thread(parker) => parker.unpark(wakeup),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn parker_falls_back_to_thread_blocking() {
        let parker = Parker::new();
        let resumer = parker.resumer();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            resumer.resume(Wakeup::Abort);
        });
        assert_eq!(Wakeup::Abort, parker.park());
        handle.join().unwrap();
    }

    #[test]
    fn spawned_fiber_runs_and_terminates() {
        let scheduler = Scheduler::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let fiber = scheduler
            .spawn(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        scheduler.wait_idle();
        assert_eq!(1, ran.load(Ordering::SeqCst));
        assert_eq!(FiberState::Terminated, fiber.state());
        scheduler.stop();
    }

    #[test]
    fn yield_now_interleaves_fibers() {
        let scheduler = Scheduler::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let log = log.clone();
            scheduler
                .spawn(move || {
                    for round in 0..3 {
                        log.lock().unwrap().push((name, round));
                        yield_now();
                    }
                })
                .unwrap();
        }
        scheduler.wait_idle();
        let log = log.lock().unwrap();
        assert_eq!(6, log.len());
        // Per-fiber order is preserved across yields.
        for name in ["a", "b"] {
            let rounds: Vec<_> = log
                .iter()
                .filter(|entry| entry.0 == name)
                .map(|entry| entry.1)
                .collect();
            assert_eq!(vec![0, 1, 2], rounds);
        }
        scheduler.stop();
    }

    #[test]
    fn parked_fiber_observes_injected_wakeup() {
        let scheduler = Scheduler::new(1);
        let observed = Arc::new(Mutex::new(None));
        let observed2 = observed.clone();
        let resumer_slot: Arc<Mutex<Option<Resumer>>> = Arc::new(Mutex::new(None));
        let resumer_slot2 = resumer_slot.clone();
        scheduler
            .spawn(move || {
                let parker = Parker::new();
                *resumer_slot2.lock().unwrap() = Some(parker.resumer());
                let wakeup = parker.park();
                *observed2.lock().unwrap() = Some(wakeup);
            })
            .unwrap();
        let resumer = loop {
            if let Some(resumer) = resumer_slot.lock().unwrap().take() {
                break resumer;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        resumer.resume(Wakeup::Abort);
        scheduler.wait_idle();
        assert_eq!(Some(Wakeup::Abort), *observed.lock().unwrap());
        scheduler.stop();
    }

    #[test]
    fn panicking_fiber_reaches_except_state() {
        let scheduler = Scheduler::new(1);
        let fiber = scheduler.spawn(|| panic!("boom")).unwrap();
        scheduler.wait_idle();
        assert_eq!(FiberState::Except, fiber.state());
        scheduler.stop();
    }
}
