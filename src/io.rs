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

//! Readiness-event dispatcher.
//!
//! Sources register once for both directions; a fiber that hits
//! `WouldBlock` parks itself on its (token, direction) slot and is resumed
//! when the poller sees the matching readiness event. Readiness arriving
//! with nobody parked is latched, since the platform notification is
//! edge-style. The poll loop bounds its wait by the timer manager's next
//! deadline and drains due timer callbacks after each wakeup.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::{trace, warn};

use crate::error::{StreamError, StreamResult};
use crate::fiber::{Parker, Resumer, Wakeup};
use crate::timer::TimerManager;

const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Which half of a registration to wait on or cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct IoRegistration {
    read: Option<Resumer>,
    read_ready: bool,
    write: Option<Resumer>,
    write_ready: bool,
}

struct IoShared {
    registry: Registry,
    registrations: Mutex<Slab<IoRegistration>>,
    waker: Arc<Waker>,
    timers: TimerManager,
    shutdown: AtomicBool,
    poller: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the readiness dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct IoManager {
    shared: Arc<IoShared>,
}

impl IoManager {
    /// Starts the poller thread. The timer manager's wake hook is pointed
    /// at this manager's waker so deadline changes interrupt the wait.
    pub fn new(timers: TimerManager) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let shared = Arc::new(IoShared {
            registry,
            registrations: Mutex::new(Slab::new()),
            waker: waker.clone(),
            timers: timers.clone(),
            shutdown: AtomicBool::new(false),
            poller: Mutex::new(None),
        });
        let hook_waker = waker.clone();
        timers.set_wake_hook(move || {
            let _ = hook_waker.wake();
        });
        let loop_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("io-poller".to_string())
            .spawn(move || poll_loop(poll, loop_shared))?;
        *shared.poller.lock().unwrap() = Some(handle);
        Ok(IoManager { shared })
    }

    /// The timer manager integrated with this poller.
    pub fn timers(&self) -> &TimerManager {
        &self.shared.timers
    }

    /// Registers a source for both directions and returns its token.
    pub fn register_source<S>(&self, source: &mut S) -> io::Result<Token>
    where
        S: Source + ?Sized,
    {
        let token = Token(self.shared.registrations.lock().unwrap().insert(
            IoRegistration::default(),
        ));
        self.shared
            .registry
            .register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(token)
    }

    /// Removes a source. Any parked fiber is resumed with an abort.
    pub fn deregister_source<S>(&self, source: &mut S, token: Token)
    where
        S: Source + ?Sized,
    {
        let _ = self.shared.registry.deregister(source);
        let registration = {
            let mut registrations = self.shared.registrations.lock().unwrap();
            registrations.try_remove(token.0)
        };
        if let Some(registration) = registration {
            if let Some(resumer) = registration.read {
                resumer.resume(Wakeup::Abort);
            }
            if let Some(resumer) = registration.write {
                resumer.resume(Wakeup::Abort);
            }
        }
    }

    /// Parks the caller until the registration is ready in `direction`.
    ///
    /// At most one resumer per direction may be outstanding; a second
    /// waiter in the same direction is a caller contract violation.
    pub fn wait_ready(&self, token: Token, direction: Direction) -> StreamResult<()> {
        let parker = {
            let mut registrations = self.shared.registrations.lock().unwrap();
            let Some(registration) = registrations.get_mut(token.0) else {
                return Err(StreamError::OperationAborted);
            };
            let (ready, slot) = match direction {
                Direction::Read => (&mut registration.read_ready, &mut registration.read),
                Direction::Write => (&mut registration.write_ready, &mut registration.write),
            };
            if *ready {
                *ready = false;
                return Ok(());
            }
            debug_assert!(slot.is_none(), "second waiter in the same direction");
            let parker = Parker::new();
            *slot = Some(parker.resumer());
            parker
        };
        match parker.park() {
            Wakeup::Resume => Ok(()),
            Wakeup::Abort => Err(StreamError::OperationAborted),
        }
    }

    /// Resumes the parked waiter in `direction`, if any, with an abort.
    pub fn cancel_wait(&self, token: Token, direction: Direction) {
        let resumer = {
            let mut registrations = self.shared.registrations.lock().unwrap();
            registrations.get_mut(token.0).and_then(|registration| {
                match direction {
                    Direction::Read => registration.read.take(),
                    Direction::Write => registration.write.take(),
                }
            })
        };
        if let Some(resumer) = resumer {
            resumer.resume(Wakeup::Abort);
        }
    }

    /// Stops the poller thread and joins it.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
        let handle = self.shared.poller.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn poll_loop(mut poll: Poll, shared: Arc<IoShared>) {
    let mut events = Events::with_capacity(1024);
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let timeout = shared.timers.next_timeout();
        if let Err(err) = poll.poll(&mut events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(%err, "readiness poll failed");
            return;
        }
        let mut resumed = Vec::new();
        {
            let mut registrations = shared.registrations.lock().unwrap();
            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let Some(registration) = registrations.get_mut(token.0) else {
                    continue;
                };
                trace!(token = token.0, readable = event.is_readable(), writable = event.is_writable(), "readiness");
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    match registration.read.take() {
                        Some(resumer) => resumed.push(resumer),
                        None => registration.read_ready = true,
                    }
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    match registration.write.take() {
                        Some(resumer) => resumed.push(resumer),
                        None => registration.write_ready = true,
                    }
                }
            }
        }
        for resumer in resumed {
            resumer.resume(Wakeup::Resume);
        }
        shared.timers.fire_expired();
    }
}
