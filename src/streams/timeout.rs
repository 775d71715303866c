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

//! Read, write, and idle timeouts over a stream.
//!
//! Each read starts a per-op read timer and refreshes the idle timer; each
//! write does the same with the write timer. On expiry the handler cancels
//! the matching direction on the parent, converting the resulting
//! `OperationAborted` into `TimedOut`, and latches: every later operation
//! fails fast with `TimedOut`.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};
use crate::fiber::sync::FiberMutex;
use crate::timer::{TimerHandle, TimerManager};

use super::filter::{FilterBase, FilterStream};
use super::StreamHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Timing,
    TimedOut,
}

struct HandlerCore {
    timeout: Option<Duration>,
    timer: Option<TimerHandle>,
    phase: Phase,
    latched: bool,
}

/// One timer lane (read, write, or idle).
struct TimeoutHandler {
    core: Arc<Mutex<HandlerCore>>,
    timers: TimerManager,
    action: Arc<dyn Fn() + Send + Sync>,
    // Conditional-timer witness; dropping the stream disarms pending
    // timers without racing their callbacks.
    witness: Arc<dyn Any + Send + Sync>,
    auto_start: bool,
}

impl TimeoutHandler {
    fn new(timers: TimerManager, action: Arc<dyn Fn() + Send + Sync>, auto_start: bool) -> Self {
        TimeoutHandler {
            core: Arc::new(Mutex::new(HandlerCore {
                timeout: None,
                timer: None,
                phase: Phase::Idle,
                latched: false,
            })),
            timers,
            action,
            witness: Arc::new(()),
            auto_start,
        }
    }

    fn arm(&self, core: &mut HandlerCore) {
        let Some(timeout) = core.timeout else {
            return;
        };
        let timer_core = self.core.clone();
        let action = self.action.clone();
        core.timer = Some(self.timers.register_conditional_timer(
            timeout,
            move || {
                let fire = {
                    let mut core = timer_core.lock().unwrap();
                    if core.phase == Phase::Timing {
                        debug!("stream timeout");
                        core.phase = Phase::TimedOut;
                        core.latched = true;
                        true
                    } else {
                        false
                    }
                };
                if fire {
                    action();
                }
            },
            Arc::downgrade(&self.witness),
        ));
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        let mut core = self.core.lock().unwrap();
        core.timeout = timeout;
        if let Some(timer) = core.timer.take() {
            match timeout {
                Some(timeout) => {
                    timer.reset(timeout, true);
                    core.timer = Some(timer);
                }
                None => timer.cancel(),
            }
        } else if timeout.is_some() && (core.phase == Phase::Timing || self.auto_start) {
            self.arm(&mut core);
        }
    }

    /// Starts the per-op timer. Fails fast when a previous expiry latched.
    fn start(&self) -> StreamResult<()> {
        let mut core = self.core.lock().unwrap();
        if core.latched {
            return Err(StreamError::TimedOut);
        }
        core.phase = Phase::Timing;
        if core.timer.is_none() {
            self.arm(&mut core);
        }
        Ok(())
    }

    /// Stops the timer; reports whether it had expired.
    fn cancel(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        let expired = core.phase == Phase::TimedOut;
        if let Some(timer) = core.timer.take() {
            timer.cancel();
        }
        core.phase = Phase::Idle;
        expired
    }

    /// Re-arms the timer; reports whether it had expired.
    fn refresh(&self) -> bool {
        let mut core = self.core.lock().unwrap();
        let expired = core.phase == Phase::TimedOut;
        if let Some(timer) = &core.timer {
            timer.refresh();
        }
        core.phase = Phase::Timing;
        expired
    }
}

struct Lanes {
    reader: TimeoutHandler,
    writer: TimeoutHandler,
    idler: TimeoutHandler,
}

pub struct TimeoutStream {
    base: FilterBase,
    lanes: FiberMutex<Lanes>,
}

impl TimeoutStream {
    pub fn new(parent: StreamHandle, timers: TimerManager, own: bool) -> Self {
        let read_parent = parent.clone();
        let write_parent = parent.clone();
        let idle_parent = parent.clone();
        let lanes = Lanes {
            reader: TimeoutHandler::new(
                timers.clone(),
                Arc::new(move || read_parent.cancel_read()),
                false,
            ),
            writer: TimeoutHandler::new(
                timers.clone(),
                Arc::new(move || write_parent.cancel_write()),
                false,
            ),
            idler: TimeoutHandler::new(
                timers,
                Arc::new(move || {
                    idle_parent.cancel_read();
                    idle_parent.cancel_write();
                }),
                true,
            ),
        };
        TimeoutStream {
            base: FilterBase::new(parent, own),
            lanes: FiberMutex::new(lanes),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.lanes.lock().reader.set_timeout(timeout);
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.lanes.lock().writer.set_timeout(timeout);
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.lanes.lock().idler.set_timeout(timeout);
    }
}

impl FilterStream for TimeoutStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        {
            let lanes = self.lanes.lock();
            lanes.reader.start()?;
            if lanes.idler.refresh() {
                lanes.reader.cancel();
                return Err(StreamError::TimedOut);
            }
        }
        let result = self.parent().read(buffer, len);
        let lanes = self.lanes.lock();
        match result {
            Err(StreamError::OperationAborted) => {
                let read_expired = lanes.reader.cancel();
                let idle_expired = lanes.idler.cancel();
                if read_expired || idle_expired {
                    Err(StreamError::TimedOut)
                } else {
                    Err(StreamError::OperationAborted)
                }
            }
            Err(err) => {
                lanes.reader.cancel();
                lanes.idler.cancel();
                Err(err)
            }
            Ok(result) => {
                lanes.reader.cancel();
                lanes.idler.refresh();
                Ok(result)
            }
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        {
            let lanes = self.lanes.lock();
            lanes.writer.start()?;
            if lanes.idler.refresh() {
                lanes.writer.cancel();
                return Err(StreamError::TimedOut);
            }
        }
        let result = self.parent().write(buffer, len);
        let lanes = self.lanes.lock();
        match result {
            Err(StreamError::OperationAborted) => {
                let write_expired = lanes.writer.cancel();
                let idle_expired = lanes.idler.cancel();
                if write_expired || idle_expired {
                    Err(StreamError::TimedOut)
                } else {
                    Err(StreamError::OperationAborted)
                }
            }
            Err(err) => {
                lanes.writer.cancel();
                lanes.idler.cancel();
                Err(err)
            }
            Ok(result) => {
                lanes.writer.cancel();
                lanes.idler.refresh();
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::IoManager;
    use crate::streams::pipe::pipe;
    use crate::streams::{write_all, Stream};
    use std::time::Instant;

    fn poller() -> (TimerManager, IoManager) {
        let timers = TimerManager::new();
        let io = IoManager::new(timers.clone()).unwrap();
        (timers, io)
    }

    #[test]
    fn read_times_out_on_a_silent_stream() {
        let (timers, io) = poller();
        let (a, _b) = pipe();
        let timeout = TimeoutStream::new(a, timers, false);
        timeout.set_read_timeout(Some(Duration::from_millis(20)));
        let start = Instant::now();
        let mut buffer = Buffer::new();
        let result = Stream::read(&timeout, &mut buffer, 16);
        assert!(matches!(result, Err(StreamError::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        io.stop();
    }

    #[test]
    fn latched_timeout_fails_fast() {
        let (timers, io) = poller();
        let (a, _b) = pipe();
        let timeout = TimeoutStream::new(a, timers, false);
        timeout.set_read_timeout(Some(Duration::from_millis(10)));
        let mut buffer = Buffer::new();
        assert!(Stream::read(&timeout, &mut buffer, 16).is_err());
        let start = Instant::now();
        assert!(matches!(
            Stream::read(&timeout, &mut buffer, 16),
            Err(StreamError::TimedOut)
        ));
        assert!(start.elapsed() < Duration::from_millis(10));
        io.stop();
    }

    #[test]
    fn data_arriving_in_time_cancels_the_timer() {
        let (timers, io) = poller();
        let (a, b) = pipe();
        let timeout = TimeoutStream::new(a, timers, false);
        timeout.set_read_timeout(Some(Duration::from_millis(200)));
        write_all(&*b, b"fast").unwrap();
        let mut buffer = Buffer::new();
        assert_eq!(4, Stream::read(&timeout, &mut buffer, 16).unwrap());
        io.stop();
    }
}
