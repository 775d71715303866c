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

//! Callbacks on stream lifecycle events.
//!
//! The HTTP engine wraps every body stream in one of these to learn when
//! the body completes (eof/close), fails (exception), or flushes. The
//! callbacks are clearable, which is how a request detaches from a body
//! stream it no longer owns.

use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::error::StreamResult;

use super::filter::{FilterBase, FilterStream};
use super::{CloseType, StreamHandle};

type Notify = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_close: Option<Notify>,
    on_eof: Option<Notify>,
    on_exception: Option<Notify>,
    on_flush: Option<Notify>,
}

pub struct NotifyStream {
    base: FilterBase,
    callbacks: Mutex<Callbacks>,
}

impl NotifyStream {
    pub fn new(parent: StreamHandle, own: bool) -> Self {
        NotifyStream {
            base: FilterBase::new(parent, own),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    pub fn on_close<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.callbacks.lock().unwrap().on_close = Some(Arc::new(callback));
    }

    pub fn on_eof<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.callbacks.lock().unwrap().on_eof = Some(Arc::new(callback));
    }

    pub fn on_exception<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.callbacks.lock().unwrap().on_exception = Some(Arc::new(callback));
    }

    pub fn on_flush<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.callbacks.lock().unwrap().on_flush = Some(Arc::new(callback));
    }

    /// Detaches every callback. Events after this are silent.
    pub fn clear_callbacks(&self) {
        *self.callbacks.lock().unwrap() = Callbacks::default();
    }

    // The callback runs outside the lock; callbacks may clear or replace
    // themselves.
    fn fire(&self, pick: fn(&Callbacks) -> Option<&Notify>) {
        let callback = {
            let callbacks = self.callbacks.lock().unwrap();
            pick(&callbacks).cloned()
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl FilterStream for NotifyStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        if self.owns_parent() {
            if let Err(err) = self.parent().close(close_type) {
                self.fire(|cb| cb.on_exception.as_ref());
                return Err(err);
            }
        }
        self.fire(|cb| cb.on_close.as_ref());
        Ok(())
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        match self.parent().read(buffer, len) {
            Ok(0) => {
                self.fire(|cb| cb.on_eof.as_ref());
                Ok(0)
            }
            Ok(read) => Ok(read),
            Err(err) => {
                self.fire(|cb| cb.on_exception.as_ref());
                Err(err)
            }
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        match self.parent().write(buffer, len) {
            Ok(written) => Ok(written),
            Err(err) => {
                self.fire(|cb| cb.on_exception.as_ref());
                Err(err)
            }
        }
    }

    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        if let Err(err) = self.parent().flush(flush_parent) {
            self.fire(|cb| cb.on_exception.as_ref());
            return Err(err);
        }
        self.fire(|cb| cb.on_flush.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::memory::MemoryStream;
    use crate::streams::Stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn eof_fires_once_per_empty_read() {
        let parent = Arc::new(MemoryStream::from(b"x"));
        let notify = NotifyStream::new(parent, false);
        let eofs = Arc::new(AtomicUsize::new(0));
        let eofs2 = eofs.clone();
        notify.on_eof(move || {
            eofs2.fetch_add(1, Ordering::SeqCst);
        });
        let mut buffer = Buffer::new();
        Stream::read(&notify, &mut buffer, 4).unwrap();
        assert_eq!(0, eofs.load(Ordering::SeqCst));
        Stream::read(&notify, &mut buffer, 4).unwrap();
        assert_eq!(1, eofs.load(Ordering::SeqCst));
    }

    #[test]
    fn cleared_callbacks_are_silent() {
        let parent = Arc::new(MemoryStream::from(b""));
        let notify = NotifyStream::new(parent, false);
        let eofs = Arc::new(AtomicUsize::new(0));
        let eofs2 = eofs.clone();
        notify.on_eof(move || {
            eofs2.fetch_add(1, Ordering::SeqCst);
        });
        notify.clear_callbacks();
        let mut buffer = Buffer::new();
        Stream::read(&notify, &mut buffer, 4).unwrap();
        assert_eq!(0, eofs.load(Ordering::SeqCst));
    }

    #[test]
    fn close_fires_after_the_parent_closes() {
        let parent = Arc::new(MemoryStream::new());
        let notify = NotifyStream::new(parent, true);
        let closed = Arc::new(AtomicUsize::new(0));
        let closed2 = closed.clone();
        notify.on_close(move || {
            closed2.fetch_add(1, Ordering::SeqCst);
        });
        Stream::close(&notify, CloseType::Both).unwrap();
        assert_eq!(1, closed.load(Ordering::SeqCst));
    }
}
