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

//! Filter composition.
//!
//! A filter holds a handle to its parent and a delegation policy. Implement
//! [`FilterStream`] and override only the operations the filter changes;
//! the blanket impl turns any `FilterStream` into a [`Stream`] that
//! delegates everything else. A filter that reports `mutates()` transforms
//! bytes in flight, so positional operations (seek/tell/size/truncate/
//! find/unread) are refused regardless of what the parent supports.
//!
//! Closing a filter closes its parent iff the filter owns it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::{Anchor, CloseType, Stream, StreamHandle};

/// Parent handle plus ownership flag, embeddable in any filter. The parent
/// is swappable so a stack can be re-spliced (the HTTP engine inserts a
/// timeout stream next to the transport this way).
pub struct FilterBase {
    parent: Mutex<StreamHandle>,
    owns: AtomicBool,
}

impl FilterBase {
    pub fn new(parent: StreamHandle, owns: bool) -> Self {
        FilterBase {
            parent: Mutex::new(parent),
            owns: AtomicBool::new(owns),
        }
    }

    #[inline]
    pub fn parent(&self) -> StreamHandle {
        self.parent.lock().unwrap().clone()
    }

    pub fn set_parent(&self, parent: StreamHandle) {
        *self.parent.lock().unwrap() = parent;
    }

    #[inline]
    pub fn owns_parent(&self) -> bool {
        self.owns.load(Ordering::Acquire)
    }

    pub fn set_owns_parent(&self, owns: bool) {
        self.owns.store(owns, Ordering::Release);
    }
}

/// A stream that wraps a parent. Every method defaults to delegation;
/// override the ones the filter changes.
pub trait FilterStream: Send + Sync {
    fn parent(&self) -> StreamHandle;

    fn owns_parent(&self) -> bool {
        true
    }

    /// Whether this filter transforms the bytes flowing through it.
    fn mutates(&self) -> bool {
        false
    }

    fn supports_half_close(&self) -> bool {
        self.parent().supports_half_close()
    }
    fn supports_read(&self) -> bool {
        self.parent().supports_read()
    }
    fn supports_write(&self) -> bool {
        self.parent().supports_write()
    }
    fn supports_seek(&self) -> bool {
        !self.mutates() && self.parent().supports_seek()
    }
    fn supports_tell(&self) -> bool {
        self.supports_seek()
    }
    fn supports_size(&self) -> bool {
        !self.mutates() && self.parent().supports_size()
    }
    fn supports_truncate(&self) -> bool {
        !self.mutates() && self.parent().supports_truncate()
    }
    fn supports_find(&self) -> bool {
        !self.mutates() && self.parent().supports_find()
    }
    fn supports_unread(&self) -> bool {
        !self.mutates() && self.parent().supports_unread()
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        if self.owns_parent() {
            self.parent().close(close_type)
        } else {
            Ok(())
        }
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        self.parent().read(buffer, len)
    }

    fn cancel_read(&self) {
        self.parent().cancel_read()
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        self.parent().write(buffer, len)
    }

    fn cancel_write(&self) {
        self.parent().cancel_write()
    }

    fn seek(&self, offset: i64, anchor: Anchor) -> StreamResult<u64> {
        if self.mutates() {
            return Err(StreamError::Unsupported("seek"));
        }
        self.parent().seek(offset, anchor)
    }

    fn tell(&self) -> StreamResult<u64> {
        if self.mutates() {
            return Err(StreamError::Unsupported("tell"));
        }
        self.parent().tell()
    }

    fn size(&self) -> StreamResult<u64> {
        if self.mutates() {
            return Err(StreamError::Unsupported("size"));
        }
        self.parent().size()
    }

    fn truncate(&self, size: u64) -> StreamResult<()> {
        if self.mutates() {
            return Err(StreamError::Unsupported("truncate"));
        }
        self.parent().truncate(size)
    }

    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        if flush_parent {
            self.parent().flush(true)
        } else {
            Ok(())
        }
    }

    fn find(
        &self,
        delimiter: &[u8],
        sanity_limit: usize,
        error_if_missing: bool,
    ) -> StreamResult<isize> {
        if self.mutates() {
            return Err(StreamError::Unsupported("find"));
        }
        self.parent().find(delimiter, sanity_limit, error_if_missing)
    }

    fn unread(&self, buffer: &Buffer, len: usize) -> StreamResult<()> {
        if self.mutates() {
            return Err(StreamError::Unsupported("unread"));
        }
        self.parent().unread(buffer, len)
    }
}

impl<T: FilterStream> Stream for T {
    fn supports_half_close(&self) -> bool {
        FilterStream::supports_half_close(self)
    }
    fn supports_read(&self) -> bool {
        FilterStream::supports_read(self)
    }
    fn supports_write(&self) -> bool {
        FilterStream::supports_write(self)
    }
    fn supports_seek(&self) -> bool {
        FilterStream::supports_seek(self)
    }
    fn supports_tell(&self) -> bool {
        FilterStream::supports_tell(self)
    }
    fn supports_size(&self) -> bool {
        FilterStream::supports_size(self)
    }
    fn supports_truncate(&self) -> bool {
        FilterStream::supports_truncate(self)
    }
    fn supports_find(&self) -> bool {
        FilterStream::supports_find(self)
    }
    fn supports_unread(&self) -> bool {
        FilterStream::supports_unread(self)
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        FilterStream::close(self, close_type)
    }
    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        FilterStream::read(self, buffer, len)
    }
    fn cancel_read(&self) {
        FilterStream::cancel_read(self)
    }
    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        FilterStream::write(self, buffer, len)
    }
    fn cancel_write(&self) {
        FilterStream::cancel_write(self)
    }
    fn seek(&self, offset: i64, anchor: Anchor) -> StreamResult<u64> {
        FilterStream::seek(self, offset, anchor)
    }
    fn tell(&self) -> StreamResult<u64> {
        FilterStream::tell(self)
    }
    fn size(&self) -> StreamResult<u64> {
        FilterStream::size(self)
    }
    fn truncate(&self, size: u64) -> StreamResult<()> {
        FilterStream::truncate(self, size)
    }
    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        FilterStream::flush(self, flush_parent)
    }
    fn find(
        &self,
        delimiter: &[u8],
        sanity_limit: usize,
        error_if_missing: bool,
    ) -> StreamResult<isize> {
        FilterStream::find(self, delimiter, sanity_limit, error_if_missing)
    }
    fn unread(&self, buffer: &Buffer, len: usize) -> StreamResult<()> {
        FilterStream::unread(self, buffer, len)
    }
}
