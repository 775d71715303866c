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

//! Caps a parent stream at a fixed number of bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::filter::{FilterBase, FilterStream};
use super::{Anchor, StreamHandle};

/// Reads at most `size` bytes from the parent; reads past that are EOF.
/// In strict mode a parent that ends early raises `UnexpectedEof`.
/// Writes past `size` raise `WriteBeyondEof`.
pub struct LimitedStream {
    base: FilterBase,
    size: u64,
    strict: AtomicBool,
    pos: Mutex<u64>,
}

impl LimitedStream {
    pub fn new(parent: StreamHandle, size: u64, own: bool) -> Self {
        LimitedStream {
            base: FilterBase::new(parent, own),
            size,
            strict: AtomicBool::new(false),
            pos: Mutex::new(0),
        }
    }

    /// In strict mode the parent ending before `size` bytes is an error,
    /// not EOF.
    pub fn set_strict(&self, strict: bool) {
        self.strict.store(strict, Ordering::Release);
    }
}

impl FilterStream for LimitedStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn mutates(&self) -> bool {
        true
    }

    fn supports_seek(&self) -> bool {
        self.parent().supports_seek()
    }

    fn supports_tell(&self) -> bool {
        true
    }

    fn supports_size(&self) -> bool {
        true
    }

    fn supports_unread(&self) -> bool {
        self.parent().supports_unread()
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let mut pos = self.pos.lock().unwrap();
        if *pos >= self.size {
            return Ok(0);
        }
        let len = len.min((self.size - *pos).min(usize::MAX as u64) as usize);
        let result = self.parent().read(buffer, len)?;
        if result == 0 && self.strict.load(Ordering::Acquire) {
            return Err(StreamError::UnexpectedEof);
        }
        *pos += result as u64;
        Ok(result)
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        let mut pos = self.pos.lock().unwrap();
        if *pos >= self.size {
            return Err(StreamError::WriteBeyondEof);
        }
        let len = len.min((self.size - *pos).min(usize::MAX as u64) as usize);
        let result = self.parent().write(buffer, len)?;
        *pos += result as u64;
        Ok(result)
    }

    fn seek(&self, offset: i64, anchor: Anchor) -> StreamResult<u64> {
        let mut pos = self.pos.lock().unwrap();
        let (offset, anchor) = match anchor {
            Anchor::End => (offset + FilterStream::size(self)? as i64, Anchor::Begin),
            other => (offset, other),
        };
        if anchor == Anchor::Current && offset == 0 {
            return Ok(*pos);
        }
        if anchor == Anchor::Begin && offset as u64 == *pos {
            return Ok(*pos);
        }
        if !self.parent().supports_seek() {
            return Err(StreamError::Unsupported("seek"));
        }
        *pos = self.parent().seek(offset, anchor)?;
        Ok(*pos)
    }

    fn tell(&self) -> StreamResult<u64> {
        Ok(*self.pos.lock().unwrap())
    }

    fn size(&self) -> StreamResult<u64> {
        let parent = self.parent();
        if !parent.supports_size() {
            return Ok(self.size);
        }
        Ok(self.size.min(parent.size()?))
    }

    fn unread(&self, buffer: &Buffer, len: usize) -> StreamResult<()> {
        self.parent().unread(buffer, len)?;
        *self.pos.lock().unwrap() -= len as u64;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::memory::MemoryStream;
    use crate::streams::Stream;
    use std::sync::Arc;

    #[test]
    fn reads_stop_at_the_limit() {
        let parent = Arc::new(MemoryStream::from(b"0123456789"));
        let limited = LimitedStream::new(parent, 4, false);
        let mut buffer = Buffer::new();
        let mut total = 0;
        loop {
            let read = Stream::read(&limited, &mut buffer, 3).unwrap();
            if read == 0 {
                break;
            }
            total += read;
        }
        assert_eq!(4, total);
        assert_eq!(buffer, b"0123" as &[u8]);
    }

    #[test]
    fn strict_mode_raises_on_short_parent() {
        let parent = Arc::new(MemoryStream::from(b"ab"));
        let limited = LimitedStream::new(parent, 10, false);
        limited.set_strict(true);
        let mut buffer = Buffer::new();
        assert_eq!(2, Stream::read(&limited, &mut buffer, 10).unwrap());
        assert!(matches!(
            Stream::read(&limited, &mut buffer, 10),
            Err(StreamError::UnexpectedEof)
        ));
    }

    #[test]
    fn writes_beyond_the_limit_fail() {
        let parent = Arc::new(MemoryStream::new());
        let limited = LimitedStream::new(parent, 3, false);
        let data = Buffer::from(b"abcd");
        assert_eq!(3, Stream::write(&limited, &data, 4).unwrap());
        assert!(matches!(
            Stream::write(&limited, &data, 1),
            Err(StreamError::WriteBeyondEof)
        ));
    }

    #[test]
    fn size_is_the_smaller_of_limit_and_parent() {
        let parent = Arc::new(MemoryStream::from(b"abc"));
        let limited = LimitedStream::new(parent, 10, false);
        assert_eq!(3, Stream::size(&limited).unwrap());
    }
}
