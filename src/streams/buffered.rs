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

//! Read buffering and write coalescing.
//!
//! Guarantees `find` and `unread` over any readable parent, which is what
//! the HTTP engine needs to parse headers without consuming body bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::filter::{FilterBase, FilterStream};
use super::{Anchor, CloseType, StreamHandle};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

pub struct BufferedStream {
    base: FilterBase,
    buffer_size: usize,
    allow_partial_reads: AtomicBool,
    read_buffer: Mutex<Buffer>,
    write_buffer: Mutex<Buffer>,
}

impl BufferedStream {
    pub fn new(parent: StreamHandle, own: bool) -> Self {
        BufferedStream::with_buffer_size(parent, own, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(parent: StreamHandle, own: bool, buffer_size: usize) -> Self {
        BufferedStream {
            base: FilterBase::new(parent, own),
            buffer_size,
            allow_partial_reads: AtomicBool::new(false),
            read_buffer: Mutex::new(Buffer::new()),
            write_buffer: Mutex::new(Buffer::new()),
        }
    }

    /// By default a read loops until it satisfies the requested length or
    /// hits EOF. Partial reads return as soon as anything is available,
    /// which is what interactive protocols want.
    pub fn allow_partial_reads(&self, allow: bool) {
        self.allow_partial_reads.store(allow, Ordering::Release);
    }

    fn flush_write_buffer(&self, write_buffer: &mut Buffer) -> StreamResult<()> {
        let parent = self.parent();
        while !write_buffer.is_empty() {
            let written = parent.write(write_buffer, write_buffer.read_available())?;
            write_buffer.consume(written);
        }
        Ok(())
    }
}

impl FilterStream for BufferedStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn supports_find(&self) -> bool {
        self.parent().supports_read()
    }

    fn supports_unread(&self) -> bool {
        self.parent().supports_read()
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let allow_partial = self.allow_partial_reads.load(Ordering::Acquire);
        let mut read_buffer = self.read_buffer.lock().unwrap();
        let mut done = 0;
        loop {
            if !read_buffer.is_empty() {
                let take = read_buffer.read_available().min(len - done);
                buffer.copy_in_from(&read_buffer, take);
                read_buffer.consume(take);
                done += take;
            }
            if done == len || (done > 0 && allow_partial) {
                return Ok(done);
            }
            let want = self.buffer_size.max(len - done);
            match self.parent().read(&mut read_buffer, want) {
                Ok(0) => return Ok(done),
                Ok(_) => continue,
                // Data already moved to the caller is delivered; the
                // failure recurs on the next read of the parent.
                Err(err) if done > 0 => {
                    let _ = err;
                    return Ok(done);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        let mut write_buffer = self.write_buffer.lock().unwrap();
        write_buffer.copy_in_from(buffer, len);
        if write_buffer.read_available() >= self.buffer_size {
            self.flush_write_buffer(&mut write_buffer)?;
        }
        Ok(len)
    }

    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        {
            let mut write_buffer = self.write_buffer.lock().unwrap();
            self.flush_write_buffer(&mut write_buffer)?;
        }
        if flush_parent {
            self.parent().flush(true)?;
        }
        Ok(())
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        if close_type.closes_write() {
            let mut write_buffer = self.write_buffer.lock().unwrap();
            self.flush_write_buffer(&mut write_buffer)?;
        }
        if self.owns_parent() {
            self.parent().close(close_type)?;
        }
        Ok(())
    }

    fn seek(&self, offset: i64, anchor: Anchor) -> StreamResult<u64> {
        FilterStream::flush(self, false)?;
        let mut read_buffer = self.read_buffer.lock().unwrap();
        let buffered = read_buffer.read_available() as i64;
        let result = match anchor {
            Anchor::Current => self.parent().seek(offset - buffered, Anchor::Current)?,
            other => self.parent().seek(offset, other)?,
        };
        read_buffer.clear();
        Ok(result)
    }

    fn tell(&self) -> StreamResult<u64> {
        let buffered = self.read_buffer.lock().unwrap().read_available() as u64;
        Ok(self.parent().tell()? - buffered)
    }

    fn find(
        &self,
        delimiter: &[u8],
        sanity_limit: usize,
        error_if_missing: bool,
    ) -> StreamResult<isize> {
        let mut read_buffer = self.read_buffer.lock().unwrap();
        loop {
            let result = read_buffer.find(delimiter, sanity_limit, false)?;
            if result >= 0 {
                return Ok(result);
            }
            match self.parent().read(&mut read_buffer, self.buffer_size)? {
                0 => {
                    if error_if_missing {
                        return Err(StreamError::UnexpectedEof);
                    }
                    return Ok(result);
                }
                _ => continue,
            }
        }
    }

    fn unread(&self, buffer: &Buffer, len: usize) -> StreamResult<()> {
        debug_assert!(buffer.read_available() >= len);
        let mut data = vec![0; len];
        let copied = buffer.copy_out(&mut data);
        data.truncate(copied);
        self.read_buffer.lock().unwrap().prepend(&data);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::memory::MemoryStream;
    use crate::streams::{get_delimited, Stream};
    use std::sync::Arc;

    #[test]
    fn find_refills_from_the_parent() {
        let parent = Arc::new(MemoryStream::from(b"status line\r\nrest"));
        let buffered = BufferedStream::new(parent, false);
        assert_eq!(11, Stream::find(&buffered, b"\r\n", usize::MAX, true).unwrap());
    }

    #[test]
    fn unread_bytes_come_back_first() {
        let parent = Arc::new(MemoryStream::from(b"body"));
        let buffered = BufferedStream::new(parent, false);
        Stream::unread(&buffered, &Buffer::from(b"head "), 5).unwrap();
        let mut out = Buffer::new();
        Stream::read(&buffered, &mut out, 9).unwrap();
        assert_eq!(out, b"head body" as &[u8]);
    }

    #[test]
    fn small_writes_coalesce_until_flush() {
        let parent = Arc::new(MemoryStream::new());
        let buffered = BufferedStream::new(parent.clone(), false);
        Stream::write(&buffered, &Buffer::from(b"a"), 1).unwrap();
        Stream::write(&buffered, &Buffer::from(b"b"), 1).unwrap();
        assert!(parent.to_vec().is_empty());
        Stream::flush(&buffered, true).unwrap();
        assert_eq!(parent.to_vec(), b"ab");
    }

    #[test]
    fn get_delimited_reads_exactly_one_line() {
        let parent = Arc::new(MemoryStream::from(b"one\ntwo\n"));
        let buffered: Arc<dyn Stream> = Arc::new(BufferedStream::new(parent, false));
        assert_eq!(get_delimited(&*buffered, b"\n", false).unwrap(), b"one\n");
        assert_eq!(get_delimited(&*buffered, b"\n", false).unwrap(), b"two\n");
    }
}
