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

//! Byte-oriented streams and their filters.
//!
//! [`Stream`] is the contract everything composes over. A stream advertises
//! which operations it supports; calling an unadvertised operation fails
//! with `Unsupported`. Streams are shared as [`StreamHandle`]s; a stream
//! must not be used concurrently by more than one fiber in the same
//! direction, but the read and write halves of a full-duplex stream may be
//! driven by two fibers. `cancel_read`/`cancel_write` are the only
//! operations safe to call from any fiber at any time.
//!
//! On error, no bytes are considered transferred by the failing call; a
//! return of 0 from `read` is the sole EOF indicator, and `write` never
//! returns 0.

pub mod buffered;
pub mod cat;
pub mod crypto;
pub mod file;
pub mod filter;
pub mod hash;
pub mod limited;
pub mod memory;
pub mod notify;
pub mod null;
pub mod pipe;
pub mod random;
pub mod singleplex;
pub mod socket;
pub mod tee;
pub mod throttle;
pub mod timeout;
pub mod tls;
pub mod zero;
pub mod zlib;

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

/// Which end of a stream to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Further reads fail; the peer's writes fail.
    Read,
    /// Further writes fail; the peer reads EOF.
    Write,
    /// Both directions.
    Both,
}

impl CloseType {
    #[inline]
    pub fn closes_read(self) -> bool {
        matches!(self, CloseType::Read | CloseType::Both)
    }

    #[inline]
    pub fn closes_write(self) -> bool {
        matches!(self, CloseType::Write | CloseType::Both)
    }
}

/// Where to seek from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Begin,
    Current,
    End,
}

/// Shared handle to a stream.
pub type StreamHandle = Arc<dyn Stream>;

/// The byte-stream contract.
pub trait Stream: Send + Sync {
    fn supports_half_close(&self) -> bool {
        false
    }
    fn supports_read(&self) -> bool {
        false
    }
    fn supports_write(&self) -> bool {
        false
    }
    fn supports_seek(&self) -> bool {
        false
    }
    fn supports_tell(&self) -> bool {
        self.supports_seek()
    }
    fn supports_size(&self) -> bool {
        false
    }
    fn supports_truncate(&self) -> bool {
        false
    }
    fn supports_find(&self) -> bool {
        false
    }
    fn supports_unread(&self) -> bool {
        false
    }

    /// Gracefully closes the stream. Safe to call repeatedly. `Read` or
    /// `Write` alone requires `supports_half_close`.
    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        let _ = close_type;
        Ok(())
    }

    /// Reads up to `len` bytes, appending them to `buffer`'s read region.
    /// May return fewer; 0 means EOF.
    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let _ = (buffer, len);
        Err(StreamError::Unsupported("read"))
    }

    /// Aborts a read blocked in another fiber with `OperationAborted`.
    /// Safe (and a no-op) on streams that do not block.
    fn cancel_read(&self) {}

    /// Writes up to `len` bytes from the head of `buffer`'s read region
    /// (without consuming them). Returns at least 1 on success.
    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        let _ = (buffer, len);
        Err(StreamError::Unsupported("write"))
    }

    /// Aborts a write blocked in another fiber with `OperationAborted`.
    fn cancel_write(&self) {}

    fn seek(&self, offset: i64, anchor: Anchor) -> StreamResult<u64> {
        let _ = (offset, anchor);
        Err(StreamError::Unsupported("seek"))
    }

    fn tell(&self) -> StreamResult<u64> {
        self.seek(0, Anchor::Current)
    }

    fn size(&self) -> StreamResult<u64> {
        Err(StreamError::Unsupported("size"))
    }

    fn truncate(&self, size: u64) -> StreamResult<()> {
        let _ = size;
        Err(StreamError::Unsupported("truncate"))
    }

    /// Pushes internal buffers down to the underlying implementation.
    /// Always safe to call.
    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        let _ = flush_parent;
        Ok(())
    }

    /// Looks ahead for `delimiter` without consuming. Returns the offset
    /// from the current position; see [`Buffer::find`] for the not-found
    /// and sanity-limit behavior.
    fn find(
        &self,
        delimiter: &[u8],
        sanity_limit: usize,
        error_if_missing: bool,
    ) -> StreamResult<isize> {
        let _ = (delimiter, sanity_limit, error_if_missing);
        Err(StreamError::Unsupported("find"))
    }

    /// Returns data to the stream to be read again.
    fn unread(&self, buffer: &Buffer, len: usize) -> StreamResult<()> {
        let _ = (buffer, len);
        Err(StreamError::Unsupported("unread"))
    }
}

/// Writes all of `data`, looping over short writes.
pub fn write_all(stream: &dyn Stream, data: &[u8]) -> StreamResult<()> {
    let mut buffer = Buffer::from(data);
    while !buffer.is_empty() {
        let written = stream.write(&buffer, buffer.read_available())?;
        debug_assert!(written > 0, "write returned 0");
        buffer.consume(written);
    }
    Ok(())
}

/// Reads exactly `len` bytes into `buffer`, failing with `UnexpectedEof`
/// on a short stream.
pub fn read_exact(stream: &dyn Stream, buffer: &mut Buffer, len: usize) -> StreamResult<()> {
    let mut remaining = len;
    while remaining > 0 {
        let read = stream.read(buffer, remaining)?;
        if read == 0 {
            return Err(StreamError::UnexpectedEof);
        }
        remaining -= read;
    }
    Ok(())
}

/// Reads up to and including `delimiter`, returning the bytes consumed.
/// With `eof_is_delimiter`, a stream ending first returns the remainder
/// instead of failing.
pub fn get_delimited(
    stream: &dyn Stream,
    delimiter: &[u8],
    eof_is_delimiter: bool,
) -> StreamResult<Vec<u8>> {
    let offset = stream.find(delimiter, usize::MAX, !eof_is_delimiter)?;
    let take = if offset >= 0 {
        offset as usize + delimiter.len()
    } else {
        (-offset - 1) as usize
    };
    let mut buffer = Buffer::new();
    read_exact(stream, &mut buffer, take)?;
    Ok(buffer.to_vec())
}

const TRANSFER_CHUNK: usize = 64 * 1024;

/// Pumps `src` into `dst` until EOF, returning the bytes moved.
pub fn transfer_all(src: &dyn Stream, dst: &dyn Stream) -> StreamResult<u64> {
    let mut total = 0;
    let mut shuttle = Buffer::new();
    loop {
        let read = src.read(&mut shuttle, TRANSFER_CHUNK)?;
        if read == 0 {
            return Ok(total);
        }
        while !shuttle.is_empty() {
            let written = dst.write(&shuttle, shuttle.read_available())?;
            shuttle.consume(written);
        }
        total += read as u64;
    }
}

/// Pumps exactly `len` bytes from `src` into `dst`, failing with
/// `UnexpectedEof` if the source ends early.
pub fn transfer(src: &dyn Stream, dst: &dyn Stream, len: u64) -> StreamResult<u64> {
    let mut remaining = len;
    let mut shuttle = Buffer::new();
    while remaining > 0 {
        let want = TRANSFER_CHUNK.min(remaining.min(usize::MAX as u64) as usize);
        let read = src.read(&mut shuttle, want)?;
        if read == 0 {
            return Err(StreamError::UnexpectedEof);
        }
        while !shuttle.is_empty() {
            let written = dst.write(&shuttle, shuttle.read_available())?;
            shuttle.consume(written);
        }
        remaining -= read as u64;
    }
    Ok(len)
}

#[cfg(test)]
mod test {
    use super::memory::MemoryStream;
    use super::null::NullStream;
    use super::*;

    #[test]
    fn write_all_loops_over_short_writes() {
        let stream = MemoryStream::new();
        write_all(&stream, b"hello world").unwrap();
        assert_eq!(stream.to_vec(), b"hello world");
    }

    #[test]
    fn transfer_all_moves_everything() {
        let src = MemoryStream::from(b"some bytes to move");
        let dst = MemoryStream::new();
        let moved = transfer_all(&src, &dst).unwrap();
        assert_eq!(18, moved);
        assert_eq!(dst.to_vec(), b"some bytes to move");
    }

    #[test]
    fn bounded_transfer_fails_on_short_source() {
        let src = MemoryStream::from(b"short");
        let dst = NullStream::handle();
        assert!(matches!(
            transfer(&src, &*dst, 100),
            Err(StreamError::UnexpectedEof)
        ));
    }

    #[test]
    fn get_delimited_includes_the_delimiter() {
        let src = MemoryStream::from(b"a line\nrest");
        let line = get_delimited(&src, b"\n", false).unwrap();
        assert_eq!(line, b"a line\n");
    }
}
