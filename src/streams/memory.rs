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

//! Random-access stream over an in-memory byte vector.

use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::{Anchor, Stream};

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    pos: usize,
}

/// Seekable in-memory stream. Reads and writes share one cursor; writes
/// overwrite in place and extend past the end.
#[derive(Debug, Default)]
pub struct MemoryStream {
    state: Mutex<MemoryState>,
}

impl MemoryStream {
    pub fn new() -> Self {
        MemoryStream::default()
    }

    pub fn from(data: &[u8]) -> Self {
        MemoryStream {
            state: Mutex::new(MemoryState {
                data: data.to_vec(),
                pos: 0,
            }),
        }
    }

    /// A copy of the entire contents, independent of the cursor.
    pub fn to_vec(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }
}

impl Stream for MemoryStream {
    fn supports_read(&self) -> bool {
        true
    }
    fn supports_write(&self) -> bool {
        true
    }
    fn supports_seek(&self) -> bool {
        true
    }
    fn supports_size(&self) -> bool {
        true
    }
    fn supports_truncate(&self) -> bool {
        true
    }
    fn supports_find(&self) -> bool {
        true
    }
    fn supports_unread(&self) -> bool {
        true
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let mut state = self.state.lock().unwrap();
        let available = state.data.len().saturating_sub(state.pos);
        let take = len.min(available);
        if take > 0 {
            let start = state.pos;
            buffer.copy_in(&state.data[start..start + take]);
            state.pos += take;
        }
        Ok(take)
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        debug_assert!(buffer.read_available() >= len);
        let mut data = vec![0; len];
        let copied = buffer.copy_out(&mut data);
        data.truncate(copied);
        let mut state = self.state.lock().unwrap();
        let pos = state.pos;
        if pos + data.len() > state.data.len() {
            state.data.resize(pos + data.len(), 0);
        }
        state.data[pos..pos + data.len()].copy_from_slice(&data);
        state.pos += data.len();
        Ok(data.len())
    }

    fn seek(&self, offset: i64, anchor: Anchor) -> StreamResult<u64> {
        let mut state = self.state.lock().unwrap();
        let base = match anchor {
            Anchor::Begin => 0,
            Anchor::Current => state.pos as i64,
            Anchor::End => state.data.len() as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(StreamError::Unsupported("seek before start"));
        }
        state.pos = target as usize;
        Ok(state.pos as u64)
    }

    fn size(&self) -> StreamResult<u64> {
        Ok(self.state.lock().unwrap().data.len() as u64)
    }

    fn truncate(&self, size: u64) -> StreamResult<()> {
        let mut state = self.state.lock().unwrap();
        state.data.resize(size as usize, 0);
        Ok(())
    }

    fn find(
        &self,
        delimiter: &[u8],
        sanity_limit: usize,
        error_if_missing: bool,
    ) -> StreamResult<isize> {
        let state = self.state.lock().unwrap();
        let mut window = Buffer::new();
        window.copy_in(&state.data[state.pos.min(state.data.len())..]);
        window.find(delimiter, sanity_limit, error_if_missing)
    }

    fn unread(&self, buffer: &Buffer, len: usize) -> StreamResult<()> {
        debug_assert!(buffer.read_available() >= len);
        let mut data = vec![0; len];
        let copied = buffer.copy_out(&mut data);
        data.truncate(copied);
        let mut state = self.state.lock().unwrap();
        let pos = state.pos;
        state.data.splice(pos..pos, data);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::write_all;

    #[test]
    fn read_after_seek_returns_the_slice() {
        let stream = MemoryStream::from(b"hello world");
        stream.seek(6, Anchor::Begin).unwrap();
        let mut buffer = Buffer::new();
        assert_eq!(5, stream.read(&mut buffer, 16).unwrap());
        assert_eq!(buffer, b"world" as &[u8]);
        assert_eq!(0, stream.read(&mut buffer, 16).unwrap());
    }

    #[test]
    fn write_extends_past_end() {
        let stream = MemoryStream::from(b"abc");
        stream.seek(0, Anchor::End).unwrap();
        write_all(&stream, b"def").unwrap();
        assert_eq!(stream.to_vec(), b"abcdef");
    }

    #[test]
    fn unread_is_served_on_the_next_read() {
        let stream = MemoryStream::from(b"world");
        stream.unread(&Buffer::from(b"hello "), 6).unwrap();
        let mut buffer = Buffer::new();
        stream.read(&mut buffer, 64).unwrap();
        assert_eq!(buffer, b"hello world" as &[u8]);
    }
}
