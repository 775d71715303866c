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

//! Concatenation of several source streams.

use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::{Anchor, Stream, StreamHandle};

#[derive(Debug)]
struct CatState {
    index: usize,
    pos: u64,
}

/// Reads its members in order, moving to the next on EOF. Seekable when
/// every member supports seek and size.
pub struct CatStream {
    streams: Vec<StreamHandle>,
    seekable: bool,
    size: Option<u64>,
    state: Mutex<CatState>,
}

impl CatStream {
    pub fn new(streams: Vec<StreamHandle>) -> Self {
        let mut seekable = true;
        let mut size = Some(0u64);
        for stream in &streams {
            if !stream.supports_seek() {
                seekable = false;
            }
            match (size, stream.supports_size()) {
                (Some(total), true) => match stream.size() {
                    Ok(len) => size = Some(total + len),
                    Err(_) => {
                        seekable = false;
                        size = None;
                    }
                },
                _ => {
                    seekable = false;
                    size = None;
                }
            }
        }
        CatStream {
            streams,
            seekable,
            size,
            state: Mutex::new(CatState { index: 0, pos: 0 }),
        }
    }
}

impl Stream for CatStream {
    fn supports_read(&self) -> bool {
        true
    }
    fn supports_seek(&self) -> bool {
        self.seekable
    }
    fn supports_size(&self) -> bool {
        self.size.is_some()
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        debug_assert!(len != 0);
        let mut state = self.state.lock().unwrap();
        loop {
            let Some(stream) = self.streams.get(state.index) else {
                return Ok(0);
            };
            let result = stream.read(buffer, len)?;
            if result == 0 {
                state.index += 1;
                if let Some(next) = self.streams.get(state.index) {
                    if next.supports_seek() {
                        next.seek(0, Anchor::Begin)?;
                    }
                }
                continue;
            }
            state.pos += result as u64;
            return Ok(result);
        }
    }

    fn seek(&self, offset: i64, anchor: Anchor) -> StreamResult<u64> {
        let mut state = self.state.lock().unwrap();
        if offset == 0 && anchor == Anchor::Current {
            return Ok(state.pos);
        }
        if !self.seekable {
            return Err(StreamError::Unsupported("seek"));
        }
        let size = self.size.expect("seekable implies sized");
        let base = match anchor {
            Anchor::Begin => 0,
            Anchor::Current => state.pos as i64,
            Anchor::End => size as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(StreamError::Unsupported("seek before start"));
        }
        let mut target = target as u64;
        state.pos = target;
        let mut index = 0;
        for stream in &self.streams {
            let len = stream.size()?;
            if target < len || target == len && index + 1 == self.streams.len() {
                stream.seek(target as i64, Anchor::Begin)?;
                break;
            }
            target -= len;
            index += 1;
        }
        state.index = index;
        Ok(state.pos)
    }

    fn size(&self) -> StreamResult<u64> {
        self.size.ok_or(StreamError::Unsupported("size"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::memory::MemoryStream;
    use crate::streams::transfer_all;
    use std::sync::Arc;

    #[test]
    fn reads_members_in_order() {
        let cat = CatStream::new(vec![
            Arc::new(MemoryStream::from(b"hello ")),
            Arc::new(MemoryStream::from(b"world")),
        ]);
        let out = MemoryStream::new();
        assert_eq!(11, transfer_all(&cat, &out).unwrap());
        assert_eq!(out.to_vec(), b"hello world");
    }

    #[test]
    fn size_is_the_sum_of_members() {
        let cat = CatStream::new(vec![
            Arc::new(MemoryStream::from(b"abc")),
            Arc::new(MemoryStream::from(b"defg")),
        ]);
        assert_eq!(7, cat.size().unwrap());
    }

    #[test]
    fn seek_lands_in_the_right_member() {
        let cat = CatStream::new(vec![
            Arc::new(MemoryStream::from(b"abc")),
            Arc::new(MemoryStream::from(b"defg")),
        ]);
        cat.seek(4, Anchor::Begin).unwrap();
        let mut buffer = Buffer::new();
        cat.read(&mut buffer, 16).unwrap();
        assert_eq!(buffer, b"efg" as &[u8]);
    }
}
