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

//! Empty source / infinite sink.

use std::sync::{Arc, OnceLock};

use crate::buffer::Buffer;
use crate::error::StreamResult;

use super::{Anchor, Stream, StreamHandle};

/// Reads EOF immediately, swallows all writes.
#[derive(Debug, Default)]
pub struct NullStream;

impl NullStream {
    /// The process-wide shared instance.
    pub fn handle() -> StreamHandle {
        static INSTANCE: OnceLock<StreamHandle> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(NullStream)).clone()
    }
}

impl Stream for NullStream {
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

    fn read(&self, _buffer: &mut Buffer, _len: usize) -> StreamResult<usize> {
        Ok(0)
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        debug_assert!(buffer.read_available() >= len);
        Ok(len)
    }

    fn seek(&self, _offset: i64, _anchor: Anchor) -> StreamResult<u64> {
        Ok(0)
    }

    fn size(&self) -> StreamResult<u64> {
        Ok(0)
    }
}
