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

//! Write-through duplication to several sinks.

use crate::buffer::Buffer;
use crate::error::StreamResult;

use super::{CloseType, Stream, StreamHandle};

/// Every write lands on every sink in order; a write only succeeds once
/// all sinks have accepted it in full.
pub struct TeeStream {
    sinks: Vec<StreamHandle>,
}

impl TeeStream {
    pub fn new(sinks: Vec<StreamHandle>) -> Self {
        debug_assert!(sinks.iter().all(|sink| sink.supports_write()));
        TeeStream { sinks }
    }
}

impl Stream for TeeStream {
    fn supports_write(&self) -> bool {
        true
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        debug_assert!(buffer.read_available() >= len);
        for sink in &self.sinks {
            let mut window = Buffer::new();
            window.copy_in_from(buffer, len);
            while !window.is_empty() {
                let written = sink.write(&window, window.read_available())?;
                window.consume(written);
            }
        }
        Ok(len)
    }

    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        for sink in &self.sinks {
            sink.flush(flush_parent)?;
        }
        Ok(())
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        for sink in &self.sinks {
            sink.close(close_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::memory::MemoryStream;
    use crate::streams::write_all;
    use std::sync::Arc;

    #[test]
    fn writes_reach_every_sink() {
        let first = Arc::new(MemoryStream::new());
        let second = Arc::new(MemoryStream::new());
        let tee = TeeStream::new(vec![first.clone(), second.clone()]);
        write_all(&tee, b"copied").unwrap();
        assert_eq!(first.to_vec(), b"copied");
        assert_eq!(second.to_vec(), b"copied");
    }
}
