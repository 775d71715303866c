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

//! RFC 7230 chunked transfer coding.
//!
//! Reading decodes hex-prefixed chunks and stops at the zero-size
//! terminator, leaving any trailer on the parent for the header parser.
//! Writing emits one chunk per `write` call and the zero terminator on
//! close; the trailer is the HTTP engine's responsibility.

use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::error::{ChunkPart, StreamError, StreamResult};
use crate::streams::filter::{FilterBase, FilterStream};
use crate::streams::{get_delimited, write_all, CloseType, StreamHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    NeedHeader,
    InChunk(u64),
    NeedFooter,
    Eof,
}

pub struct ChunkedStream {
    base: FilterBase,
    state: Mutex<ReadState>,
}

impl ChunkedStream {
    /// The parent must support `find` on the read side; the connection
    /// layer guarantees that by buffering the transport.
    pub fn new(parent: StreamHandle, own: bool) -> Self {
        debug_assert!(!parent.supports_read() || parent.supports_find());
        ChunkedStream {
            base: FilterBase::new(parent, own),
            state: Mutex::new(ReadState::NeedHeader),
        }
    }

    fn read_chunk_header(&self) -> StreamResult<u64> {
        let line = get_delimited(&*self.parent(), b"\n", false)?;
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        let digits = trimmed
            .split(';')
            .next()
            .expect("split yields at least one element")
            .trim();
        if digits.is_empty() {
            return Err(StreamError::InvalidChunk {
                part: ChunkPart::Header,
                line: trimmed.to_string(),
            });
        }
        u64::from_str_radix(digits, 16).map_err(|_| StreamError::InvalidChunk {
            part: ChunkPart::Header,
            line: trimmed.to_string(),
        })
    }

    fn read_chunk_footer(&self) -> StreamResult<()> {
        let line = get_delimited(&*self.parent(), b"\n", false)?;
        if line != b"\r\n" && line != b"\n" {
            return Err(StreamError::InvalidChunk {
                part: ChunkPart::Footer,
                line: String::from_utf8_lossy(&line).trim_end().to_string(),
            });
        }
        Ok(())
    }
}

impl FilterStream for ChunkedStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn mutates(&self) -> bool {
        true
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                ReadState::Eof => return Ok(0),
                ReadState::NeedHeader => {
                    let size = self.read_chunk_header()?;
                    *state = if size == 0 {
                        ReadState::Eof
                    } else {
                        ReadState::InChunk(size)
                    };
                }
                ReadState::NeedFooter => {
                    self.read_chunk_footer()?;
                    *state = ReadState::NeedHeader;
                }
                ReadState::InChunk(remaining) => {
                    let want = len.min(remaining.min(usize::MAX as u64) as usize);
                    let read = self.parent().read(buffer, want)?;
                    if read == 0 {
                        return Err(StreamError::UnexpectedEof);
                    }
                    let remaining = remaining - read as u64;
                    *state = if remaining == 0 {
                        ReadState::NeedFooter
                    } else {
                        ReadState::InChunk(remaining)
                    };
                    return Ok(read);
                }
            }
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        debug_assert!(len != 0);
        let parent = self.parent();
        write_all(&*parent, format!("{len:x}\r\n").as_bytes())?;
        let mut window = Buffer::new();
        window.copy_in_from(buffer, len);
        while !window.is_empty() {
            let written = parent.write(&window, window.read_available())?;
            window.consume(written);
        }
        write_all(&*parent, b"\r\n")?;
        Ok(len)
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        if close_type.closes_write() && self.parent().supports_write() {
            write_all(&*self.parent(), b"0\r\n")?;
        }
        if self.owns_parent() {
            self.parent().close(close_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::buffered::BufferedStream;
    use crate::streams::memory::MemoryStream;
    use crate::streams::singleplex::{SingleplexStream, SingleplexType};
    use crate::streams::Stream;
    use std::sync::Arc;

    fn reader(input: &[u8]) -> (Arc<MemoryStream>, ChunkedStream) {
        let memory = Arc::new(MemoryStream::from(input));
        let buffered = Arc::new(BufferedStream::new(memory.clone(), false));
        (memory, ChunkedStream::new(buffered, false))
    }

    #[test]
    fn decodes_a_single_chunk_to_eof() {
        let (memory, chunked) = reader(b"a\r\nhelloworld\r\n0\r\n");
        let mut out = Buffer::new();
        let mut total = 0;
        loop {
            let read = Stream::read(&chunked, &mut out, 4).unwrap();
            if read == 0 {
                break;
            }
            total += read;
        }
        assert_eq!(10, total);
        assert_eq!(out, b"helloworld" as &[u8]);
        // The terminator line is consumed; nothing beyond it.
        assert_eq!(18, memory.seek(0, crate::streams::Anchor::Current).unwrap());
    }

    #[test]
    fn decodes_chunk_extensions() {
        let (_memory, chunked) = reader(b"5;ext=1\r\nhello\r\n0\r\n");
        let mut out = Buffer::new();
        while Stream::read(&chunked, &mut out, 64).unwrap() > 0 {}
        assert_eq!(out, b"hello" as &[u8]);
    }

    #[test]
    fn invalid_hex_is_an_invalid_chunk_header() {
        let (_memory, chunked) = reader(b"zz\r\nhello\r\n");
        let mut out = Buffer::new();
        match Stream::read(&chunked, &mut out, 64) {
            Err(StreamError::InvalidChunk {
                part: ChunkPart::Header,
                line,
            }) => assert_eq!("zz", line),
            other => panic!("expected invalid chunk header, got {other:?}"),
        }
    }

    #[test]
    fn missing_footer_is_an_invalid_chunk_footer() {
        let (_memory, chunked) = reader(b"5\r\nhelloXX\r\n0\r\n");
        let mut out = Buffer::new();
        Stream::read(&chunked, &mut out, 64).unwrap();
        assert!(matches!(
            Stream::read(&chunked, &mut out, 64),
            Err(StreamError::InvalidChunk {
                part: ChunkPart::Footer,
                ..
            })
        ));
    }

    #[test]
    fn encodes_one_chunk_per_write_and_terminates_on_close() {
        let memory = Arc::new(MemoryStream::new());
        let write_half = Arc::new(SingleplexStream::new(
            memory.clone(),
            SingleplexType::Write,
            false,
        ));
        let chunked = ChunkedStream::new(write_half, false);
        assert_eq!(5, Stream::write(&chunked, &Buffer::from(b"hello"), 5).unwrap());
        assert_eq!(
            10,
            Stream::write(&chunked, &Buffer::from(b"helloworld"), 10).unwrap()
        );
        Stream::close(&chunked, CloseType::Both).unwrap();
        assert_eq!(memory.to_vec(), b"5\r\nhello\r\na\r\nhelloworld\r\n0\r\n");
    }

    #[test]
    fn round_trip() {
        let transport = Arc::new(MemoryStream::new());
        let write_half = Arc::new(SingleplexStream::new(
            transport.clone(),
            SingleplexType::Write,
            false,
        ));
        let encoder = ChunkedStream::new(write_half, false);
        Stream::write(&encoder, &Buffer::from(b"first piece "), 12).unwrap();
        Stream::write(&encoder, &Buffer::from(b"second piece"), 12).unwrap();
        Stream::close(&encoder, CloseType::Both).unwrap();

        transport.seek(0, crate::streams::Anchor::Begin).unwrap();
        let buffered = Arc::new(BufferedStream::new(transport, false));
        let decoder = ChunkedStream::new(buffered, false);
        let mut out = Buffer::new();
        while Stream::read(&decoder, &mut out, 7).unwrap() > 0 {}
        assert_eq!(out, b"first piece second piece" as &[u8]);
    }
}
