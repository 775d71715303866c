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

//! Restricts a full-duplex parent to a single direction.

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::filter::{FilterBase, FilterStream};
use super::{CloseType, Stream, StreamHandle};

/// Which direction the singleplex exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleplexType {
    Read,
    Write,
}

/// One direction of a full-duplex parent. Closing only touches the owned
/// direction, using half-close when the parent supports it, so the HTTP
/// engine can tear down one side of a body without killing the transport.
pub struct SingleplexStream {
    base: FilterBase,
    plex: SingleplexType,
}

impl SingleplexStream {
    pub fn new(parent: StreamHandle, plex: SingleplexType, own: bool) -> Self {
        match plex {
            SingleplexType::Read => debug_assert!(parent.supports_read()),
            SingleplexType::Write => debug_assert!(parent.supports_write()),
        }
        SingleplexStream {
            base: FilterBase::new(parent, own),
            plex,
        }
    }
}

impl FilterStream for SingleplexStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn supports_read(&self) -> bool {
        self.plex == SingleplexType::Read
    }

    fn supports_write(&self) -> bool {
        self.plex == SingleplexType::Write
    }

    fn supports_half_close(&self) -> bool {
        false
    }

    fn supports_truncate(&self) -> bool {
        self.plex == SingleplexType::Write && self.parent().supports_truncate()
    }

    fn supports_find(&self) -> bool {
        self.plex == SingleplexType::Read && self.parent().supports_find()
    }

    fn supports_unread(&self) -> bool {
        self.plex == SingleplexType::Read && self.parent().supports_unread()
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        if !self.owns_parent() {
            return Ok(());
        }
        let parent = self.parent();
        match self.plex {
            SingleplexType::Read if close_type.closes_read() => {
                if parent.supports_half_close() {
                    parent.close(CloseType::Read)
                } else {
                    parent.close(CloseType::Both)
                }
            }
            SingleplexType::Write if close_type.closes_write() => {
                if parent.supports_half_close() {
                    parent.close(CloseType::Write)
                } else {
                    parent.close(CloseType::Both)
                }
            }
            _ => Ok(()),
        }
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        if self.plex != SingleplexType::Read {
            return Err(StreamError::Unsupported("read"));
        }
        self.parent().read(buffer, len)
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        if self.plex != SingleplexType::Write {
            return Err(StreamError::Unsupported("write"));
        }
        self.parent().write(buffer, len)
    }

    fn truncate(&self, size: u64) -> StreamResult<()> {
        if self.plex != SingleplexType::Write {
            return Err(StreamError::Unsupported("truncate"));
        }
        self.parent().truncate(size)
    }

    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        if self.plex == SingleplexType::Read {
            return Ok(());
        }
        self.parent().flush(flush_parent)
    }

    fn find(
        &self,
        delimiter: &[u8],
        sanity_limit: usize,
        error_if_missing: bool,
    ) -> StreamResult<isize> {
        if self.plex != SingleplexType::Read {
            return Err(StreamError::Unsupported("find"));
        }
        self.parent().find(delimiter, sanity_limit, error_if_missing)
    }

    fn unread(&self, buffer: &Buffer, len: usize) -> StreamResult<()> {
        if self.plex != SingleplexType::Read {
            return Err(StreamError::Unsupported("unread"));
        }
        self.parent().unread(buffer, len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::pipe::pipe;
    use crate::streams::write_all;

    #[test]
    fn read_singleplex_refuses_writes() {
        let (a, _b) = pipe();
        let plex = SingleplexStream::new(a, SingleplexType::Read, false);
        assert!(Stream::supports_read(&plex));
        assert!(!Stream::supports_write(&plex));
        assert!(matches!(
            Stream::write(&plex, &Buffer::from(b"x"), 1),
            Err(StreamError::Unsupported(_))
        ));
    }

    #[test]
    fn closing_the_write_half_leaves_reads_alive() {
        let (a, b) = pipe();
        write_all(&*a, b"tail").unwrap();
        let write_half = SingleplexStream::new(a.clone(), SingleplexType::Write, true);
        Stream::close(&write_half, CloseType::Both).unwrap();
        // Peer sees EOF after the buffered data.
        let mut buffer = Buffer::new();
        assert_eq!(4, b.read(&mut buffer, 16).unwrap());
        assert_eq!(0, b.read(&mut buffer, 16).unwrap());
        // Our own read half is still usable.
        write_all(&*b, b"back").unwrap();
        let mut buffer = Buffer::new();
        assert_eq!(4, a.read(&mut buffer, 16).unwrap());
    }
}
