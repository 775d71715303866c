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

//! Random-access stream over a file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::buffer::Buffer;
use crate::error::StreamResult;

use super::{Anchor, Stream};

pub struct FileStream {
    file: File,
    readable: bool,
    writable: bool,
}

impl FileStream {
    pub fn open<P: AsRef<Path>>(path: P) -> StreamResult<Self> {
        Ok(FileStream {
            file: File::open(path)?,
            readable: true,
            writable: false,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P) -> StreamResult<Self> {
        Ok(FileStream {
            file: OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
            readable: true,
            writable: true,
        })
    }

    pub fn from_file(file: File, readable: bool, writable: bool) -> Self {
        FileStream {
            file,
            readable,
            writable,
        }
    }
}

impl Stream for FileStream {
    fn supports_read(&self) -> bool {
        self.readable
    }
    fn supports_write(&self) -> bool {
        self.writable
    }
    fn supports_seek(&self) -> bool {
        true
    }
    fn supports_size(&self) -> bool {
        true
    }
    fn supports_truncate(&self) -> bool {
        self.writable
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let read = (&self.file).read(buffer.write_slice(len))?;
        buffer.produce(read);
        Ok(read)
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        let slice = buffer
            .read_buffers()
            .next()
            .expect("write of empty buffer");
        let take = slice.len().min(len);
        let written = (&self.file).write(&slice[..take])?;
        Ok(written)
    }

    fn seek(&self, offset: i64, anchor: Anchor) -> StreamResult<u64> {
        let from = match anchor {
            Anchor::Begin => SeekFrom::Start(offset as u64),
            Anchor::Current => SeekFrom::Current(offset),
            Anchor::End => SeekFrom::End(offset),
        };
        Ok((&self.file).seek(from)?)
    }

    fn size(&self) -> StreamResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, size: u64) -> StreamResult<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn flush(&self, _flush_parent: bool) -> StreamResult<()> {
        (&self.file).flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::write_all;

    #[test]
    fn create_write_reopen_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        {
            let file = FileStream::create(&path).unwrap();
            write_all(&file, b"file stream payload").unwrap();
            file.flush(true).unwrap();
        }
        let file = FileStream::open(&path).unwrap();
        assert_eq!(19, file.size().unwrap());
        let mut buffer = Buffer::new();
        file.read(&mut buffer, 64).unwrap();
        assert_eq!(buffer, b"file stream payload" as &[u8]);
    }

    #[test]
    fn truncate_shrinks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        let file = FileStream::create(&path).unwrap();
        write_all(&file, b"0123456789").unwrap();
        file.truncate(4).unwrap();
        assert_eq!(4, file.size().unwrap());
    }
}
