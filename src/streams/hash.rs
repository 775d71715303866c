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

//! Transparent rolling digests over a stream.
//!
//! Every byte read from or written through the stream updates the digest;
//! [`HashStream::hash`] snapshots it at any point without disturbing the
//! running context, and [`HashStream::context`] captures a resumable copy
//! for carrying the digest across stream stacks.

use std::sync::Mutex;

use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::{Sha224, Sha256};

use crate::buffer::Buffer;
use crate::error::StreamResult;

use super::filter::{FilterBase, FilterStream};
use super::{Anchor, StreamHandle};

/// A resumable digest context.
pub trait HashContext: Send {
    fn update(&mut self, data: &[u8]);
    /// Digest over everything seen so far, in binary; the context keeps
    /// rolling.
    fn snapshot(&self) -> Vec<u8>;
    fn reset(&mut self);
    fn boxed_clone(&self) -> Box<dyn HashContext>;
}

struct DigestContext<D: Digest + Clone + Send + 'static>(D);

impl<D: Digest + Clone + Send + 'static> HashContext for DigestContext<D> {
    fn update(&mut self, data: &[u8]) {
        Digest::update(&mut self.0, data);
    }

    fn snapshot(&self) -> Vec<u8> {
        self.0.clone().finalize().to_vec()
    }

    fn reset(&mut self) {
        self.0 = D::new();
    }

    fn boxed_clone(&self) -> Box<dyn HashContext> {
        Box::new(DigestContext(self.0.clone()))
    }
}

struct Crc32Context(crc32fast::Hasher);

impl HashContext for Crc32Context {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn snapshot(&self) -> Vec<u8> {
        self.0.clone().finalize().to_be_bytes().to_vec()
    }

    fn reset(&mut self) {
        self.0 = crc32fast::Hasher::new();
    }

    fn boxed_clone(&self) -> Box<dyn HashContext> {
        Box::new(Crc32Context(self.0.clone()))
    }
}

pub struct HashStream {
    base: FilterBase,
    context: Mutex<Box<dyn HashContext>>,
}

impl HashStream {
    pub fn md5(parent: StreamHandle, own: bool) -> Self {
        HashStream::with_context(parent, own, Box::new(DigestContext(Md5::new())))
    }

    pub fn sha1(parent: StreamHandle, own: bool) -> Self {
        HashStream::with_context(parent, own, Box::new(DigestContext(Sha1::new())))
    }

    pub fn sha224(parent: StreamHandle, own: bool) -> Self {
        HashStream::with_context(parent, own, Box::new(DigestContext(Sha224::new())))
    }

    pub fn sha256(parent: StreamHandle, own: bool) -> Self {
        HashStream::with_context(parent, own, Box::new(DigestContext(Sha256::new())))
    }

    pub fn crc32(parent: StreamHandle, own: bool) -> Self {
        HashStream::with_context(
            parent,
            own,
            Box::new(Crc32Context(crc32fast::Hasher::new())),
        )
    }

    /// Resumes from a previously captured context.
    pub fn with_context(parent: StreamHandle, own: bool, context: Box<dyn HashContext>) -> Self {
        HashStream {
            base: FilterBase::new(parent, own),
            context: Mutex::new(context),
        }
    }

    /// The digest in binary over everything seen so far.
    pub fn hash(&self) -> Vec<u8> {
        self.context.lock().unwrap().snapshot()
    }

    /// The digest as lowercase hex.
    pub fn hash_hex(&self) -> String {
        self.hash()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    /// A resumable copy of the rolling context.
    pub fn context(&self) -> Box<dyn HashContext> {
        self.context.lock().unwrap().boxed_clone()
    }

    pub fn reset(&self) {
        self.context.lock().unwrap().reset();
    }
}

impl FilterStream for HashStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn supports_seek(&self) -> bool {
        false
    }

    fn supports_truncate(&self) -> bool {
        false
    }

    fn supports_unread(&self) -> bool {
        false
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let mut staged = Buffer::new();
        let read = self.parent().read(&mut staged, len)?;
        {
            let mut context = self.context.lock().unwrap();
            for slice in staged.read_buffers() {
                context.update(slice);
            }
        }
        buffer.copy_in_from(&staged, read);
        Ok(read)
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        let written = self.parent().write(buffer, len)?;
        let mut context = self.context.lock().unwrap();
        let mut remaining = written;
        for slice in buffer.read_buffers() {
            if remaining == 0 {
                break;
            }
            let take = slice.len().min(remaining);
            context.update(&slice[..take]);
            remaining -= take;
        }
        Ok(written)
    }

    fn seek(&self, _offset: i64, _anchor: Anchor) -> StreamResult<u64> {
        Err(crate::error::StreamError::Unsupported("seek"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::memory::MemoryStream;
    use crate::streams::{transfer_all, write_all};
    use std::sync::Arc;

    #[test]
    fn md5_matches_known_vector() {
        let parent = Arc::new(MemoryStream::new());
        let hash = HashStream::md5(parent, false);
        write_all(&hash, b"abc").unwrap();
        assert_eq!("900150983cd24fb0d6963f7d28e17f72", hash.hash_hex());
    }

    #[test]
    fn sha256_matches_known_vector() {
        let parent = Arc::new(MemoryStream::new());
        let hash = HashStream::sha256(parent, false);
        write_all(&hash, b"abc").unwrap();
        assert_eq!(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            hash.hash_hex()
        );
    }

    #[test]
    fn crc32_matches_known_vector() {
        let parent = Arc::new(MemoryStream::new());
        let hash = HashStream::crc32(parent, false);
        write_all(&hash, b"123456789").unwrap();
        assert_eq!("cbf43926", hash.hash_hex());
    }

    #[test]
    fn reads_update_the_same_digest_as_writes() {
        let source = Arc::new(MemoryStream::from(b"the quick brown fox"));
        let reading = HashStream::sha1(source, false);
        let sink = Arc::new(MemoryStream::new());
        transfer_all(&reading, &*sink).unwrap();

        let writing = HashStream::sha1(Arc::new(MemoryStream::new()), false);
        write_all(&writing, b"the quick brown fox").unwrap();

        assert_eq!(reading.hash(), writing.hash());
    }

    #[test]
    fn context_resumes_across_streams() {
        let first = HashStream::sha256(Arc::new(MemoryStream::new()), false);
        write_all(&first, b"hello ").unwrap();
        let resumed =
            HashStream::with_context(Arc::new(MemoryStream::new()), false, first.context());
        write_all(&resumed, b"world").unwrap();

        let whole = HashStream::sha256(Arc::new(MemoryStream::new()), false);
        write_all(&whole, b"hello world").unwrap();
        assert_eq!(whole.hash(), resumed.hash());
    }

    #[test]
    fn snapshot_does_not_disturb_the_rolling_context() {
        let hash = HashStream::md5(Arc::new(MemoryStream::new()), false);
        write_all(&hash, b"ab").unwrap();
        let _ = hash.hash();
        write_all(&hash, b"c").unwrap();
        assert_eq!("900150983cd24fb0d6963f7d28e17f72", hash.hash_hex());
    }
}
