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

//! Streaming deflate/gzip/zlib coding.
//!
//! A read-direction stream decodes compressed bytes pulled from the
//! parent; a write-direction stream encodes plaintext pushed through it
//! and emits the trailer on close. The direction is inferred from the
//! parent's capabilities when unambiguous.

use std::io::Write as _;
use std::sync::Mutex;

use flate2::write::{
    DeflateDecoder, DeflateEncoder, GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder,
};
use flate2::Compression;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::filter::{FilterBase, FilterStream};
use super::{CloseType, StreamHandle};

const CHUNK: usize = 16 * 1024;

/// The wrapped wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZlibFormat {
    /// RFC 1950 zlib wrapper; the HTTP `deflate` coding.
    Zlib,
    /// RFC 1952 gzip wrapper; the HTTP `gzip` and `x-gzip` codings.
    Gzip,
    /// Raw RFC 1951 deflate, no wrapper.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZlibDirection {
    /// Decode while reading from the parent.
    Read,
    /// Encode while writing to the parent.
    Write,
}

enum Codec {
    ZlibEncode(ZlibEncoder<Vec<u8>>),
    GzipEncode(GzEncoder<Vec<u8>>),
    RawEncode(DeflateEncoder<Vec<u8>>),
    ZlibDecode(ZlibDecoder<Vec<u8>>),
    GzipDecode(GzDecoder<Vec<u8>>),
    RawDecode(DeflateDecoder<Vec<u8>>),
}

impl Codec {
    fn new(format: ZlibFormat, direction: ZlibDirection) -> Codec {
        let level = Compression::default();
        match (format, direction) {
            (ZlibFormat::Zlib, ZlibDirection::Write) => {
                Codec::ZlibEncode(ZlibEncoder::new(Vec::new(), level))
            }
            (ZlibFormat::Gzip, ZlibDirection::Write) => {
                Codec::GzipEncode(GzEncoder::new(Vec::new(), level))
            }
            (ZlibFormat::Raw, ZlibDirection::Write) => {
                Codec::RawEncode(DeflateEncoder::new(Vec::new(), level))
            }
            (ZlibFormat::Zlib, ZlibDirection::Read) => {
                Codec::ZlibDecode(ZlibDecoder::new(Vec::new()))
            }
            (ZlibFormat::Gzip, ZlibDirection::Read) => Codec::GzipDecode(GzDecoder::new(Vec::new())),
            (ZlibFormat::Raw, ZlibDirection::Read) => {
                Codec::RawDecode(DeflateDecoder::new(Vec::new()))
            }
        }
    }

    fn push(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Codec::ZlibEncode(codec) => codec.write_all(data),
            Codec::GzipEncode(codec) => codec.write_all(data),
            Codec::RawEncode(codec) => codec.write_all(data),
            Codec::ZlibDecode(codec) => codec.write_all(data),
            Codec::GzipDecode(codec) => codec.write_all(data),
            Codec::RawDecode(codec) => codec.write_all(data),
        }
    }

    fn sync_flush(&mut self) -> std::io::Result<()> {
        match self {
            Codec::ZlibEncode(codec) => codec.flush(),
            Codec::GzipEncode(codec) => codec.flush(),
            Codec::RawEncode(codec) => codec.flush(),
            Codec::ZlibDecode(codec) => codec.flush(),
            Codec::GzipDecode(codec) => codec.flush(),
            Codec::RawDecode(codec) => codec.flush(),
        }
    }

    fn take_output(&mut self) -> Vec<u8> {
        match self {
            Codec::ZlibEncode(codec) => std::mem::take(codec.get_mut()),
            Codec::GzipEncode(codec) => std::mem::take(codec.get_mut()),
            Codec::RawEncode(codec) => std::mem::take(codec.get_mut()),
            Codec::ZlibDecode(codec) => std::mem::take(codec.get_mut()),
            Codec::GzipDecode(codec) => std::mem::take(codec.get_mut()),
            Codec::RawDecode(codec) => std::mem::take(codec.get_mut()),
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Codec::ZlibEncode(codec) => codec.finish(),
            Codec::GzipEncode(codec) => codec.finish(),
            Codec::RawEncode(codec) => codec.finish(),
            Codec::ZlibDecode(codec) => codec.finish(),
            Codec::GzipDecode(codec) => codec.finish(),
            Codec::RawDecode(codec) => codec.finish(),
        }
    }
}

struct ZlibState {
    codec: Option<Codec>,
    pending: Buffer,
    eof: bool,
    produced_any: bool,
}

pub struct ZlibStream {
    base: FilterBase,
    format: ZlibFormat,
    direction: ZlibDirection,
    state: Mutex<ZlibState>,
}

impl ZlibStream {
    /// RFC 1950 zlib coding (the HTTP `deflate` transfer coding).
    pub fn zlib(parent: StreamHandle, own: bool) -> Self {
        let direction = infer_direction(&parent);
        ZlibStream::with_direction(parent, own, ZlibFormat::Zlib, direction)
    }

    /// RFC 1952 gzip coding.
    pub fn gzip(parent: StreamHandle, own: bool) -> Self {
        let direction = infer_direction(&parent);
        ZlibStream::with_direction(parent, own, ZlibFormat::Gzip, direction)
    }

    /// Raw deflate, no wrapper.
    pub fn raw_deflate(parent: StreamHandle, own: bool) -> Self {
        let direction = infer_direction(&parent);
        ZlibStream::with_direction(parent, own, ZlibFormat::Raw, direction)
    }

    pub fn with_direction(
        parent: StreamHandle,
        own: bool,
        format: ZlibFormat,
        direction: ZlibDirection,
    ) -> Self {
        ZlibStream {
            base: FilterBase::new(parent, own),
            format,
            direction,
            state: Mutex::new(ZlibState {
                codec: Some(Codec::new(format, direction)),
                pending: Buffer::new(),
                eof: false,
                produced_any: false,
            }),
        }
    }

    fn map_decode_error(&self, err: std::io::Error, produced_any: bool) -> StreamError {
        let message = err.to_string();
        if message.contains("dictionary") {
            return StreamError::NeedPresetDictionary;
        }
        if !produced_any {
            return StreamError::UnknownFormat;
        }
        StreamError::Corrupted
    }
}

fn infer_direction(parent: &StreamHandle) -> ZlibDirection {
    if parent.supports_read() && !parent.supports_write() {
        ZlibDirection::Read
    } else if parent.supports_write() && !parent.supports_read() {
        ZlibDirection::Write
    } else {
        // Full-duplex parents are ambiguous; HTTP always singleplexes
        // before stacking codings.
        ZlibDirection::Read
    }
}

impl FilterStream for ZlibStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn mutates(&self) -> bool {
        true
    }

    fn supports_read(&self) -> bool {
        self.direction == ZlibDirection::Read
    }

    fn supports_write(&self) -> bool {
        self.direction == ZlibDirection::Write
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        if self.direction != ZlibDirection::Read {
            return Err(StreamError::Unsupported("read"));
        }
        let mut state = self.state.lock().unwrap();
        loop {
            if !state.pending.is_empty() {
                let take = state.pending.read_available().min(len);
                buffer.copy_in_from(&state.pending, take);
                state.pending.consume(take);
                return Ok(take);
            }
            if state.eof {
                return Ok(0);
            }
            let mut compressed = Buffer::new();
            let read = self.parent().read(&mut compressed, CHUNK)?;
            let produced_any = state.produced_any;
            if read == 0 {
                let codec = state.codec.take().expect("codec already finished");
                let remainder = codec
                    .finish()
                    .map_err(|err| self.map_decode_error(err, produced_any))?;
                state.eof = true;
                state.pending.copy_in(&remainder);
                continue;
            }
            let codec = state.codec.as_mut().expect("codec already finished");
            for slice in compressed.read_buffers() {
                if let Err(err) = codec.push(slice) {
                    return Err(self.map_decode_error(err, produced_any));
                }
            }
            let _ = codec.sync_flush();
            let output = codec.take_output();
            if !output.is_empty() {
                state.produced_any = true;
                state.pending.copy_in(&output);
            }
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        if self.direction != ZlibDirection::Write {
            return Err(StreamError::Unsupported("write"));
        }
        let mut state = self.state.lock().unwrap();
        let codec = state.codec.as_mut().expect("stream already closed");
        let mut remaining = len;
        for slice in buffer.read_buffers() {
            if remaining == 0 {
                break;
            }
            let take = slice.len().min(remaining);
            codec.push(&slice[..take]).map_err(StreamError::from)?;
            remaining -= take;
        }
        let output = codec.take_output();
        drop(state);
        if !output.is_empty() {
            super::write_all(&*self.parent(), &output)?;
        }
        Ok(len)
    }

    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        if self.direction == ZlibDirection::Write {
            let output = {
                let mut state = self.state.lock().unwrap();
                if let Some(codec) = state.codec.as_mut() {
                    codec.sync_flush().map_err(StreamError::from)?;
                    codec.take_output()
                } else {
                    Vec::new()
                }
            };
            if !output.is_empty() {
                super::write_all(&*self.parent(), &output)?;
            }
        }
        if flush_parent {
            self.parent().flush(true)?;
        }
        Ok(())
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        if self.direction == ZlibDirection::Write && close_type.closes_write() {
            let output = {
                let mut state = self.state.lock().unwrap();
                match state.codec.take() {
                    Some(codec) => codec.finish().map_err(StreamError::from)?,
                    None => Vec::new(),
                }
            };
            if !output.is_empty() {
                super::write_all(&*self.parent(), &output)?;
            }
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
    use crate::streams::memory::MemoryStream;
    use crate::streams::singleplex::{SingleplexStream, SingleplexType};
    use crate::streams::{transfer_all, write_all, Stream};
    use std::sync::Arc;

    fn round_trip(format: ZlibFormat, payload: &[u8]) {
        let sink = Arc::new(MemoryStream::new());
        let encoder =
            ZlibStream::with_direction(sink.clone(), false, format, ZlibDirection::Write);
        write_all(&encoder, payload).unwrap();
        Stream::close(&encoder, CloseType::Both).unwrap();

        let source = Arc::new(MemoryStream::from(&sink.to_vec()));
        let decoder =
            ZlibStream::with_direction(source, false, format, ZlibDirection::Read);
        let out = MemoryStream::new();
        transfer_all(&decoder, &out).unwrap();
        assert_eq!(out.to_vec(), payload);
    }

    #[test]
    fn zlib_round_trips() {
        round_trip(ZlibFormat::Zlib, b"hello hello hello compression");
    }

    #[test]
    fn gzip_round_trips() {
        round_trip(ZlibFormat::Gzip, b"the same bytes over and over and over");
    }

    #[test]
    fn raw_deflate_round_trips() {
        round_trip(ZlibFormat::Raw, b"raw deflate payload");
    }

    #[test]
    fn garbage_input_is_rejected() {
        let source = Arc::new(MemoryStream::from(b"definitely not gzip data"));
        let decoder =
            ZlibStream::with_direction(source, false, ZlibFormat::Gzip, ZlibDirection::Read);
        let mut buffer = Buffer::new();
        let mut result = Ok(0);
        for _ in 0..4 {
            result = Stream::read(&decoder, &mut buffer, 1024);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(StreamError::UnknownFormat) | Err(StreamError::Corrupted)
        ));
    }

    #[test]
    fn direction_is_inferred_from_a_singleplexed_parent() {
        let memory = Arc::new(MemoryStream::new());
        let write_half = Arc::new(SingleplexStream::new(memory, SingleplexType::Write, false));
        let encoder = ZlibStream::zlib(write_half, false);
        assert!(Stream::supports_write(&encoder));
        assert!(!Stream::supports_read(&encoder));
    }
}
