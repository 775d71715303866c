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

//! MIME multipart framing over a stream.
//!
//! Reading: `next_part` scans to the boundary, parses the part's entity
//! headers, and returns a part whose stream ends at the next boundary; the
//! `--`-suffixed boundary finishes the body. Writing: `next_part` emits a
//! boundary, the part's stream writes into the parent, and `finish` emits
//! the closing boundary. A part whose content type is itself
//! `multipart/*` nests.

use std::sync::{Arc, Mutex, Weak};

use rand::Rng;

use crate::buffer::Buffer;
use crate::error::{HttpError, HttpResult, StreamResult};
use crate::streams::buffered::BufferedStream;
use crate::streams::filter::{FilterBase, FilterStream};
use crate::streams::notify::NotifyStream;
use crate::streams::null::NullStream;
use crate::streams::{transfer_all, write_all, StreamHandle};

use super::parser::TrailerParser;
use super::{map_get, EntityHeaders, EntityHeadersBlock};

const BOUNDARY_CHARS: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ'()+_,-./:=?";
const MAX_BOUNDARY: usize = 70;

/// A random boundary from the RFC 2046 allowed alphabet.
pub fn random_boundary() -> String {
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| BOUNDARY_CHARS[rng.gen_range(0..BOUNDARY_CHARS.len())] as char)
        .collect()
}

struct MultipartState {
    finished: bool,
    current: Option<StreamHandle>,
}

// Parts hold a strong handle back to their multipart; the multipart only
// ever needs a weak handle to itself for callbacks.

/// Framing over one `multipart/*` body, in either direction.
pub struct Multipart {
    stream: StreamHandle,
    // Includes the leading CRLF that terminates the previous part.
    boundary: String,
    read_side: bool,
    state: Mutex<MultipartState>,
    finished_cb: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    weak_self: Weak<Multipart>,
}

impl Multipart {
    /// Reads parts from `stream`, which carries the body framed by
    /// `boundary`.
    pub fn read(stream: StreamHandle, boundary: &str) -> HttpResult<Arc<Self>> {
        Multipart::new(stream, boundary, true)
    }

    /// Writes parts into `stream` framed by `boundary`.
    pub fn write(stream: StreamHandle, boundary: &str) -> HttpResult<Arc<Self>> {
        Multipart::new(stream, boundary, false)
    }

    fn new(stream: StreamHandle, boundary: &str, read_side: bool) -> HttpResult<Arc<Self>> {
        let trimmed = boundary.trim_end_matches(' ');
        if trimmed.is_empty()
            || trimmed.len() > MAX_BOUNDARY
            || trimmed.bytes().any(|b| !BOUNDARY_CHARS.contains(&b))
        {
            return Err(HttpError::InvalidMultipartBoundary);
        }
        let stream = if read_side && !stream.supports_find() {
            Arc::new(BufferedStream::new(stream, true)) as StreamHandle
        } else {
            stream
        };
        Ok(Arc::new_cyclic(|weak| Multipart {
            stream,
            boundary: format!("\r\n--{trimmed}"),
            read_side,
            state: Mutex::new(MultipartState {
                finished: false,
                current: None,
            }),
            finished_cb: Mutex::new(None),
            weak_self: weak.clone(),
        }))
    }

    /// Invoked when the final boundary is seen (read) or written.
    pub fn on_finished<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self.finished_cb.lock().unwrap() = Some(Arc::new(callback));
    }

    fn fire_finished(&self) {
        let callback = self.finished_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn part_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.current = None;
    }

    fn strong(&self) -> Arc<Multipart> {
        self.weak_self.upgrade().expect("multipart alive")
    }

    /// The next part, or `None` after the final boundary. On the write
    /// side this emits a boundary and returns a fresh part to fill in.
    pub fn next_part(&self) -> HttpResult<Option<Arc<BodyPart>>> {
        if self.read_side {
            self.next_part_read()
        } else {
            self.next_part_write()
        }
    }

    fn next_part_write(&self) -> HttpResult<Option<Arc<BodyPart>>> {
        {
            let state = self.state.lock().unwrap();
            debug_assert!(!state.finished);
            debug_assert!(state.current.is_none(), "previous part still open");
        }
        write_all(&*self.stream, format!("{}\r\n", self.boundary).as_bytes())?;
        Ok(Some(Arc::new(BodyPart {
            multipart: self.strong(),
            headers: Mutex::new(EntityHeaders::default()),
            stream: Mutex::new(None),
        })))
    }

    fn next_part_read(&self) -> HttpResult<Option<Arc<BodyPart>>> {
        {
            let state = self.state.lock().unwrap();
            if state.finished {
                return Ok(None);
            }
        }
        // Drain the previous part so the cursor sits at the boundary.
        let leftover = self.state.lock().unwrap().current.clone();
        if let Some(leftover) = leftover {
            transfer_all(&*leftover, &*NullStream::handle()).map_err(HttpError::from)?;
            debug_assert!(self.state.lock().unwrap().current.is_none());
        }

        let offset = self
            .stream
            .find(self.boundary.as_bytes(), usize::MAX, true)
            .map_err(HttpError::from)?;
        let mut discard = Buffer::new();
        crate::streams::read_exact(
            &*self.stream,
            &mut discard,
            offset as usize + self.boundary.len(),
        )
        .map_err(HttpError::from)?;

        let mut tail = Buffer::new();
        crate::streams::read_exact(&*self.stream, &mut tail, 2).map_err(HttpError::from)?;
        let tail_bytes = tail.to_vec();
        let mut finished = false;
        if tail_bytes == b"--" {
            finished = true;
        } else if tail_bytes == b"\r\n" {
            // Normal boundary line.
        } else if tail_bytes[0] == b'\n' {
            self.stream
                .unread(&Buffer::from(&tail_bytes[1..]), 1)
                .map_err(HttpError::from)?;
        } else {
            // Transport padding; the rest of the line must be blank-ish.
            let rest = crate::streams::get_delimited(&*self.stream, b"\n", false)
                .map_err(HttpError::from)?;
            let mut line = tail_bytes.clone();
            line.extend_from_slice(&rest);
            let text = String::from_utf8_lossy(&line);
            if text
                .trim_end_matches('\n')
                .bytes()
                .any(|b| !matches!(b, b' ' | b'\r' | b'\t'))
            {
                return Err(HttpError::InvalidMultipartBoundary);
            }
        }

        if finished {
            // Consume the rest of the closing line.
            let _ = crate::streams::get_delimited(&*self.stream, b"\n", true);
            self.state.lock().unwrap().finished = true;
            self.fire_finished();
            return Ok(None);
        }

        // Parse the part's entity headers.
        let mut parser = TrailerParser::new();
        parser.run(&*self.stream)?;
        if parser.error() {
            return Err(HttpError::BadMessageHeader);
        }
        if !parser.complete() {
            return Err(HttpError::IncompleteMessageHeader);
        }
        let headers = parser.into_message();

        let delimited = PartReadStream {
            base: FilterBase::new(self.stream.clone(), false),
            boundary: self.boundary.clone(),
        };
        let notify = Arc::new(NotifyStream::new(Arc::new(delimited), true));
        let watcher = self.strong();
        notify.on_eof(move || watcher.part_done());
        let handle: StreamHandle = notify;
        {
            let mut state = self.state.lock().unwrap();
            state.current = Some(handle.clone());
        }
        Ok(Some(Arc::new(BodyPart {
            multipart: self.strong(),
            headers: Mutex::new(headers),
            stream: Mutex::new(Some(handle)),
        })))
    }

    /// Writes the closing boundary.
    pub fn finish(&self) -> HttpResult<()> {
        debug_assert!(!self.read_side);
        {
            let state = self.state.lock().unwrap();
            debug_assert!(!state.finished);
        }
        write_all(&*self.stream, format!("{}--\r\n", self.boundary).as_bytes())?;
        self.state.lock().unwrap().finished = true;
        self.fire_finished();
        Ok(())
    }
}

/// Terminates a part's reads at the next boundary.
struct PartReadStream {
    base: FilterBase,
    boundary: String,
}

impl FilterStream for PartReadStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        false
    }

    fn mutates(&self) -> bool {
        true
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let offset = self
            .parent()
            .find(self.boundary.as_bytes(), usize::MAX, false)?;
        let window = if offset >= 0 {
            offset as usize
        } else {
            // Malformed body: no boundary before EOF. Serve what is
            // there; the caller's next boundary scan reports the error.
            (-offset - 1) as usize
        };
        let len = len.min(window);
        if len == 0 {
            return Ok(0);
        }
        self.parent().read(buffer, len)
    }
}

/// One part of a multipart body.
pub struct BodyPart {
    multipart: Arc<Multipart>,
    headers: Mutex<EntityHeaders>,
    stream: Mutex<Option<StreamHandle>>,
}

impl BodyPart {
    pub fn headers(&self) -> EntityHeaders {
        self.headers.lock().unwrap().clone()
    }

    /// Write side: set the part's headers before asking for its stream.
    pub fn set_headers(&self, headers: EntityHeaders) {
        *self.headers.lock().unwrap() = headers;
    }

    /// The part's body stream. On the write side this emits the headers
    /// first; close the stream to end the part.
    pub fn stream(&self) -> HttpResult<StreamHandle> {
        if let Some(stream) = self.stream.lock().unwrap().as_ref() {
            return Ok(stream.clone());
        }
        debug_assert!(!self.multipart.read_side);
        let headers = self.headers.lock().unwrap();
        let text = format!("{}\r\n", EntityHeadersBlock(&headers));
        drop(headers);
        write_all(&*self.multipart.stream, text.as_bytes())?;
        let notify = Arc::new(NotifyStream::new(self.multipart.stream.clone(), false));
        let watcher = self.multipart.clone();
        notify.on_close(move || watcher.part_done());
        let handle: StreamHandle = notify;
        {
            let mut state = self.multipart.state.lock().unwrap();
            state.current = Some(handle.clone());
        }
        *self.stream.lock().unwrap() = Some(handle.clone());
        Ok(handle)
    }

    /// A nested multipart when this part's content type is `multipart/*`.
    pub fn multipart(&self) -> HttpResult<Arc<Multipart>> {
        let headers = self.headers.lock().unwrap();
        let boundary = headers
            .content_type
            .as_ref()
            .filter(|ct| ct.is_multipart())
            .and_then(|ct| map_get(&ct.parameters, "boundary"))
            .ok_or(HttpError::MissingMultipartBoundary)?
            .to_string();
        drop(headers);
        let stream = self.stream()?;
        if self.multipart.read_side {
            Multipart::read(stream, &boundary)
        } else {
            Multipart::write(stream, &boundary)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http::MediaType;
    use crate::streams::memory::MemoryStream;
    use crate::streams::singleplex::{SingleplexStream, SingleplexType};
    use crate::streams::{Anchor, Stream};

    #[test]
    fn random_boundaries_are_legal_and_distinct() {
        let first = random_boundary();
        let second = random_boundary();
        assert_eq!(40, first.len());
        assert_ne!(first, second);
        assert!(first.bytes().all(|b| BOUNDARY_CHARS.contains(&b)));
    }

    #[test]
    fn rejects_an_illegal_boundary() {
        let memory: StreamHandle = Arc::new(MemoryStream::new());
        assert!(matches!(
            Multipart::read(memory, "bad boundary\"chars"),
            Err(HttpError::InvalidMultipartBoundary)
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let transport = Arc::new(MemoryStream::new());
        {
            let write_half: StreamHandle = Arc::new(SingleplexStream::new(
                transport.clone(),
                SingleplexType::Write,
                false,
            ));
            let multipart = Multipart::write(write_half, "frontier").unwrap();

            let part = multipart.next_part().unwrap().unwrap();
            let mut headers = EntityHeaders::default();
            headers.content_type = Some(MediaType::new("text", "plain"));
            part.set_headers(headers);
            let body = part.stream().unwrap();
            write_all(&*body, b"first part body").unwrap();
            body.close(CloseType::Both).unwrap();

            let part = multipart.next_part().unwrap().unwrap();
            let body = part.stream().unwrap();
            write_all(&*body, b"second part body").unwrap();
            body.close(CloseType::Both).unwrap();

            multipart.finish().unwrap();
        }

        transport.seek(0, Anchor::Begin).unwrap();
        let read_half: StreamHandle = Arc::new(SingleplexStream::new(
            transport,
            SingleplexType::Read,
            false,
        ));
        let multipart = Multipart::read(read_half, "frontier").unwrap();

        let part = multipart.next_part().unwrap().unwrap();
        assert!(part.headers().content_type.unwrap().kind == "text");
        let mut out = Buffer::new();
        let stream = part.stream().unwrap();
        while crate::streams::Stream::read(&*stream, &mut out, 7).unwrap() > 0 {}
        assert_eq!(out, b"first part body" as &[u8]);

        let part = multipart.next_part().unwrap().unwrap();
        let stream = part.stream().unwrap();
        let sink = MemoryStream::new();
        transfer_all(&*stream, &sink).unwrap();
        assert_eq!(sink.to_vec(), b"second part body");

        assert!(multipart.next_part().unwrap().is_none());
    }

    #[test]
    fn unread_parts_are_skipped_automatically() {
        let transport = Arc::new(MemoryStream::new());
        {
            let write_half: StreamHandle = Arc::new(SingleplexStream::new(
                transport.clone(),
                SingleplexType::Write,
                false,
            ));
            let multipart = Multipart::write(write_half, "b").unwrap();
            for body_text in [b"part one" as &[u8], b"part two"] {
                let part = multipart.next_part().unwrap().unwrap();
                let body = part.stream().unwrap();
                write_all(&*body, body_text).unwrap();
                body.close(CloseType::Both).unwrap();
            }
            multipart.finish().unwrap();
        }
        transport.seek(0, Anchor::Begin).unwrap();
        let read_half: StreamHandle = Arc::new(SingleplexStream::new(
            transport,
            SingleplexType::Read,
            false,
        ));
        let multipart = Multipart::read(read_half, "b").unwrap();
        let _first = multipart.next_part().unwrap().unwrap();
        // Never read the first part; the second must still frame
        // correctly.
        let second = multipart.next_part().unwrap().unwrap();
        let sink = MemoryStream::new();
        transfer_all(&*second.stream().unwrap(), &sink).unwrap();
        assert_eq!(sink.to_vec(), b"part two");
    }
}
