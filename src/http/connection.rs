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

//! Shared plumbing for client and server connections: the buffered
//! transport and the derivation of body streams from message headers.

use std::sync::Arc;

use crate::streams::buffered::BufferedStream;
use crate::streams::limited::LimitedStream;
use crate::streams::notify::NotifyStream;
use crate::streams::singleplex::{SingleplexStream, SingleplexType};
use crate::streams::zlib::ZlibStream;
use crate::streams::StreamHandle;

use super::chunked::ChunkedStream;
use super::{EntityHeaders, GeneralHeaders, Method, Status};

/// The transport, wrapped so `find` and `unread` are always available to
/// the header parser.
pub(crate) fn wrap_transport(stream: StreamHandle) -> StreamHandle {
    debug_assert!(stream.supports_read() && stream.supports_write());
    if stream.supports_unread() && stream.supports_find() {
        return stream;
    }
    let buffered = BufferedStream::new(stream, true);
    buffered.allow_partial_reads(true);
    Arc::new(buffered)
}

/// RFC 7230 §3.3: whether this message has a body at all.
///
/// `status` is `None` on the request side. `include_empty` reports a
/// zero-length body as present.
pub fn has_message_body(
    general: &GeneralHeaders,
    entity: &EntityHeaders,
    method: &Method,
    status: Option<Status>,
    include_empty: bool,
) -> bool {
    // CONNECT escapes HTTP.
    if *method == Method::Connect && matches!(status, None | Some(Status::Ok)) {
        return false;
    }
    // A TRACE request must not include an entity.
    if status.is_none() && *method == Method::Trace {
        return false;
    }
    if status.is_some() && *method == Method::Head {
        return false;
    }
    if let Some(status) = status {
        if status.is_informational() || status == Status::NoContent || status == Status::NotModified
        {
            return false;
        }
    }
    if general
        .transfer_encoding
        .iter()
        .any(|coding| !coding.value.eq_ignore_ascii_case("identity"))
    {
        return true;
    }
    match entity.content_length {
        Some(0) => return include_empty,
        Some(_) => return true,
        None => {}
    }
    if entity
        .content_type
        .as_ref()
        .is_some_and(super::MediaType::is_multipart)
    {
        return true;
    }
    // Requests cannot be delimited by connection close without precluding
    // the response; responses can.
    status.is_some()
}

/// A derived body stream: the notify layer the engine observes, plus the
/// framing layer (chunked or length-limited) that must be drained to
/// position the transport past the body.
pub(crate) struct BodyStream {
    pub notify: Arc<NotifyStream>,
    pub framing: Option<StreamHandle>,
}

/// Builds the filter chain for one message body over the connection's
/// transport and returns it wrapped in the notify layer the engine uses to
/// observe completion.
///
/// Codings stack in reverse declaration order: `chunked` innermost, then
/// each compression decoder; without codings a strict `Content-Length`
/// limit applies; multipart and to-EOF bodies pass through undelimited.
pub(crate) fn body_stream(
    transport: &StreamHandle,
    general: &GeneralHeaders,
    entity: &EntityHeaders,
    for_read: bool,
) -> BodyStream {
    let plex = if for_read {
        SingleplexType::Read
    } else {
        SingleplexType::Write
    };
    let mut stream: StreamHandle = Arc::new(SingleplexStream::new(transport.clone(), plex, false));
    let mut framing: Option<StreamHandle> = None;
    for coding in general.transfer_encoding.iter().rev() {
        let value = coding.value.as_str();
        if value.eq_ignore_ascii_case("chunked") {
            stream = Arc::new(ChunkedStream::new(stream, true));
            framing = Some(stream.clone());
        } else if value.eq_ignore_ascii_case("deflate") {
            stream = Arc::new(ZlibStream::zlib(stream, true));
        } else if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            stream = Arc::new(ZlibStream::gzip(stream, true));
        } else {
            // identity, compress, and unknown codings are rejected during
            // validation before a body stream is ever derived.
            debug_assert!(
                value.eq_ignore_ascii_case("identity"),
                "unvalidated transfer coding {value:?}"
            );
        }
    }
    if framing.is_none() && general.transfer_encoding.is_empty() {
        if let Some(length) = entity.content_length {
            let limited = LimitedStream::new(stream, length, true);
            limited.set_strict(true);
            stream = Arc::new(limited);
            framing = Some(stream.clone());
        }
        // multipart delimits itself; otherwise the body runs to EOF and
        // the connection cannot be reused.
    }
    BodyStream {
        notify: Arc::new(NotifyStream::new(stream, true)),
        framing,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http::{MediaType, ValueWithParameters};

    fn bare() -> (GeneralHeaders, EntityHeaders) {
        (GeneralHeaders::default(), EntityHeaders::default())
    }

    #[test]
    fn head_responses_never_have_a_body() {
        let (mut general, mut entity) = bare();
        entity.content_length = Some(100);
        general
            .transfer_encoding
            .push(ValueWithParameters::new("chunked"));
        assert!(!has_message_body(
            &general,
            &entity,
            &Method::Head,
            Some(Status::Ok),
            false
        ));
    }

    #[test]
    fn informational_and_no_content_responses_are_bodiless() {
        let (general, entity) = bare();
        for status in [Status::Continue, Status::NoContent, Status::NotModified] {
            assert!(!has_message_body(
                &general,
                &entity,
                &Method::Get,
                Some(status),
                false
            ));
        }
    }

    #[test]
    fn chunked_implies_a_body() {
        let (mut general, entity) = bare();
        general
            .transfer_encoding
            .push(ValueWithParameters::new("chunked"));
        assert!(has_message_body(&general, &entity, &Method::Get, None, false));
    }

    #[test]
    fn content_length_zero_depends_on_include_empty() {
        let (general, mut entity) = bare();
        entity.content_length = Some(0);
        assert!(!has_message_body(
            &general,
            &entity,
            &Method::Post,
            None,
            false
        ));
        assert!(has_message_body(&general, &entity, &Method::Post, None, true));
    }

    #[test]
    fn responses_default_to_close_delimited_bodies() {
        let (general, entity) = bare();
        assert!(has_message_body(
            &general,
            &entity,
            &Method::Get,
            Some(Status::Ok),
            false
        ));
        // Requests cannot be close-delimited.
        assert!(!has_message_body(&general, &entity, &Method::Get, None, false));
    }

    #[test]
    fn multipart_without_length_is_a_body() {
        let (general, mut entity) = bare();
        entity.content_type = Some(MediaType::new("multipart", "form-data"));
        assert!(has_message_body(&general, &entity, &Method::Post, None, false));
    }

    #[test]
    fn connect_has_no_body_on_success() {
        let (general, entity) = bare();
        assert!(!has_message_body(
            &general,
            &entity,
            &Method::Connect,
            Some(Status::Ok),
            false
        ));
    }
}
