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

//! Client connection with request pipelining.
//!
//! Requests are serialized strictly in submission order on the write path:
//! a submitter that is not at the head parks until the previous request's
//! body completes. Responses are read strictly in submission order on the
//! read path: a reader that is not at the head parks in the
//! waiting-response set. A response may complete before its own request
//! does. Failures poison every later request on the connection: transport
//! failures with `PriorRequestFailed`, a peer-announced close with
//! `ConnectionVoluntarilyClosed`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{HttpError, HttpResult, StreamError};
use crate::fiber::{self, Parker, Resumer, Wakeup};
use crate::streams::limited::LimitedStream;
use crate::streams::notify::NotifyStream;
use crate::streams::null::NullStream;
use crate::streams::timeout::TimeoutStream;
use crate::streams::{transfer_all, write_all, CloseType, Stream, StreamHandle};
use crate::timer::{TimerHandle, TimerManager};

use super::connection::{body_stream, has_message_body, wrap_transport};
use super::multipart::Multipart;
use super::parser::{ResponseParser, TrailerParser};
use super::{
    map_get, set_contains, Caseless, EntityHeaders, EntityHeadersBlock, Method, Request, Response,
    Status, Version,
};

const NONE_SENTINEL: u64 = u64::MAX;

/// Progress of one direction of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransferState {
    /// Not yet asked for (responses only).
    Pending,
    /// Parked, waiting for its turn.
    Waiting,
    /// Headers in flight.
    Headers,
    /// Body in flight.
    Body,
    Complete,
    Canceled,
    Error,
}

struct Slot {
    number: u64,
    request_state: TransferState,
    response_state: TransferState,
    request_resumer: Option<Resumer>,
    response_resumer: Option<Resumer>,
    owner: std::sync::Weak<ClientRequestInner>,
}

struct ClientState {
    pending: VecDeque<Slot>,
    /// Index of the first request whose headers are not fully written;
    /// equals `pending.len()` when no request owns the write path.
    current: usize,
    request_count: u64,
    allow_new_requests: bool,
    prior_request_failed: bool,
    prior_response_failed: u64,
    prior_response_closed: u64,
    idle_timer: Option<TimerHandle>,
    idle_timeout: Option<Duration>,
    idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl ClientState {
    fn index_of(&self, number: u64) -> Option<usize> {
        let front = self.pending.front()?.number;
        if number < front {
            return None;
        }
        let index = (number - front) as usize;
        (index < self.pending.len()).then_some(index)
    }

    fn poisoned(&self) -> Option<HttpError> {
        if self.prior_response_closed != NONE_SENTINEL {
            Some(HttpError::ConnectionVoluntarilyClosed)
        } else if self.prior_request_failed || self.prior_response_failed != NONE_SENTINEL {
            Some(HttpError::PriorRequestFailed)
        } else {
            None
        }
    }

    #[cfg(debug_assertions)]
    fn invariant(&self) {
        let mut last_number = 0;
        let mut seen_first_unrequested = false;
        for (index, slot) in self.pending.iter().enumerate() {
            assert_ne!(0, slot.number);
            if last_number != 0 {
                assert_eq!(last_number + 1, slot.number, "gap in request numbers");
            }
            last_number = slot.number;
            assert!(
                slot.request_state < TransferState::Complete
                    || slot.response_state < TransferState::Complete
                    || slot.response_state == TransferState::Canceled
            );
            // A response may complete before its request, but it never
            // starts first.
            if slot.response_state > TransferState::Waiting {
                assert!(slot.request_state > TransferState::Waiting);
            }
            if !seen_first_unrequested {
                if slot.request_state < TransferState::Complete {
                    seen_first_unrequested = true;
                    assert!(slot.request_state > TransferState::Waiting);
                    assert_eq!(self.current, index);
                }
            } else {
                assert_eq!(TransferState::Waiting, slot.request_state);
            }
            assert_eq!(
                slot.response_state == TransferState::Waiting,
                slot.response_resumer.is_some()
            );
            if index != 0 {
                assert!(slot.response_state <= TransferState::Waiting);
            }
        }
        if !seen_first_unrequested {
            assert_eq!(self.current, self.pending.len());
        }
    }

    #[cfg(not(debug_assertions))]
    fn invariant(&self) {}
}

struct ClientInner {
    stream: StreamHandle,
    timeout_stream: Option<Arc<TimeoutStream>>,
    timers: Option<TimerManager>,
    read_timeout: Mutex<Option<Duration>>,
    state: Mutex<ClientState>,
}

/// One HTTP/1.x client connection. Many requests may be in flight through
/// it; it owns the transport stack exclusively.
pub struct ClientConnection {
    inner: Arc<ClientInner>,
}

impl ClientConnection {
    /// `timers` enables the timeout layer, spliced directly over the
    /// transport so timeouts cover real I/O rather than buffered reads.
    pub fn new(stream: StreamHandle, timers: Option<TimerManager>) -> Self {
        let (stream, timeout_stream) = match &timers {
            Some(timers) => {
                let timeout = Arc::new(TimeoutStream::new(stream, timers.clone(), true));
                (
                    wrap_transport(timeout.clone() as StreamHandle),
                    Some(timeout),
                )
            }
            None => (wrap_transport(stream), None),
        };
        ClientConnection {
            inner: Arc::new(ClientInner {
                stream,
                timeout_stream,
                timers,
                read_timeout: Mutex::new(None),
                state: Mutex::new(ClientState {
                    pending: VecDeque::new(),
                    current: 0,
                    request_count: 0,
                    allow_new_requests: true,
                    prior_request_failed: false,
                    prior_response_failed: NONE_SENTINEL,
                    prior_response_closed: NONE_SENTINEL,
                    idle_timer: None,
                    idle_timeout: None,
                    idle_callback: None,
                }),
            }),
        }
    }

    /// Enqueues a request and drives it; returns once the headers are on
    /// the wire (or scheduled behind the pipeline head) and the response
    /// path is reserved.
    pub fn request(&self, headers: Request) -> HttpResult<ClientRequest> {
        let inner = Arc::new(ClientRequestInner {
            conn: self.inner.clone(),
            number: OnceLock::new(),
            request: Mutex::new(headers),
            response: OnceLock::new(),
            response_error: Mutex::new(None),
            request_stream: Mutex::new(None),
            response_stream: Mutex::new(None),
            response_framing: Mutex::new(None),
            request_trailer: Mutex::new(EntityHeaders::default()),
            response_trailer: Mutex::new(EntityHeaders::default()),
            bad_trailer: AtomicBool::new(false),
            incomplete_trailer: AtomicBool::new(false),
            has_response_body: AtomicBool::new(false),
        });
        ClientRequestInner::do_request(&inner)?;
        Ok(ClientRequest { inner })
    }

    pub fn new_requests_allowed(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.allow_new_requests
            && state.prior_response_closed == NONE_SENTINEL
            && !state.prior_request_failed
            && state.prior_response_failed == NONE_SENTINEL
    }

    pub fn outstanding_requests(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.invariant();
        state.pending.len()
    }

    pub fn supports_timeouts(&self) -> bool {
        self.inner.timeout_stream.is_some()
    }

    /// Applied to the transport while the connection is idle on the read
    /// path (a response is expected but no request is mid-flight).
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        debug_assert!(self.inner.timeout_stream.is_some());
        *self.inner.read_timeout.lock().unwrap() = timeout;
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        if let Some(timeout_stream) = &self.inner.timeout_stream {
            timeout_stream.set_write_timeout(timeout);
        }
    }

    /// Fires `callback` after the connection has been idle (no pending
    /// requests) for `timeout`.
    pub fn set_idle_timeout<F>(&self, timeout: Option<Duration>, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let timers = self.inner.timers.as_ref().expect("timeouts not enabled");
        let mut state = self.inner.state.lock().unwrap();
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
        state.idle_timeout = timeout;
        let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(callback);
        state.idle_callback = Some(callback.clone());
        if let Some(timeout) = timeout {
            if state.pending.is_empty() {
                state.idle_timer =
                    Some(timers.register_timer(timeout, move || callback()));
            }
        }
    }

    /// The raw transport; only valid after a `CONNECT` request succeeded.
    pub fn raw_stream(&self) -> StreamHandle {
        self.inner.stream.clone()
    }

    /// Closes the transport outright.
    pub fn close(&self) -> HttpResult<()> {
        self.inner.stream.close(CloseType::Both)?;
        Ok(())
    }
}

struct ClientRequestInner {
    conn: Arc<ClientInner>,
    number: OnceLock<u64>,
    request: Mutex<Request>,
    response: OnceLock<Response>,
    response_error: Mutex<Option<HttpError>>,
    request_stream: Mutex<Option<Arc<NotifyStream>>>,
    response_stream: Mutex<Option<std::sync::Weak<NotifyStream>>>,
    response_framing: Mutex<Option<StreamHandle>>,
    request_trailer: Mutex<EntityHeaders>,
    response_trailer: Mutex<EntityHeaders>,
    bad_trailer: AtomicBool,
    incomplete_trailer: AtomicBool,
    has_response_body: AtomicBool,
}

impl ClientRequestInner {
    fn number(&self) -> u64 {
        *self.number.get().expect("request not yet enqueued")
    }

    fn request_state(&self, state: &ClientState) -> TransferState {
        state
            .index_of(self.number())
            .map(|index| state.pending[index].request_state)
            .unwrap_or(TransferState::Error)
    }

    fn validate_request(request: &Request) -> HttpResult<()> {
        let codings = &request.general.transfer_encoding;
        if codings.is_empty() {
            return Ok(());
        }
        if !codings
            .last()
            .expect("non-empty list")
            .value
            .eq_ignore_ascii_case("chunked")
        {
            return Err(HttpError::InvalidTransferEncoding(
                "the last transfer-coding is not chunked".to_string(),
            ));
        }
        for coding in &codings[..codings.len() - 1] {
            let value = coding.value.as_str();
            if value.eq_ignore_ascii_case("chunked") {
                return Err(HttpError::InvalidTransferEncoding(
                    "chunked applied multiple times".to_string(),
                ));
            } else if value.eq_ignore_ascii_case("identity") {
                return Err(HttpError::InvalidTransferEncoding(
                    "identity is only acceptable in the TE header".to_string(),
                ));
            } else if value.eq_ignore_ascii_case("gzip")
                || value.eq_ignore_ascii_case("x-gzip")
                || value.eq_ignore_ascii_case("deflate")
            {
                // Supported codings.
            } else {
                return Err(HttpError::InvalidTransferEncoding(format!(
                    "unrecognized transfer-coding: {value}"
                )));
            }
        }
        Ok(())
    }

    fn do_request(inner: &Arc<Self>) -> HttpResult<()> {
        let conn = &inner.conn;
        let (request_text, has_body, close) = {
            let mut request = inner.request.lock().unwrap();
            Self::validate_request(&request)?;
            debug_assert!(!request.request_line.uri.is_empty(), "have to request *something*");

            // Default the version: 1.1 if possible.
            if request.request_line.ver.is_none() {
                request.request_line.ver = Some(if request.request.host.is_empty() {
                    Version::HTTP_1_0
                } else {
                    Version::HTTP_1_1
                });
            }
            let ver = request.request_line.ver.expect("version defaulted above");
            // If not specified, try to keep the connection open.
            if ver == Version::HTTP_1_0 && !set_contains(&request.general.connection, "close") {
                request.general.connection.insert(Caseless::from("Keep-Alive"));
            }
            let close = if ver == Version::HTTP_1_0 {
                if set_contains(&request.general.connection, "Keep-Alive") {
                    false
                } else {
                    request.general.connection.insert(Caseless::from("close"));
                    true
                }
            } else {
                set_contains(&request.general.connection, "close")
            };
            // TE is a connection-specific header.
            if !request.request.te.is_empty() {
                request.general.connection.insert(Caseless::from("TE"));
            }
            let has_body = has_message_body(
                &request.general,
                &request.entity,
                &request.request_line.method,
                None,
                false,
            );
            (request.to_string(), has_body, close)
        };

        // Put the request in the queue.
        let (first, parker) = {
            let mut state = conn.state.lock().unwrap();
            state.invariant();
            if !state.allow_new_requests || state.prior_response_closed != NONE_SENTINEL {
                return Err(HttpError::ConnectionVoluntarilyClosed);
            }
            if state.prior_request_failed || state.prior_response_failed != NONE_SENTINEL {
                return Err(HttpError::PriorRequestFailed);
            }
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.request_count += 1;
            let number = state.request_count;
            inner.number.set(number).expect("enqueued once");
            let first = state.current == state.pending.len();
            let mut parker = None;
            let mut slot = Slot {
                number,
                request_state: TransferState::Waiting,
                response_state: TransferState::Pending,
                request_resumer: None,
                response_resumer: None,
                owner: Arc::downgrade(inner),
            };
            if first {
                slot.request_state = TransferState::Headers;
                // Disable read timeouts while a request is in progress.
                if let Some(timeout_stream) = &conn.timeout_stream {
                    timeout_stream.set_read_timeout(None);
                }
                trace!(number, "requesting");
            } else {
                let p = Parker::new();
                slot.request_resumer = Some(p.resumer());
                parker = Some(p);
                trace!(number, "waiting to request");
            }
            state.pending.push_back(slot);
            if first {
                state.current = state.pending.len() - 1;
            }
            if close {
                state.allow_new_requests = false;
            }
            (first, parker)
        };

        // If we weren't first in the queue, wait for another request to
        // schedule us.
        if !first {
            let wakeup = parker.expect("parker created for non-first").park();
            trace!(number = inner.number(), "requesting");
            let mut state = conn.state.lock().unwrap();
            state.invariant();
            if wakeup == Wakeup::Abort {
                return Err(HttpError::Stream(StreamError::OperationAborted));
            }
            if let Some(err) = state.poisoned() {
                if let Some(index) = state.index_of(inner.number()) {
                    if state.pending[index].request_state == TransferState::Headers {
                        debug_assert_eq!(state.current, index);
                        state.pending.remove(index);
                    } else {
                        state.pending.remove(index);
                        if index < state.current {
                            state.current -= 1;
                        }
                    }
                }
                return Err(err);
            }
        }
        debug_assert_eq!(
            TransferState::Headers,
            inner.request_state(&conn.state.lock().unwrap())
        );

        // Write the headers.
        let write_result = write_all(&*conn.stream, request_text.as_bytes());
        match write_result {
            Ok(()) => {
                debug!(number = inner.number(), line = %inner.request.lock().unwrap().request_line, "request headers sent");
                {
                    let mut state = conn.state.lock().unwrap();
                    if let Some(index) = state.index_of(inner.number()) {
                        state.pending[index].request_state = TransferState::Body;
                    }
                }
                if !has_body {
                    trace!(number = inner.number(), "no request body");
                    Self::schedule_next_request(inner);
                }
                Ok(())
            }
            Err(err) => {
                let mut state = conn.state.lock().unwrap();
                state.invariant();
                let number = inner.number();
                if let Some(index) = state.index_of(number) {
                    state.pending[index].request_state = TransferState::Error;
                    state.pending[index].response_state = TransferState::Canceled;
                    debug_assert_eq!(state.current, index);
                    state.pending.remove(index);
                }
                state.prior_request_failed = true;
                schedule_all_waiting_requests(&mut state);
                if state.prior_response_closed <= number {
                    return Err(HttpError::ConnectionVoluntarilyClosed);
                }
                if state.prior_response_failed <= number {
                    return Err(HttpError::PriorRequestFailed);
                }
                Err(err.into())
            }
        }
    }

    /// The request body completed; pass write ownership to the next
    /// request in the queue, flushing first when there is none.
    fn schedule_next_request(inner: &Arc<Self>) {
        let conn = &inner.conn;
        let number = inner.number();
        let mut close = false;
        let mut resume: Option<Resumer> = None;
        {
            let mut state = conn.state.lock().unwrap();
            state.invariant();
            let index = state.index_of(number).expect("request still queued");
            debug_assert_eq!(state.current, index);
            debug_assert_eq!(TransferState::Body, state.pending[index].request_state);
            trace!(number, "request complete");
            if index + 1 < state.pending.len() {
                state.pending[index].request_state = TransferState::Complete;
                if state.pending[index].response_state >= TransferState::Complete {
                    debug_assert_eq!(0, index);
                    state.pending.pop_front();
                    state.current = 0;
                } else {
                    state.current = index + 1;
                }
                let current = state.current;
                let next = &mut state.pending[current];
                next.request_state = TransferState::Headers;
                resume = next.request_resumer.take();
                trace!(number = next.number, "scheduling request");
            } else {
                // Do not advance current: no one else may start another
                // request until our flush completes.
                drop(state);
                // Take a trip through the scheduler, letting someone else
                // attempt to pipeline before we pay for a flush.
                if fiber::in_fiber() {
                    fiber::yield_now();
                }
                let mut state = conn.state.lock().unwrap();
                state.invariant();
                let index = state.index_of(number).expect("request still queued");
                if index + 1 == state.pending.len() {
                    // Nope, still the end; we really do have to flush.
                    drop(state);
                    trace!("flushing");
                    if conn.stream.flush(true).is_err() {
                        Self::request_failed(inner);
                        return;
                    }
                    state = conn.state.lock().unwrap();
                    state.invariant();
                }
                let index = state.index_of(number).expect("request still queued");
                state.pending[index].request_state = TransferState::Complete;
                state.current = index + 1;
                if state.pending[index].response_state >= TransferState::Complete {
                    debug_assert_eq!(0, index);
                    let slot = state.pending.pop_front().expect("front exists");
                    state.current -= 1;
                    if state.prior_response_closed <= slot.number
                        || state.prior_response_failed <= slot.number
                    {
                        debug_assert!(state.pending.is_empty());
                        close = true;
                    }
                }
                // Someone else may have queued up while we were flushing.
                if state.current < state.pending.len() {
                    let current = state.current;
                    let next = &mut state.pending[current];
                    next.request_state = TransferState::Headers;
                    resume = next.request_resumer.take();
                    trace!(number = next.number, "scheduling request");
                } else if let Some(timeout_stream) = &conn.timeout_stream {
                    timeout_stream.set_read_timeout(*conn.read_timeout.lock().unwrap());
                }
            }
        }
        if let Some(resume) = resume {
            resume.resume(Wakeup::Resume);
        }
        if close {
            trace!("closing");
            let _ = conn.stream.close(CloseType::Both);
        }
    }

    /// The response body completed; pop the head and resume the next
    /// parked response reader.
    fn schedule_next_response(inner: &Arc<Self>) {
        let conn = &inner.conn;
        let number = inner.number();
        let mut close = false;
        let mut resume: Option<Resumer> = None;
        let mut skipped: Option<Arc<ClientRequestInner>> = None;
        {
            let mut state = conn.state.lock().unwrap();
            state.invariant();
            debug_assert_eq!(Some(0), state.index_of(number));
            debug_assert!(matches!(
                state.pending[0].response_state,
                TransferState::Headers | TransferState::Body
            ));
            state.pending[0].response_state = TransferState::Complete;
            trace!(number, "response complete");
            if state.pending[0].request_state >= TransferState::Complete {
                let slot = state.pending.pop_front().expect("front exists");
                if state.current > 0 {
                    state.current -= 1;
                }
                if state.prior_response_closed <= slot.number
                    || state.prior_response_failed <= slot.number
                {
                    close = true;
                }
            }
            if let Some(next) = state.pending.front_mut() {
                match next.response_state {
                    TransferState::Waiting => {
                        next.response_state = TransferState::Headers;
                        resume = next.response_resumer.take();
                        trace!(number = next.number, "scheduling response");
                    }
                    TransferState::Canceled => {
                        trace!(number = next.number, "skipping response");
                        skipped = next.owner.upgrade();
                    }
                    _ => {}
                }
            } else if let (Some(timeout), Some(callback), Some(timers)) = (
                state.idle_timeout,
                state.idle_callback.clone(),
                conn.timers.as_ref(),
            ) {
                debug_assert!(state.idle_timer.is_none());
                state.idle_timer = Some(timers.register_timer(timeout, move || callback()));
            }
        }
        if let Some(resume) = resume {
            resume.resume(Wakeup::Resume);
        }
        if let Some(skipped) = &skipped {
            let _ = ClientRequestInner::finish(skipped);
        }
        if close {
            debug_assert!(skipped.is_none());
            trace!("closing");
            let _ = conn.stream.close(CloseType::Both);
        }
    }

    /// Parks until this request is the head of the response queue, then
    /// reads and validates the response headers.
    fn ensure_response(inner: &Arc<Self>) -> HttpResult<()> {
        if let Some(err) = inner.response_error.lock().unwrap().as_ref() {
            return Err(err.duplicate());
        }
        let result = Self::ensure_response_inner(inner);
        if let Err(err) = &result {
            *inner.response_error.lock().unwrap() = Some(err.duplicate());
        }
        result
    }

    fn ensure_response_inner(inner: &Arc<Self>) -> HttpResult<()> {
        let conn = &inner.conn;
        let number = inner.number();
        {
            let state = conn.state.lock().unwrap();
            if let Some(index) = state.index_of(number) {
                let response_state = state.pending[index].response_state;
                if response_state == TransferState::Body
                    || response_state >= TransferState::Complete
                {
                    return Ok(());
                }
            } else if inner.response.get().is_some() {
                return Ok(());
            }
        }
        let parker = {
            let mut state = conn.state.lock().unwrap();
            state.invariant();
            if state.prior_response_failed <= number || state.prior_response_closed <= number {
                if let Some(index) = state.index_of(number) {
                    state.pending.remove(index);
                    if index < state.current {
                        state.current -= 1;
                    }
                }
                return Err(if state.prior_response_closed <= number {
                    HttpError::ConnectionVoluntarilyClosed
                } else {
                    HttpError::PriorRequestFailed
                });
            }
            let index = state.index_of(number).ok_or(HttpError::PriorRequestFailed)?;
            debug_assert_eq!(TransferState::Pending, state.pending[index].response_state);
            if index != 0 {
                let parker = Parker::new();
                state.pending[index].response_resumer = Some(parker.resumer());
                state.pending[index].response_state = TransferState::Waiting;
                trace!(number, "waiting for response");
                Some(parker)
            } else {
                state.pending[index].response_state = TransferState::Headers;
                trace!(number, "reading response");
                None
            }
        };

        if let Some(parker) = parker {
            let wakeup = parker.park();
            trace!(number, "reading response");
            let state = conn.state.lock().unwrap();
            state.invariant();
            let index = state.index_of(number);
            let response_state = index
                .map(|index| state.pending[index].response_state)
                .unwrap_or(TransferState::Error);
            if wakeup == Wakeup::Abort || response_state == TransferState::Canceled {
                return Err(HttpError::Stream(StreamError::OperationAborted));
            }
            if response_state == TransferState::Error {
                return Err(if state.prior_response_closed <= number {
                    HttpError::ConnectionVoluntarilyClosed
                } else {
                    HttpError::PriorRequestFailed
                });
            }
            debug_assert_eq!(Some(0), index);
        }

        match Self::read_response_headers(inner) {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut state = conn.state.lock().unwrap();
                state.invariant();
                let first_failure = state.prior_response_failed == NONE_SENTINEL;
                if first_failure {
                    state.prior_response_failed = number;
                }
                if let Some(0) = state.index_of(number) {
                    state.pending[0].response_state = TransferState::Error;
                    if state.pending[0].request_state >= TransferState::Complete {
                        state.pending.pop_front();
                        if state.current > 0 {
                            state.current -= 1;
                        }
                    }
                    schedule_all_waiting_requests(&mut state);
                    schedule_all_waiting_responses(&mut state);
                }
                if state.prior_response_closed < number {
                    return Err(HttpError::ConnectionVoluntarilyClosed);
                }
                if !first_failure && state.prior_response_failed < number {
                    return Err(HttpError::PriorRequestFailed);
                }
                Err(err)
            }
        }
    }

    fn read_response_headers(inner: &Arc<Self>) -> HttpResult<()> {
        let conn = &inner.conn;
        let number = inner.number();
        let mut parser = ResponseParser::new();
        let read = parser.run(&*conn.stream)?;
        if read == 0 {
            return Err(StreamError::UnexpectedEof.into());
        }
        if parser.error() {
            return Err(HttpError::BadMessageHeader);
        }
        if !parser.complete() {
            return Err(HttpError::IncompleteMessageHeader);
        }
        let mut response = parser.into_message();
        debug!(number, status = %response.status, "response headers");

        let mut close = false;
        match response.status.ver {
            Some(Version::HTTP_1_0) => {
                if !set_contains(&response.general.connection, "Keep-Alive") {
                    close = true;
                }
            }
            Some(Version::HTTP_1_1) => {
                if set_contains(&response.general.connection, "close") {
                    close = true;
                }
            }
            _ => return Err(HttpError::BadMessageHeader),
        }
        // Non-standard, but widely deployed.
        if set_contains(&response.general.proxy_connection, "close") {
            close = true;
        }

        // Remove identity from the transfer codings, then validate the
        // stack.
        response
            .general
            .transfer_encoding
            .retain(|coding| !coding.value.eq_ignore_ascii_case("identity"));
        let codings = &response.general.transfer_encoding;
        if !codings.is_empty() {
            if !codings
                .last()
                .expect("non-empty list")
                .value
                .eq_ignore_ascii_case("chunked")
            {
                return Err(HttpError::InvalidTransferEncoding(
                    "the last transfer-coding is not chunked".to_string(),
                ));
            }
            for coding in &codings[..codings.len() - 1] {
                let value = coding.value.as_str();
                if value.eq_ignore_ascii_case("chunked") {
                    return Err(HttpError::InvalidTransferEncoding(
                        "chunked applied multiple times".to_string(),
                    ));
                } else if value.eq_ignore_ascii_case("deflate")
                    || value.eq_ignore_ascii_case("gzip")
                    || value.eq_ignore_ascii_case("x-gzip")
                {
                    // Supported codings.
                } else if value.eq_ignore_ascii_case("compress")
                    || value.eq_ignore_ascii_case("x-compress")
                {
                    return Err(HttpError::InvalidTransferEncoding(
                        "compress transfer-coding is unsupported".to_string(),
                    ));
                } else {
                    return Err(HttpError::InvalidTransferEncoding(format!(
                        "unrecognized transfer-coding: {value}"
                    )));
                }
            }
        }

        let method = inner.request.lock().unwrap().request_line.method.clone();
        let has_body = has_message_body(
            &response.general,
            &response.entity,
            &method,
            Some(response.status.status),
            false,
        );
        // An undelimited body forces the connection closed behind it.
        if has_body
            && response.general.transfer_encoding.is_empty()
            && response.entity.content_length.is_none()
            && !response
                .entity
                .content_type
                .as_ref()
                .is_some_and(super::MediaType::is_multipart)
        {
            close = true;
        }
        let connect = method == Method::Connect && response.status.status == Status::Ok;
        if connect {
            close = true;
        }
        inner
            .response
            .set(response)
            .ok()
            .expect("response parsed once");

        if close {
            let mut state = conn.state.lock().unwrap();
            state.invariant();
            state.prior_response_closed = number;
            debug_assert_eq!(Some(0), state.index_of(number));
            if !has_body && state.pending[0].request_state >= TransferState::Complete {
                state.pending.pop_front();
                if state.current > 0 {
                    state.current -= 1;
                }
            }
            if let Some(0) = state.index_of(number) {
                state.pending[0].response_state = if has_body {
                    TransferState::Body
                } else {
                    TransferState::Complete
                };
            }
            schedule_all_waiting_requests(&mut state);
            schedule_all_waiting_responses(&mut state);
        } else {
            let mut state = conn.state.lock().unwrap();
            let index = state.index_of(number).expect("head of the queue");
            state.pending[index].response_state = if connect {
                TransferState::Complete
            } else {
                TransferState::Body
            };
        }

        if !has_body && !connect {
            trace!(number, "no response body");
            if close {
                if conn.stream.supports_half_close() {
                    let _ = conn.stream.close(CloseType::Read);
                }
            } else {
                Self::schedule_next_response(inner);
            }
        }
        Ok(())
    }

    fn has_request_body(&self) -> bool {
        let request = self.request.lock().unwrap();
        has_message_body(
            &request.general,
            &request.entity,
            &request.request_line.method,
            None,
            false,
        )
    }

    fn request_stream(inner: &Arc<Self>) -> HttpResult<StreamHandle> {
        if let Some(stream) = inner.request_stream.lock().unwrap().as_ref() {
            return Ok(stream.clone() as StreamHandle);
        }
        if !inner.has_request_body() {
            let empty = LimitedStream::new(NullStream::handle(), 0, false);
            return Ok(Arc::new(empty));
        }
        debug_assert_eq!(
            TransferState::Body,
            inner.request_state(&inner.conn.state.lock().unwrap())
        );
        let request = inner.request.lock().unwrap();
        let body = body_stream(&inner.conn.stream, &request.general, &request.entity, false);
        drop(request);
        let done = inner.clone();
        body.notify.on_close(move || {
            ClientRequestInner::request_done(&done);
        });
        let failed = inner.clone();
        body.notify.on_exception(move || {
            ClientRequestInner::request_failed(&failed);
        });
        *inner.request_stream.lock().unwrap() = Some(body.notify.clone());
        Ok(body.notify as StreamHandle)
    }

    fn request_multipart(inner: &Arc<Self>) -> HttpResult<Arc<Multipart>> {
        let boundary = {
            let request = inner.request.lock().unwrap();
            let content_type = request
                .entity
                .content_type
                .as_ref()
                .filter(|ct| ct.is_multipart())
                .ok_or(HttpError::MissingMultipartBoundary)?;
            map_get(&content_type.parameters, "boundary")
                .ok_or(HttpError::MissingMultipartBoundary)?
                .to_string()
        };
        let stream = Self::request_stream(inner)?;
        let multipart = Multipart::write(stream, &boundary)?;
        let done = inner.clone();
        multipart.on_finished(move || {
            if let Some(stream) = done.request_stream.lock().unwrap().clone() {
                let _ = stream.close(CloseType::Both);
            }
        });
        Ok(multipart)
    }

    /// The request body is fully written; emit the trailer when chunked
    /// and hand the write path onward.
    fn request_done(inner: &Arc<Self>) {
        trace!(number = inner.number(), "request body complete");
        if let Some(stream) = inner.request_stream.lock().unwrap().as_ref() {
            stream.clear_callbacks();
        }
        let chunked = !inner
            .request
            .lock()
            .unwrap()
            .general
            .transfer_encoding
            .is_empty();
        if chunked {
            let trailer = inner.request_trailer.lock().unwrap();
            let text = format!("{}\r\n", EntityHeadersBlock(&trailer));
            drop(trailer);
            if write_all(&*inner.conn.stream, text.as_bytes()).is_err() {
                Self::request_failed(inner);
                return;
            }
        }
        Self::schedule_next_request(inner);
    }

    /// The transport failed mid-request-body; poison the write path.
    fn request_failed(inner: &Arc<Self>) {
        trace!(number = inner.number(), "request failed");
        if let Some(stream) = inner.request_stream.lock().unwrap().as_ref() {
            stream.clear_callbacks();
        }
        let conn = &inner.conn;
        let mut state = conn.state.lock().unwrap();
        state.invariant();
        let number = inner.number();
        state.prior_request_failed = true;
        if let Some(index) = state.index_of(number) {
            debug_assert_eq!(state.current, index);
            state.pending[index].request_state = TransferState::Error;
            if state.pending[index].response_state >= TransferState::Complete {
                debug_assert_eq!(0, index);
                state.pending.pop_front();
                state.current = state.pending.len();
            } else {
                state.current = index + 1;
            }
        }
        schedule_all_waiting_requests(&mut state);
    }

    fn ensure_response_public(inner: &Arc<Self>) -> HttpResult<()> {
        Self::ensure_response(inner)
    }

    fn has_response_body(inner: &Arc<Self>) -> HttpResult<bool> {
        Self::ensure_response(inner)?;
        if inner.has_response_body.load(Ordering::Acquire) {
            return Ok(true);
        }
        let response = inner.response.get().expect("ensured");
        let method = inner.request.lock().unwrap().request_line.method.clone();
        Ok(has_message_body(
            &response.general,
            &response.entity,
            &method,
            Some(response.status.status),
            false,
        ))
    }

    fn response_stream(inner: &Arc<Self>) -> HttpResult<StreamHandle> {
        if let Some(stream) = inner
            .response_stream
            .lock()
            .unwrap()
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
        {
            return Ok(stream as StreamHandle);
        }
        if inner.has_response_body.load(Ordering::Acquire) {
            // The body stream was dropped after being handed out once.
            return Err(HttpError::Stream(StreamError::OperationAborted));
        }
        Self::ensure_response(inner)?;
        let number = inner.number();
        let conn = &inner.conn;
        {
            let state = conn.state.lock().unwrap();
            let response_state = state
                .index_of(number)
                .map(|index| state.pending[index].response_state)
                .unwrap_or(TransferState::Complete);
            if response_state >= TransferState::Complete {
                inner.has_response_body.store(true, Ordering::Release);
                let empty = LimitedStream::new(NullStream::handle(), 0, false);
                let handle: StreamHandle = Arc::new(empty);
                *inner.response_stream.lock().unwrap() = None;
                return Ok(handle);
            }
            debug_assert_eq!(TransferState::Body, response_state);
        }
        let response = inner.response.get().expect("ensured");
        let body = body_stream(&conn.stream, &response.general, &response.entity, true);
        let done = inner.clone();
        body.notify.on_eof(move || {
            ClientRequestInner::response_done(&done);
        });
        let closed = inner.clone();
        body.notify.on_close(move || {
            ClientRequestInner::response_done(&closed);
        });
        let failed = inner.clone();
        body.notify.on_exception(move || {
            ClientRequestInner::cancel(&failed, true, true);
        });
        inner.has_response_body.store(true, Ordering::Release);
        *inner.response_stream.lock().unwrap() = Some(Arc::downgrade(&body.notify));
        *inner.response_framing.lock().unwrap() = body.framing.clone();
        Ok(body.notify as StreamHandle)
    }

    fn response_multipart(inner: &Arc<Self>) -> HttpResult<Arc<Multipart>> {
        Self::ensure_response(inner)?;
        let boundary = {
            let response = inner.response.get().expect("ensured");
            let content_type = response
                .entity
                .content_type
                .as_ref()
                .filter(|ct| ct.is_multipart())
                .ok_or(HttpError::MissingMultipartBoundary)?;
            map_get(&content_type.parameters, "boundary")
                .ok_or(HttpError::MissingMultipartBoundary)?
                .to_string()
        };
        let stream = Self::response_stream(inner)?;
        let multipart = Multipart::read(stream, &boundary)?;
        let done = inner.clone();
        multipart.on_finished(move || {
            ClientRequestInner::response_done(&done);
        });
        Ok(multipart)
    }

    /// The response body hit EOF; drain the framing layer, read the
    /// trailer when chunked, then release the read path.
    fn response_done(inner: &Arc<Self>) {
        trace!(number = inner.number(), "response body complete");
        if let Some(stream) = inner
            .response_stream
            .lock()
            .unwrap()
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
        {
            stream.clear_callbacks();
        }
        // Make sure the framing layer saw its own EOF (a decoder can
        // finish before the chunk terminator is consumed).
        let framing = inner.response_framing.lock().unwrap().take();
        if let Some(framing) = framing {
            let _ = transfer_all(&*framing, &*NullStream::handle());
        }
        let chunked = !inner
            .response
            .get()
            .map(|response| response.general.transfer_encoding.is_empty())
            .unwrap_or(true);
        if chunked {
            let mut parser = TrailerParser::new();
            let result = parser.run(&*inner.conn.stream);
            if result.is_err() || parser.error() {
                inner.bad_trailer.store(true, Ordering::Release);
                Self::cancel(inner, true, true);
                return;
            }
            if !parser.complete() {
                inner.incomplete_trailer.store(true, Ordering::Release);
                Self::cancel(inner, true, true);
                return;
            }
            *inner.response_trailer.lock().unwrap() = parser.into_message();
        }
        Self::schedule_next_response(inner);
    }

    fn cancel(inner: &Arc<Self>, abort: bool, error: bool) {
        let conn = &inner.conn;
        let number = inner.number();
        {
            let state = conn.state.lock().unwrap();
            if let Some(index) = state.index_of(number) {
                let slot = &state.pending[index];
                if slot.request_state >= TransferState::Complete
                    && slot.response_state >= TransferState::Complete
                {
                    return;
                }
                // Not started at all, and a graceful cancel: just abandon
                // the queue position.
                if !abort
                    && slot.request_state == TransferState::Waiting
                    && slot.response_state <= TransferState::Waiting
                {
                    drop(state);
                    let mut state = conn.state.lock().unwrap();
                    state.invariant();
                    let Some(index) = state.index_of(number) else {
                        return;
                    };
                    let mut slot = state.pending.remove(index).expect("index in range");
                    if index < state.current {
                        state.current -= 1;
                    }
                    slot.request_state = TransferState::Canceled;
                    slot.response_state = TransferState::Canceled;
                    if let Some(resumer) = slot.request_resumer.take() {
                        resumer.resume(Wakeup::Abort);
                    }
                    if let Some(resumer) = slot.response_resumer.take() {
                        resumer.resume(Wakeup::Abort);
                    }
                    return;
                }
            } else {
                return;
            }
        }
        trace!(number, abort, "cancelling request");
        if let Some(stream) = inner.request_stream.lock().unwrap().as_ref() {
            stream.clear_callbacks();
        }
        if let Some(stream) = inner
            .response_stream
            .lock()
            .unwrap()
            .as_ref()
            .and_then(std::sync::Weak::upgrade)
        {
            stream.clear_callbacks();
        }
        let close = {
            let mut state = conn.state.lock().unwrap();
            state.invariant();
            state.prior_response_failed = state.prior_response_failed.min(number);
            let Some(index) = state.index_of(number) else {
                return;
            };
            let terminal = if error {
                TransferState::Error
            } else {
                TransferState::Canceled
            };
            let close = index == 0;
            {
                let slot = &mut state.pending[index];
                if slot.request_state < TransferState::Complete {
                    slot.request_state = terminal;
                }
                if slot.response_state < TransferState::Complete {
                    slot.response_state = terminal;
                }
            }
            let mut slot = state.pending.remove(index).expect("index in range");
            if index == state.current {
                // current now names the next element at this index.
            } else if index < state.current {
                state.current -= 1;
            }
            if let Some(resumer) = slot.response_resumer.take() {
                resumer.resume(Wakeup::Abort);
            }
            if let Some(resumer) = slot.request_resumer.take() {
                resumer.resume(Wakeup::Abort);
            }
            schedule_all_waiting_requests(&mut state);
            schedule_all_waiting_responses(&mut state);
            close
        };
        if close {
            conn.stream.cancel_read();
        }
        conn.stream.cancel_write();
    }

    /// Ensures the exchange reaches a state where the connection can be
    /// reused: drains any unread response body, or cancels outright when
    /// the request side never completed.
    fn finish(inner: &Arc<Self>) -> HttpResult<()> {
        let (request_state, response_state) = {
            let state = inner.conn.state.lock().unwrap();
            match state.index_of(inner.number()) {
                Some(index) => (
                    state.pending[index].request_state,
                    state.pending[index].response_state,
                ),
                // No longer queued: both sides reached a terminal state.
                None => (TransferState::Complete, TransferState::Complete),
            }
        };
        if request_state != TransferState::Complete {
            Self::cancel(inner, true, false);
            return Ok(());
        }
        if response_state >= TransferState::Complete {
            return Ok(());
        }
        if Self::has_response_body(inner)? {
            let response = inner.response.get().expect("ensured");
            if response
                .entity
                .content_type
                .as_ref()
                .is_some_and(super::MediaType::is_multipart)
            {
                let multipart = Self::response_multipart(inner)?;
                while multipart.next_part()?.is_some() {}
            } else {
                let stream = Self::response_stream(inner)?;
                transfer_all(&*stream, &*NullStream::handle())?;
            }
        }
        Ok(())
    }
}

/// Resumes every parked request writer at or after the current cursor;
/// the woken fibers observe the poison flags themselves. Waiting slots
/// leave the queue here.
fn schedule_all_waiting_requests(state: &mut ClientState) {
    trace!("scheduling all waiting requests");
    let mut index = state.pending.len();
    while index > state.current {
        index -= 1;
        if state.pending[index].request_state == TransferState::Waiting {
            let mut slot = state.pending.remove(index).expect("index in range");
            if let Some(resumer) = slot.request_resumer.take() {
                resumer.resume(Wakeup::Resume);
            }
        }
    }
}

/// Resumes every parked response reader past the first failure point,
/// marking them errored.
fn schedule_all_waiting_responses(state: &mut ClientState) {
    let first = state.prior_response_failed.min(state.prior_response_closed);
    if first == NONE_SENTINEL {
        return;
    }
    trace!("scheduling all waiting responses");
    // Includes the slot at the write cursor, mirroring the read side's
    // view of "already requested".
    let mut index = (state.current + 1).min(state.pending.len());
    loop {
        if index == 0 {
            break;
        }
        index -= 1;
        let slot = &mut state.pending[index];
        if slot.number > first && slot.response_state == TransferState::Waiting {
            slot.response_state = TransferState::Error;
            if let Some(resumer) = slot.response_resumer.take() {
                resumer.resume(Wakeup::Resume);
            }
            if slot.request_state >= TransferState::Complete {
                state.pending.remove(index);
                if index < state.current {
                    state.current -= 1;
                }
            }
        }
    }
}

/// Handle to one request/response exchange on a [`ClientConnection`].
pub struct ClientRequest {
    inner: Arc<ClientRequestInner>,
}

impl ClientRequest {
    /// The request headers as they went on the wire (after defaulting).
    pub fn request(&self) -> Request {
        self.inner.request.lock().unwrap().clone()
    }

    pub fn has_request_body(&self) -> bool {
        self.inner.has_request_body()
    }

    /// The stream to write the request body into; close it to complete
    /// the request.
    pub fn request_stream(&self) -> HttpResult<StreamHandle> {
        ClientRequestInner::request_stream(&self.inner)
    }

    /// Multipart writer over the request body.
    pub fn request_multipart(&self) -> HttpResult<Arc<Multipart>> {
        ClientRequestInner::request_multipart(&self.inner)
    }

    /// Trailer headers to send after a chunked request body.
    pub fn set_request_trailer(&self, trailer: EntityHeaders) {
        debug_assert!(!self
            .inner
            .request
            .lock()
            .unwrap()
            .general
            .transfer_encoding
            .is_empty());
        *self.inner.request_trailer.lock().unwrap() = trailer;
    }

    /// The response headers, reading them first if necessary. Blocks (or
    /// parks) until this request is at the head of the response queue.
    pub fn response(&self) -> HttpResult<&Response> {
        ClientRequestInner::ensure_response_public(&self.inner)?;
        Ok(self.inner.response.get().expect("ensured"))
    }

    pub fn has_response_body(&self) -> HttpResult<bool> {
        ClientRequestInner::has_response_body(&self.inner)
    }

    /// The stream the response body is read from. Reading it to EOF
    /// releases the read path for the next pipelined response.
    pub fn response_stream(&self) -> HttpResult<StreamHandle> {
        ClientRequestInner::response_stream(&self.inner)
    }

    /// Multipart reader over the response body.
    pub fn response_multipart(&self) -> HttpResult<Arc<Multipart>> {
        ClientRequestInner::response_multipart(&self.inner)
    }

    /// Trailer headers received after a chunked response body.
    pub fn response_trailer(&self) -> HttpResult<EntityHeaders> {
        if self.inner.bad_trailer.load(Ordering::Acquire) {
            return Err(HttpError::BadMessageHeader);
        }
        if self.inner.incomplete_trailer.load(Ordering::Acquire) {
            return Err(HttpError::IncompleteMessageHeader);
        }
        Ok(self.inner.response_trailer.lock().unwrap().clone())
    }

    /// The raw transport stream after a successful CONNECT.
    pub fn raw_stream(&self) -> HttpResult<StreamHandle> {
        debug_assert_eq!(
            Method::Connect,
            self.inner.request.lock().unwrap().request_line.method
        );
        ClientRequestInner::ensure_response_public(&self.inner)?;
        Ok(self.inner.conn.stream.clone())
    }

    /// Abandons or aborts the exchange. Later pipelined requests fail
    /// with the prior-failure errors.
    pub fn cancel(&self, abort: bool, error: bool) {
        ClientRequestInner::cancel(&self.inner, abort, error);
    }

    /// Drains the response so the connection can be reused.
    pub fn finish(&self) -> HttpResult<()> {
        ClientRequestInner::finish(&self.inner)
    }
}

impl Drop for ClientRequest {
    fn drop(&mut self) {
        ClientRequestInner::cancel(&self.inner, true, false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::pipe::pipe;

    #[test]
    fn new_connections_allow_requests() {
        let (a, _b) = pipe();
        let conn = ClientConnection::new(a, None);
        assert!(conn.new_requests_allowed());
        assert_eq!(0, conn.outstanding_requests());
    }

    #[test]
    fn transfer_states_order_matches_the_lifecycle() {
        assert!(TransferState::Pending < TransferState::Waiting);
        assert!(TransferState::Waiting < TransferState::Headers);
        assert!(TransferState::Body < TransferState::Complete);
        assert!(TransferState::Complete < TransferState::Canceled);
        assert!(TransferState::Canceled < TransferState::Error);
    }

    #[test]
    fn chunked_must_be_the_last_coding() {
        let mut request = Request::default();
        request
            .general
            .transfer_encoding
            .push(super::super::ValueWithParameters::new("chunked"));
        request
            .general
            .transfer_encoding
            .push(super::super::ValueWithParameters::new("gzip"));
        assert!(matches!(
            ClientRequestInner::validate_request(&request),
            Err(HttpError::InvalidTransferEncoding(_))
        ));
    }
}
