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

//! Server connection with pipelined reception and in-order responses.
//!
//! Requests are consumed strictly in order from the wire, one request
//! fiber at a time; the next fiber is scheduled when the previous request
//! completes on the request side. The application may produce responses
//! out of order, but they are serialized to the wire in request arrival
//! order: a response committed early parks in the waiting-response set
//! until its predecessors have flushed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tracing::{debug, error, info, trace};

use crate::error::{HttpError, HttpResult, StreamError};
use crate::fiber::{Parker, Resumer, Scheduler, Wakeup};
use crate::streams::notify::NotifyStream;
use crate::streams::null::NullStream;
use crate::streams::{transfer, transfer_all, write_all, Anchor, CloseType, Stream, StreamHandle};

use super::client::TransferState;
use super::connection::{body_stream, has_message_body, wrap_transport};
use super::multipart::{random_boundary, Multipart};
use super::parser::{RequestParser, TrailerParser};
use super::{
    is_acceptable, map_get, set_contains, AcceptValueWithParameters, Caseless, ContentRange,
    EntityHeaders, EntityHeadersBlock, MediaType, Method, Request, Response, Status, Version,
};

const NONE_SENTINEL: u64 = u64::MAX;

/// Application entry point for each parsed request.
pub type RequestHandler = Arc<dyn Fn(&Arc<ServerRequest>) -> HttpResult<()> + Send + Sync>;

struct Slot {
    number: u64,
    request_state: TransferState,
    response_state: TransferState,
    response_resumer: Option<Resumer>,
}

struct ServerState {
    pending: VecDeque<Slot>,
    request_count: u64,
    prior_request_failed: u64,
    prior_request_closed: u64,
    prior_response_closed: u64,
}

impl ServerState {
    fn index_of(&self, number: u64) -> Option<usize> {
        let front = self.pending.front()?.number;
        if number < front {
            return None;
        }
        let index = (number - front) as usize;
        (index < self.pending.len()).then_some(index)
    }

    #[cfg(debug_assertions)]
    fn invariant(&self) {
        let mut seen_response_not_done = false;
        for (index, slot) in self.pending.iter().enumerate() {
            assert!(
                slot.request_state < TransferState::Complete
                    || slot.response_state < TransferState::Complete
            );
            if seen_response_not_done {
                assert!(slot.response_state < TransferState::Complete);
            } else {
                seen_response_not_done = slot.response_state < TransferState::Complete;
            }
            if slot.request_state < TransferState::Complete {
                // Only the last request may still be receiving.
                assert_eq!(index + 1, self.pending.len());
            }
            assert_eq!(
                slot.response_state == TransferState::Waiting,
                slot.response_resumer.is_some()
            );
        }
    }

    #[cfg(not(debug_assertions))]
    fn invariant(&self) {}
}

struct ServerInner {
    stream: StreamHandle,
    scheduler: Scheduler,
    handler: RequestHandler,
    state: Mutex<ServerState>,
}

/// One HTTP/1.x server connection.
pub struct ServerConnection {
    inner: Arc<ServerInner>,
}

impl ServerConnection {
    pub fn new(stream: StreamHandle, scheduler: Scheduler, handler: RequestHandler) -> Self {
        let inner = Arc::new(ServerInner {
            stream: wrap_transport(stream),
            scheduler,
            handler,
            state: Mutex::new(ServerState {
                pending: VecDeque::new(),
                request_count: 0,
                prior_request_failed: NONE_SENTINEL,
                prior_request_closed: NONE_SENTINEL,
                prior_response_closed: NONE_SENTINEL,
            }),
        });
        ServerConnection { inner }
    }

    /// Starts the request-reception loop: one request fiber at a time,
    /// each scheduling its successor when it completes.
    pub fn process_requests(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.invariant();
        schedule_next_request(&self.inner, &mut state, None);
    }

    pub fn outstanding_requests(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.invariant();
        state.pending.len()
    }
}

/// Schedules a fresh request fiber when the reception pipeline allows it.
/// Called with the state lock held.
fn schedule_next_request(inner: &Arc<ServerInner>, state: &mut ServerState, prev: Option<u64>) {
    let allowed = match prev {
        None => state.request_count == 0,
        Some(number) => {
            // A slot no longer queued finished both sides.
            number == state.request_count
                && state
                    .index_of(number)
                    .map(|index| state.pending[index].request_state == TransferState::Complete)
                    .unwrap_or(true)
                && state.prior_request_failed == NONE_SENTINEL
                && state.prior_request_closed == NONE_SENTINEL
                && state.prior_response_closed == NONE_SENTINEL
        }
    };
    if !allowed {
        return;
    }
    state.request_count += 1;
    let number = state.request_count;
    state.pending.push_back(Slot {
        number,
        request_state: TransferState::Headers,
        response_state: TransferState::Pending,
        response_resumer: None,
    });
    trace!(number, "scheduling request");
    let request = Arc::new(ServerRequest {
        conn: inner.clone(),
        number,
        request: OnceLock::new(),
        response: Mutex::new(Response::default()),
        request_stream: Mutex::new(None),
        request_framing: Mutex::new(None),
        request_parts: Mutex::new(None),
        response_stream: Mutex::new(None),
        request_trailer: Mutex::new(EntityHeaders::default()),
        response_trailer: Mutex::new(EntityHeaders::default()),
        will_close: AtomicBool::new(false),
        pipeline: AtomicBool::new(false),
        continue_sent: AtomicBool::new(false),
        weak_self: Mutex::new(Weak::new()),
    });
    *request.weak_self.lock().unwrap() = Arc::downgrade(&request);
    let spawned = inner.scheduler.spawn(move || request.do_request());
    if spawned.is_err() {
        error!("scheduler stopped; dropping connection");
    }
}

/// The request side of `number` is complete; maybe hand reception onward.
fn request_complete(inner: &Arc<ServerInner>, request: &ServerRequest) {
    let close;
    {
        let mut state = inner.state.lock().unwrap();
        state.invariant();
        let index = state.index_of(request.number).expect("request still queued");
        debug_assert_eq!(index + 1, state.pending.len());
        debug_assert!(matches!(
            state.pending[index].request_state,
            TransferState::Headers | TransferState::Body
        ));
        trace!(number = request.number, "request complete");
        state.pending[index].request_state = TransferState::Complete;
        let response_done = state.pending[index].response_state >= TransferState::Complete;
        if response_done {
            debug_assert_eq!(0, index);
            state.pending.pop_front();
        }
        close = request.will_close.load(Ordering::Acquire);
        if !close {
            // With the response already flushed (or the handler opting
            // into pipelining) the next request may start now; otherwise
            // reception stays in lock-step with response completion.
            if response_done || request.pipeline.load(Ordering::Acquire) {
                schedule_next_request(inner, &mut state, Some(request.number));
            }
        } else {
            state.prior_request_closed = request.number;
            trace!("closing read side");
        }
    }
    if close && inner.stream.supports_half_close() {
        let _ = inner.stream.close(CloseType::Read);
    }
}

/// The response for `number` is flushed (or flushing); resume the next
/// parked responder, or start the next request fiber.
fn response_complete(inner: &Arc<ServerInner>, request: &ServerRequest) -> HttpResult<()> {
    let will_close = request.will_close.load(Ordering::Acquire);
    {
        let mut state = inner.state.lock().unwrap();
        state.invariant();
        debug_assert_eq!(Some(0), state.index_of(request.number));
        trace!(number = request.number, "response complete");
        let has_next = state.pending.len() > 1;
        if has_next && state.pending[1].response_state == TransferState::Waiting {
            state.pending[0].response_state = TransferState::Complete;
            if state.pending[0].request_state >= TransferState::Complete {
                state.pending.pop_front();
                schedule_next_request(inner, &mut state, Some(request.number));
                let next = &mut state.pending[0];
                next.response_state = TransferState::Headers;
                let resumer = next.response_resumer.take();
                trace!(number = next.number, "scheduling response");
                drop(state);
                if let Some(resumer) = resumer {
                    resumer.resume(Wakeup::Resume);
                }
                return Ok(());
            }
            let next = &mut state.pending[1];
            next.response_state = TransferState::Headers;
            let resumer = next.response_resumer.take();
            trace!(number = next.number, "scheduling response");
            drop(state);
            if let Some(resumer) = resumer {
                resumer.resume(Wakeup::Resume);
            }
            return Ok(());
        }
        if !has_next {
            // The next request may start before our flush completes; we
            // stay at the front until then.
            if state.pending[0].request_state >= TransferState::Complete {
                schedule_next_request(inner, &mut state, Some(request.number));
            }
        }
        if will_close {
            state.prior_response_closed = request.number;
            trace!("closing");
        } else {
            trace!("flushing");
        }
    }
    if will_close {
        if let Err(err) = inner.stream.close(CloseType::Both) {
            request.cancel();
            return Err(err.into());
        }
    } else {
        inner.stream.flush(true)?;
    }
    let mut state = inner.state.lock().unwrap();
    state.invariant();
    debug_assert_eq!(Some(0), state.index_of(request.number));
    state.pending[0].response_state = TransferState::Complete;
    if state.pending[0].request_state >= TransferState::Complete {
        state.pending.pop_front();
    }
    // Someone else may have queued up while we were flushing.
    if let Some(front) = state.pending.front_mut() {
        if front.response_state == TransferState::Waiting {
            front.response_state = TransferState::Headers;
            let resumer = front.response_resumer.take();
            trace!(number = front.number, "scheduling response");
            drop(state);
            if let Some(resumer) = resumer {
                resumer.resume(Wakeup::Resume);
            }
        }
    }
    Ok(())
}

/// Resumes every parked responder at or past the first failure point.
/// Called with the state lock held.
fn schedule_all_waiting_responses(state: &mut ServerState) {
    let first = state
        .prior_request_failed
        .min(state.prior_response_closed);
    if first == NONE_SENTINEL {
        return;
    }
    trace!("scheduling all waiting responses");
    let mut index = state.pending.len();
    while index > 0 {
        index -= 1;
        if state.pending[index].number < first {
            continue;
        }
        if state.pending[index].response_state == TransferState::Waiting {
            let mut slot = state.pending.remove(index).expect("index in range");
            trace!(number = slot.number, "scheduling response");
            if let Some(resumer) = slot.response_resumer.take() {
                resumer.resume(Wakeup::Resume);
            }
        }
    }
}

/// One request/response exchange as seen by the application.
pub struct ServerRequest {
    conn: Arc<ServerInner>,
    number: u64,
    request: OnceLock<Request>,
    response: Mutex<Response>,
    request_stream: Mutex<Option<Arc<NotifyStream>>>,
    request_framing: Mutex<Option<StreamHandle>>,
    request_parts: Mutex<Option<Arc<Multipart>>>,
    response_stream: Mutex<Option<Arc<NotifyStream>>>,
    request_trailer: Mutex<EntityHeaders>,
    response_trailer: Mutex<EntityHeaders>,
    will_close: AtomicBool,
    pipeline: AtomicBool,
    continue_sent: AtomicBool,
    weak_self: Mutex<Weak<ServerRequest>>,
}

impl ServerRequest {
    fn strong(&self) -> Arc<ServerRequest> {
        self.weak_self
            .lock()
            .unwrap()
            .upgrade()
            .expect("request alive")
    }

    /// The parsed request headers.
    pub fn request(&self) -> &Request {
        self.request.get().expect("handler runs after parsing")
    }

    /// The response under construction. Mutate it before `commit`.
    pub fn response(&self) -> MutexGuard<'_, Response> {
        self.response.lock().unwrap()
    }

    pub fn committed(&self) -> bool {
        let state = self.conn.state.lock().unwrap();
        state
            .index_of(self.number)
            .map(|index| state.pending[index].response_state != TransferState::Pending)
            .unwrap_or(true)
    }

    fn request_state(&self) -> TransferState {
        let state = self.conn.state.lock().unwrap();
        state
            .index_of(self.number)
            .map(|index| state.pending[index].request_state)
            .unwrap_or(TransferState::Complete)
    }

    fn response_state(&self) -> TransferState {
        let state = self.conn.state.lock().unwrap();
        state
            .index_of(self.number)
            .map(|index| state.pending[index].response_state)
            .unwrap_or(TransferState::Complete)
    }

    pub fn has_request_body(&self) -> bool {
        if self.request_stream.lock().unwrap().is_some() {
            return true;
        }
        let request = self.request();
        has_message_body(
            &request.general,
            &request.entity,
            &request.request_line.method,
            None,
            false,
        )
    }

    /// The stream the request body is read from. Sends `100 Continue`
    /// first when the client expects it.
    pub fn request_stream(&self) -> HttpResult<StreamHandle> {
        if let Some(stream) = self.request_stream.lock().unwrap().as_ref() {
            return Ok(stream.clone() as StreamHandle);
        }
        debug_assert!(!self
            .request()
            .entity
            .content_type
            .as_ref()
            .is_some_and(MediaType::is_multipart));
        self.send_continue()?;
        let request = self.request();
        let body = body_stream(&self.conn.stream, &request.general, &request.entity, true);
        let done = self.strong();
        body.notify.on_eof(move || {
            done.request_done();
        });
        let failed = self.strong();
        body.notify.on_exception(move || {
            failed.cancel();
        });
        *self.request_framing.lock().unwrap() = body.framing.clone();
        *self.request_stream.lock().unwrap() = Some(body.notify.clone());
        Ok(body.notify as StreamHandle)
    }

    /// Multipart reader over the request body.
    pub fn request_multipart(&self) -> HttpResult<Arc<Multipart>> {
        let boundary = {
            let request = self.request();
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
        self.send_continue()?;
        let request = self.request();
        let body = body_stream(&self.conn.stream, &request.general, &request.entity, true);
        let failed = self.strong();
        body.notify.on_exception(move || {
            failed.cancel();
        });
        *self.request_framing.lock().unwrap() = body.framing.clone();
        *self.request_stream.lock().unwrap() = Some(body.notify.clone());
        let multipart = Multipart::read(body.notify as StreamHandle, &boundary)?;
        let done = self.strong();
        multipart.on_finished(move || {
            done.request_done();
        });
        *self.request_parts.lock().unwrap() = Some(multipart.clone());
        Ok(multipart)
    }

    fn send_continue(&self) -> HttpResult<()> {
        let expects_continue = self
            .request()
            .request
            .expect
            .iter()
            .any(|e| e.key.eq_ignore_ascii_case("100-continue"));
        if expects_continue && !self.continue_sent.swap(true, Ordering::AcqRel) {
            debug!(number = self.number, "100 Continue");
            write_all(&*self.conn.stream, b"HTTP/1.1 100 Continue\r\n\r\n")?;
            self.conn.stream.flush(false)?;
        }
        Ok(())
    }

    /// Trailer received after a chunked request body.
    pub fn request_trailer(&self) -> EntityHeaders {
        debug_assert_eq!(TransferState::Complete, self.request_state());
        self.request_trailer.lock().unwrap().clone()
    }

    /// Trailer to send after a chunked response body.
    pub fn set_response_trailer(&self, trailer: EntityHeaders) {
        *self.response_trailer.lock().unwrap() = trailer;
    }

    pub fn has_response_body(&self) -> bool {
        if self.response_stream.lock().unwrap().is_some() {
            return true;
        }
        let response = self.response.lock().unwrap();
        has_message_body(
            &response.general,
            &response.entity,
            &self.request().request_line.method,
            Some(response.status.status),
            false,
        )
    }

    /// The stream the response body is written into; close it to complete
    /// the response. Commits the headers first.
    pub fn response_stream(&self) -> HttpResult<StreamHandle> {
        if let Some(stream) = self.response_stream.lock().unwrap().as_ref() {
            return Ok(stream.clone() as StreamHandle);
        }
        self.commit()?;
        let response = self.response.lock().unwrap();
        let body = body_stream(&self.conn.stream, &response.general, &response.entity, false);
        drop(response);
        let done = self.strong();
        body.notify.on_close(move || {
            if done.response_done().is_err() {
                trace!(number = done.number, "response teardown failed");
            }
        });
        let failed = self.strong();
        body.notify.on_exception(move || {
            failed.cancel();
        });
        *self.response_stream.lock().unwrap() = Some(body.notify.clone());
        Ok(body.notify as StreamHandle)
    }

    /// Multipart writer over the response body.
    pub fn response_multipart(&self) -> HttpResult<Arc<Multipart>> {
        let boundary = {
            let response = self.response.lock().unwrap();
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
        let stream = self.response_stream()?;
        let multipart = Multipart::write(stream, &boundary)?;
        let done = self.strong();
        multipart.on_finished(move || {
            if let Some(stream) = done.response_stream.lock().unwrap().clone() {
                let _ = stream.close(CloseType::Both);
            }
        });
        Ok(multipart)
    }

    /// Lets the next pipelined request start before this one's response
    /// is finished. The response still goes out in order.
    pub fn process_next_request(&self) {
        self.pipeline.store(true, Ordering::Release);
        let mut state = self.conn.state.lock().unwrap();
        state.invariant();
        schedule_next_request(&self.conn, &mut state, Some(self.number));
    }

    /// Commits the response headers to the wire, parking until every
    /// earlier response has flushed.
    pub fn commit(&self) -> HttpResult<()> {
        if self.committed() {
            return Ok(());
        }
        let (text, has_body) = {
            let mut response = self.response.lock().unwrap();
            if set_contains(&response.general.connection, "close") {
                self.will_close.store(true, Ordering::Release);
            }
            if response.status.ver.is_none() {
                response.status.ver = self
                    .request()
                    .request_line
                    .ver
                    .or(Some(Version::HTTP_1_1));
            }
            let ver = response.status.ver.expect("version defaulted above");
            debug_assert!(ver == Version::HTTP_1_0 || ver == Version::HTTP_1_1);

            // Use chunked for undelimited bodies on 1.1, or force the
            // connection closed on 1.0.
            if response.entity.content_length.is_none()
                && response.general.transfer_encoding.is_empty()
                && !response
                    .entity
                    .content_type
                    .as_ref()
                    .is_some_and(MediaType::is_multipart)
            {
                if ver == Version::HTTP_1_1
                    && is_acceptable(
                        &self.request().request.te,
                        &AcceptValueWithParameters::new("chunked"),
                        true,
                    )
                {
                    response
                        .general
                        .transfer_encoding
                        .push(super::ValueWithParameters::new("chunked"));
                } else {
                    self.will_close.store(true, Ordering::Release);
                }
            }
            debug_assert!(
                ver >= Version::HTTP_1_1 || response.general.transfer_encoding.is_empty(),
                "transfer encodings are 1.1-only"
            );
            if self.will_close.load(Ordering::Acquire) {
                response.general.connection.insert(Caseless::from("close"));
            } else if ver == Version::HTTP_1_0 {
                response
                    .general
                    .connection
                    .insert(Caseless::from("Keep-Alive"));
            }
            debug_assert!(
                response.status.status != Status::Unauthorized
                    || !response.response.www_authenticate.is_empty()
            );
            let has_body = has_message_body(
                &response.general,
                &response.entity,
                &self.request().request_line.method,
                Some(response.status.status),
                false,
            );
            (response.to_string(), has_body)
        };

        let will_close = self.will_close.load(Ordering::Acquire);
        let parker = {
            let mut state = self.conn.state.lock().unwrap();
            state.invariant();
            if state.prior_request_failed < self.number
                || state.prior_response_closed < self.number
            {
                if let Some(index) = state.index_of(self.number) {
                    state.pending.remove(index);
                }
                return Err(if state.prior_request_failed < self.number {
                    HttpError::PriorRequestFailed
                } else {
                    HttpError::ConnectionVoluntarilyClosed
                });
            }
            let index = state
                .index_of(self.number)
                .ok_or(HttpError::PriorRequestFailed)?;
            if index != 0 {
                let parker = Parker::new();
                state.pending[index].response_resumer = Some(parker.resumer());
                state.pending[index].response_state = TransferState::Waiting;
                trace!(number = self.number, "waiting to respond");
                Some(parker)
            } else {
                state.pending[index].response_state = TransferState::Headers;
                trace!(number = self.number, "responding");
                if will_close {
                    state.prior_response_closed = self.number;
                    schedule_all_waiting_responses(&mut state);
                }
                None
            }
        };

        if let Some(parker) = parker {
            let wakeup = parker.park();
            trace!(number = self.number, "responding");
            let mut state = self.conn.state.lock().unwrap();
            state.invariant();
            if wakeup == Wakeup::Abort {
                return Err(HttpError::Stream(StreamError::OperationAborted));
            }
            if state.prior_request_failed <= self.number {
                return Err(HttpError::PriorRequestFailed);
            }
            if state.prior_response_closed <= self.number {
                return Err(HttpError::ConnectionVoluntarilyClosed);
            }
            debug_assert_eq!(Some(0), state.index_of(self.number));
            if will_close {
                state.prior_response_closed = self.number;
                schedule_all_waiting_responses(&mut state);
            }
            if let Some(0) = state.index_of(self.number) {
                state.pending[0].response_state = TransferState::Headers;
            }
        }

        // Write the headers.
        debug!(number = self.number, "response headers");
        match write_all(&*self.conn.stream, text.as_bytes()) {
            Ok(()) => {
                if !has_body {
                    trace!(number = self.number, "no response body");
                    self.response_done()
                } else {
                    let mut state = self.conn.state.lock().unwrap();
                    if let Some(0) = state.index_of(self.number) {
                        state.pending[0].response_state = TransferState::Body;
                    }
                    Ok(())
                }
            }
            Err(err) => {
                let mut state = self.conn.state.lock().unwrap();
                state.invariant();
                state.prior_request_failed = state.prior_request_failed.min(self.number);
                schedule_all_waiting_responses(&mut state);
                Err(err.into())
            }
        }
    }

    /// The request body hit EOF: read the trailer when chunked, then mark
    /// the request side complete.
    fn request_done(&self) {
        trace!(number = self.number, "request body complete");
        if let Some(stream) = self.request_stream.lock().unwrap().as_ref() {
            stream.clear_callbacks();
        }
        let framing = self.request_framing.lock().unwrap().take();
        if let Some(framing) = framing {
            let _ = transfer_all(&*framing, &*NullStream::handle());
        }
        if !self.request().general.transfer_encoding.is_empty() {
            let mut parser = TrailerParser::new();
            let result = parser.run(&*self.conn.stream);
            if result.is_err() || parser.error() || !parser.complete() {
                self.cancel();
                return;
            }
            *self.request_trailer.lock().unwrap() = parser.into_message();
        }
        request_complete(&self.conn, self);
    }

    /// The response body completed: emit the trailer when chunked, then
    /// release the write path.
    fn response_done(&self) -> HttpResult<()> {
        trace!(number = self.number, "response body complete");
        if let Some(stream) = self.response_stream.lock().unwrap().as_ref() {
            stream.clear_callbacks();
        }
        let chunked = !self
            .response
            .lock()
            .unwrap()
            .general
            .transfer_encoding
            .is_empty();
        if chunked && self.request().request_line.method != Method::Head {
            let trailer = self.response_trailer.lock().unwrap();
            let text = format!("{}\r\n", EntityHeadersBlock(&trailer));
            drop(trailer);
            write_all(&*self.conn.stream, text.as_bytes())?;
        }
        info!(
            number = self.number,
            line = %self.request().request_line,
            status = %self.response.lock().unwrap().status.status,
            "served"
        );
        response_complete(&self.conn, self)
    }

    /// Aborts the exchange; later pipelined responders are poisoned.
    pub fn cancel(&self) {
        let mut state = self.conn.state.lock().unwrap();
        state.invariant();
        let Some(index) = state.index_of(self.number) else {
            return;
        };
        {
            let slot = &mut state.pending[index];
            if slot.request_state >= TransferState::Complete
                && slot.response_state >= TransferState::Complete
            {
                return;
            }
            trace!(number = self.number, "aborting");
            if slot.request_state < TransferState::Complete {
                slot.request_state = TransferState::Error;
            }
            if slot.response_state < TransferState::Complete {
                slot.response_state = TransferState::Error;
            }
        }
        self.conn.stream.cancel_read();
        self.conn.stream.cancel_write();
        state.prior_request_failed = state.prior_request_failed.min(self.number);
        state.pending.remove(index);
        schedule_all_waiting_responses(&mut state);
    }

    /// Commits a default response when none was produced and drains any
    /// unread request body, leaving the connection reusable.
    pub fn finish(&self) -> HttpResult<()> {
        if self.response_state() < TransferState::Complete {
            if self.committed() && self.has_response_body() {
                self.cancel();
                return Ok(());
            }
            self.commit()?;
            if self.has_response_body() {
                self.cancel();
                return Ok(());
            }
        }
        if self.request_state() == TransferState::Body && !self.will_close.load(Ordering::Acquire)
        {
            if self
                .request()
                .entity
                .content_type
                .as_ref()
                .is_some_and(MediaType::is_multipart)
            {
                let multipart = match self.request_parts.lock().unwrap().clone() {
                    Some(multipart) => multipart,
                    None => self.request_multipart()?,
                };
                while multipart.next_part()?.is_some() {}
            } else {
                let stream = self.request_stream()?;
                transfer_all(&*stream, &*NullStream::handle())?;
            }
        }
        Ok(())
    }

    /// Reception fiber: parse, validate, dispatch, tear down.
    fn do_request(&self) {
        debug_assert_eq!(TransferState::Headers, self.request_state());
        let mut parser = RequestParser::new();
        let consumed = match parser.run(&*self.conn.stream) {
            Ok(consumed) => consumed,
            Err(_) => {
                self.cancel();
                return;
            }
        };
        if consumed == 0 && !parser.error() && !parser.complete() {
            // Clean EOF between requests.
            self.cancel();
            return;
        }
        if parser.error() || !parser.complete() {
            {
                let mut state = self.conn.state.lock().unwrap();
                if let Some(index) = state.index_of(self.number) {
                    state.pending[index].request_state = TransferState::Error;
                }
                state.prior_request_closed = self.number;
            }
            let _ = respond_error(self, Status::BadRequest, "Unable to parse request.", true);
            return;
        }
        let request = parser.into_message();
        debug!(number = self.number, line = %request.request_line, "request headers");
        self.request.set(request).ok().expect("parsed once");
        let request = self.request();

        let ver = request.request_line.ver.expect("parser always sets it");
        if ver.major != 1 {
            self.mark_request_error();
            let _ = respond_error(self, Status::HttpVersionNotSupported, "", true);
            return;
        }
        if ver == Version::HTTP_1_0 && !set_contains(&request.general.connection, "Keep-Alive") {
            self.will_close.store(true, Ordering::Release);
        }
        if set_contains(&request.general.connection, "close") {
            self.will_close.store(true, Ordering::Release);
        }
        if ver >= Version::HTTP_1_1 && request.request.host.is_empty() {
            self.mark_request_error();
            let _ = respond_error(
                self,
                Status::BadRequest,
                "Host header is required with HTTP/1.1",
                true,
            );
            return;
        }

        // Validate the coding stack, ignoring identity entries (the body
        // derivation skips them too).
        {
            let codings: Vec<super::ValueWithParameters> = request
                .general
                .transfer_encoding
                .iter()
                .filter(|coding| !coding.value.eq_ignore_ascii_case("identity"))
                .cloned()
                .collect();
            if !codings.is_empty() {
                let last = codings.last().expect("non-empty list");
                if !last.value.eq_ignore_ascii_case("chunked") {
                    self.mark_request_error();
                    let _ = respond_error(
                        self,
                        Status::BadRequest,
                        "The last transfer-coding is not chunked.",
                        true,
                    );
                    return;
                }
                if !last.parameters.is_empty() {
                    self.mark_request_error();
                    let _ = respond_error(
                        self,
                        Status::NotImplemented,
                        "Unknown parameter to chunked transfer-coding.",
                        true,
                    );
                    return;
                }
                for coding in &codings[..codings.len() - 1] {
                    let value = coding.value.as_str();
                    if value.eq_ignore_ascii_case("chunked") {
                        self.mark_request_error();
                        let _ = respond_error(
                            self,
                            Status::BadRequest,
                            "chunked transfer-coding applied multiple times.",
                            true,
                        );
                        return;
                    } else if value.eq_ignore_ascii_case("deflate")
                        || value.eq_ignore_ascii_case("gzip")
                        || value.eq_ignore_ascii_case("x-gzip")
                    {
                        // Supported codings.
                    } else if value.eq_ignore_ascii_case("compress")
                        || value.eq_ignore_ascii_case("x-compress")
                    {
                        self.mark_request_error();
                        let _ = respond_error(
                            self,
                            Status::NotImplemented,
                            "compress transfer-coding is not supported",
                            false,
                        );
                        return;
                    } else {
                        self.mark_request_error();
                        let _ = respond_error(
                            self,
                            Status::NotImplemented,
                            &format!("Unrecognized transfer-coding: {value}"),
                            false,
                        );
                        return;
                    }
                }
            }
        }

        // Check expectations.
        for expectation in &request.request.expect {
            if expectation.key.eq_ignore_ascii_case("100-continue") {
                if !expectation.value.is_empty() || !expectation.parameters.is_empty() {
                    self.mark_request_error();
                    let _ = respond_error(
                        self,
                        Status::ExpectationFailed,
                        "Unrecognized parameters to 100-continue expectation",
                        false,
                    );
                    return;
                }
            } else {
                self.mark_request_error();
                let _ = respond_error(
                    self,
                    Status::ExpectationFailed,
                    &format!("Unrecognized expectation: {}", expectation.key),
                    false,
                );
                return;
            }
        }

        if !has_message_body(
            &request.general,
            &request.entity,
            &request.request_line.method,
            None,
            false,
        ) {
            trace!(number = self.number, "no request body");
            request_complete(&self.conn, self);
        } else {
            let mut state = self.conn.state.lock().unwrap();
            if let Some(index) = state.index_of(self.number) {
                state.pending[index].request_state = TransferState::Body;
            }
        }

        let handler = self.conn.handler.clone();
        let this = self.strong();
        let result = handler(&this);
        match result {
            Ok(()) => {
                let _ = self.finish();
            }
            Err(HttpError::Stream(StreamError::OperationAborted)) => {
                // A pipelined request failed because a prior one closed
                // the connection.
            }
            Err(err) => {
                error!(number = self.number, %err, "handler failed");
                if self.response_state() < TransferState::Complete && !self.committed() {
                    let _ = respond_error(self, Status::InternalServerError, "", false);
                } else {
                    let _ = self.finish();
                }
            }
        }
    }

    fn mark_request_error(&self) {
        let mut state = self.conn.state.lock().unwrap();
        if let Some(index) = state.index_of(self.number) {
            state.pending[index].request_state = TransferState::Error;
        }
    }
}

/// Produces a plain-text error response. Only valid before the response
/// has been committed.
pub fn respond_error(
    request: &ServerRequest,
    status: Status,
    message: &str,
    close_connection: bool,
) -> HttpResult<()> {
    debug_assert!(!request.committed());
    {
        let mut response = request.response();
        response.status.status = status;
        if close_connection {
            response.general.connection.insert(Caseless::from("close"));
        }
        response.general.transfer_encoding.clear();
        response.entity.content_length = Some(message.len() as u64);
        response.entity.content_type = None;
        if !message.is_empty() {
            response.entity.content_type = Some(MediaType::new("text", "plain"));
        }
    }
    if !message.is_empty() {
        let stream = request.response_stream()?;
        write_all(&*stream, message.as_bytes())?;
        stream.close(CloseType::Both)?;
        Ok(())
    } else {
        request.finish()
    }
}

/// Serves `source` as the response entity, honoring single and multiple
/// byte ranges and the client's TE preferences.
pub fn respond_stream(request: &ServerRequest, source: StreamHandle) -> HttpResult<()> {
    debug_assert!(!request.committed());
    let size = if source.supports_size() {
        Some(source.size()?)
    } else {
        None
    };
    {
        let mut response = request.response();
        response
            .response
            .accept_ranges
            .insert(Caseless::from("bytes"));
        response.general.transfer_encoding.clear();
    }
    let range = request.request().request.range.clone();
    let head = request.request().request_line.method == Method::Head;
    let mut full_entity = range.is_empty();

    // Validate the range set; anything dubious falls back to the full
    // entity.
    let mut previous_last = 0u64;
    for (index, (first, last)) in range.iter().enumerate() {
        match (first, last) {
            (Some(first), Some(last)) if first > last => {
                full_entity = true;
                break;
            }
            // Suffix or open-ended ranges need a known size.
            (None, _) if size.is_none() => {
                full_entity = true;
                break;
            }
            (_, None) if size.is_none() => {
                full_entity = true;
                break;
            }
            _ => {}
        }
        let size_known = size.unwrap_or(u64::MAX);
        if let Some(first) = first {
            if *first >= size_known && size.is_some() {
                return respond_error(request, Status::RangeNotSatisfiable, "", false);
            }
        }
        if first.is_none() && last.map(|last| last >= size_known).unwrap_or(false) {
            full_entity = true;
            break;
        }
        if *first == Some(0) && last.map(|last| last + 1 >= size_known).unwrap_or(true) {
            full_entity = true;
            break;
        }
        if index > 0 {
            let start = first.unwrap_or_else(|| size_known.saturating_sub(last.unwrap_or(0)));
            if start <= previous_last && !source.supports_seek() {
                full_entity = true;
                break;
            }
        }
        previous_last = match (first, last) {
            (None, Some(_)) => size_known - 1,
            (_, Some(last)) => *last,
            (_, None) => size_known - 1,
        };
    }

    if !full_entity && range.len() > 1 {
        // multipart/byteranges
        let content_type = request.response().entity.content_type.clone();
        let boundary = random_boundary();
        {
            let mut response = request.response();
            response.status.status = Status::PartialContent;
            response.entity.content_length = None;
            let mut media = MediaType::new("multipart", "byteranges");
            media
                .parameters
                .insert(Caseless::from("boundary"), boundary.clone());
            response.entity.content_type = Some(media);
        }
        if !head {
            let size_known = size.expect("multi-range requires a known size");
            let multipart = request.response_multipart()?;
            let mut current_pos = 0u64;
            for (first, last) in &range {
                let part = multipart.next_part()?.expect("writer always has a part");
                let (from, to) = resolve_range(*first, *last, size_known);
                let mut headers = EntityHeaders::default();
                headers.content_type = content_type.clone();
                headers.content_range = Some(ContentRange {
                    first: Some(from),
                    last: Some(to),
                    instance: Some(size_known),
                });
                part.set_headers(headers);
                let part_stream = part.stream()?;
                if source.supports_seek() {
                    source.seek(from as i64, Anchor::Begin)?;
                } else {
                    transfer(&*source, &*NullStream::handle(), from - current_pos)?;
                }
                transfer(&*source, &*part_stream, to - from + 1)?;
                part_stream.close(CloseType::Both)?;
                current_pos = to + 1;
            }
            multipart.finish()?;
        } else {
            request.commit()?;
            request.finish()?;
        }
        return Ok(());
    }

    if !full_entity {
        let size_known = size.expect("validated above");
        let (first, last) = range[0];
        let (from, to) = resolve_range(first, last, size_known);
        {
            let mut response = request.response();
            response.entity.content_range = Some(ContentRange {
                first: Some(from),
                last: Some(to),
                instance: Some(size_known),
            });
            response.status.status = Status::PartialContent;
            response.entity.content_length = Some(to - from + 1);
        }
        if !head {
            if source.supports_seek() {
                source.seek(from as i64, Anchor::Begin)?;
            } else {
                match transfer(&*source, &*NullStream::handle(), from) {
                    Ok(_) => {}
                    Err(StreamError::UnexpectedEof) => {
                        return respond_error(request, Status::RangeNotSatisfiable, "", false);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            let stream = request.response_stream()?;
            transfer(&*source, &*stream, to - from + 1)?;
            stream.close(CloseType::Both)?;
        } else {
            request.commit()?;
            request.finish()?;
        }
        return Ok(());
    }

    // Full entity.
    {
        let mut response = request.response();
        response.entity.content_length = size;
    }
    let client_ver = request.request().request_line.ver.unwrap_or(Version::HTTP_1_0);
    if client_ver >= Version::HTTP_1_1 {
        let available = vec![
            AcceptValueWithParameters::with_qvalue("deflate", 1000),
            AcceptValueWithParameters::with_qvalue("gzip", 500),
            AcceptValueWithParameters::with_qvalue("x-gzip", 500),
        ];
        let preferred_coding =
            super::preferred(&request.request().request.te, &available).cloned();
        let mut response = request.response();
        if let Some(coding) = preferred_coding {
            response
                .general
                .transfer_encoding
                .push(super::ValueWithParameters::new(&coding.value));
        }
        let chunked_ok = is_acceptable(
            &request.request().request.te,
            &AcceptValueWithParameters::new("chunked"),
            true,
        );
        if (size.is_none() && chunked_ok) || !response.general.transfer_encoding.is_empty() {
            response
                .general
                .transfer_encoding
                .push(super::ValueWithParameters::new("chunked"));
        } else if size.is_none() {
            response.general.connection.insert(Caseless::from("close"));
        }
        // A coded body has no predictable length.
        if !response.general.transfer_encoding.is_empty() {
            response.entity.content_length = None;
        }
    } else if size.is_none() {
        request
            .response()
            .general
            .connection
            .insert(Caseless::from("close"));
    }
    if !head {
        let stream = request.response_stream()?;
        transfer_all(&*source, &*stream)?;
        stream.close(CloseType::Both)?;
    } else {
        request.commit()?;
        request.finish()?;
    }
    Ok(())
}

fn resolve_range(first: Option<u64>, last: Option<u64>, size: u64) -> (u64, u64) {
    match (first, last) {
        // Suffix range: the last `last` bytes.
        (None, Some(suffix)) => {
            let from = size.saturating_sub(suffix);
            (from, size - 1)
        }
        (Some(first), Some(last)) => (first, last.min(size - 1)),
        (Some(first), None) => (first, size - 1),
        (None, None) => (0, size - 1),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn suffix_ranges_resolve_from_the_end() {
        assert_eq!((90, 99), resolve_range(None, Some(10), 100));
        assert_eq!((0, 99), resolve_range(None, Some(500), 100));
    }

    #[test]
    fn open_ended_ranges_run_to_the_end() {
        assert_eq!((20, 99), resolve_range(Some(20), None, 100));
        assert_eq!((0, 9), resolve_range(Some(0), Some(9), 100));
        assert_eq!((0, 99), resolve_range(Some(0), Some(1000), 100));
    }
}
