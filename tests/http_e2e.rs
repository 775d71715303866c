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

//! End-to-end exercises of the HTTP engine over an in-memory pipe.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand::buffer::Buffer;
use strand::error::HttpError;
use strand::fiber::Scheduler;
use strand::http::client::ClientConnection;
use strand::http::server::{respond_error, respond_stream, RequestHandler, ServerConnection};
use strand::http::{map_get, set_contains, Caseless, Method, Request, Status, Version};
use strand::streams::buffered::BufferedStream;
use strand::streams::memory::MemoryStream;
use strand::streams::pipe::pipe;
use strand::streams::{get_delimited, read_exact, transfer_all, write_all, CloseType};
use strand::StreamHandle;

/// Starts a scheduler with trace output captured by the test harness.
fn scheduler(workers: usize) -> Scheduler {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });
    Scheduler::new(workers)
}

/// Wraps a raw pipe end so a scripted peer can `get_delimited` from it;
/// writes keep going to the raw end.
fn reader(end: &StreamHandle) -> StreamHandle {
    let buffered = BufferedStream::new(end.clone(), false);
    buffered.allow_partial_reads(true);
    Arc::new(buffered)
}

fn get(uri: &str) -> Request {
    let mut request = Request::default();
    request.request_line.method = Method::Get;
    request.request_line.uri = uri.to_string();
    request.request.host = "example.com".to_string();
    request
}

#[test]
fn simple_round_trip() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let handler: RequestHandler = Arc::new(|request| {
        assert_eq!("/hello", request.request().request_line.uri);
        {
            let mut response = request.response();
            response.entity.content_length = Some(5);
        }
        let body = request.response_stream()?;
        write_all(&*body, b"world")?;
        body.close(CloseType::Both)?;
        Ok(())
    });
    let server = ServerConnection::new(server_end, scheduler.clone(), handler);
    server.process_requests();

    let conn = ClientConnection::new(client_end, None);
    let request = conn.request(get("/hello")).unwrap();
    let response = request.response().unwrap();
    assert_eq!(Status::Ok, response.status.status);
    assert_eq!(Some(5), response.entity.content_length);
    let body = request.response_stream().unwrap();
    let mut out = Buffer::new();
    read_exact(&*body, &mut out, 5).unwrap();
    assert_eq!(out.to_vec(), b"world");
    assert_eq!(0, body.read(&mut out, 1).unwrap());
    assert!(conn.new_requests_allowed());

    scheduler.stop();
}

#[test]
fn connection_reuse_across_sequential_requests() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let counter = Arc::new(Mutex::new(0u32));
    let seen = counter.clone();
    let handler: RequestHandler = Arc::new(move |request| {
        *seen.lock().unwrap() += 1;
        respond_error(request, Status::NoContent, "", false)
    });
    ServerConnection::new(server_end, scheduler.clone(), handler).process_requests();

    let conn = ClientConnection::new(client_end, None);
    for index in 0..3 {
        let request = conn.request(get(&format!("/{index}"))).unwrap();
        let response = request.response().unwrap();
        assert_eq!(Status::NoContent, response.status.status);
        request.finish().unwrap();
    }
    assert_eq!(3, *counter.lock().unwrap());
    assert!(conn.new_requests_allowed());

    scheduler.stop();
}

#[test]
fn chunked_response_round_trips_with_trailer() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    // Scripted peer: read the request, answer with a chunked body.
    let peer = std::thread::spawn(move || {
        let lines = reader(&server_end);
        loop {
            let line = get_delimited(&*lines, b"\n", false).unwrap();
            if line == b"\r\n" {
                break;
            }
        }
        write_all(
            &*server_end,
            b"HTTP/1.1 200 OK\r\n\
              Transfer-Encoding: chunked\r\n\
              \r\n\
              a\r\nhelloworld\r\n0\r\n\r\n",
        )
        .unwrap();
    });

    let conn = ClientConnection::new(client_end, None);
    let request = conn.request(get("/chunked")).unwrap();
    let response = request.response().unwrap();
    assert_eq!(Status::Ok, response.status.status);
    assert_eq!(1, response.general.transfer_encoding.len());
    let body = request.response_stream().unwrap();
    let sink = MemoryStream::new();
    transfer_all(&*body, &sink).unwrap();
    assert_eq!(sink.to_vec(), b"helloworld");
    assert!(request.response_trailer().is_ok());

    peer.join().unwrap();
    scheduler.stop();
}

/// Three pipelined requests; the peer answers the first with
/// `Connection: close` only after all three sets of headers are on the
/// wire. The two later requests must surface
/// `ConnectionVoluntarilyClosed`, and the connection must not be
/// reusable.
#[test]
fn pipelined_requests_poisoned_by_peer_close() {
    let scheduler = scheduler(4);
    let (client_end, server_end) = pipe();

    let peer_end = server_end.clone();
    let peer = std::thread::spawn(move || {
        let lines = reader(&peer_end);
        // Read three full header blocks.
        for _ in 0..3 {
            loop {
                let line = get_delimited(&*lines, b"\n", false).unwrap();
                if line == b"\r\n" {
                    break;
                }
            }
        }
        write_all(
            &*peer_end,
            b"HTTP/1.1 200 OK\r\n\
              Connection: close\r\n\
              Content-Length: 2\r\n\
              \r\n\
              ok",
        )
        .unwrap();
    });

    let conn = Arc::new(ClientConnection::new(client_end, None));
    let results: Arc<Mutex<Vec<(usize, Result<Status, HttpError>)>>> =
        Arc::new(Mutex::new(Vec::new()));

    let mut fibers = Vec::new();
    for index in 0..3 {
        let conn = conn.clone();
        let results = results.clone();
        fibers.push(
            scheduler
                .spawn(move || {
                    let outcome = (|| {
                        let request = conn.request(get(&format!("/{index}")))?;
                        let status = request.response()?.status.status;
                        request.finish()?;
                        Ok(status)
                    })();
                    results.lock().unwrap().push((index, outcome));
                })
                .unwrap(),
        );
        // Keep submission order deterministic.
        std::thread::sleep(Duration::from_millis(20));
    }

    peer.join().unwrap();
    scheduler.wait_idle();

    let results = results.lock().unwrap();
    assert_eq!(3, results.len());
    for (index, outcome) in results.iter() {
        match index {
            0 => assert_eq!(Status::Ok, *outcome.as_ref().unwrap()),
            _ => assert!(
                matches!(outcome, Err(HttpError::ConnectionVoluntarilyClosed)),
                "request {index} got {outcome:?}"
            ),
        }
    }
    assert!(!conn.new_requests_allowed());
    assert!(matches!(
        conn.request(get("/again")),
        Err(HttpError::ConnectionVoluntarilyClosed)
    ));

    scheduler.stop();
}

/// `Range: bytes=0-9,20-29` against a 100-byte entity produces a 206
/// `multipart/byteranges` response whose two parts carry the right
/// `Content-Range` headers and slices.
#[test]
fn multi_range_request_is_served_as_byteranges() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let entity: Vec<u8> = (0..100u8).collect();
    let source = entity.clone();
    let handler: RequestHandler = Arc::new(move |request| {
        let stream = Arc::new(MemoryStream::from(&source));
        respond_stream(request, stream)
    });
    ServerConnection::new(server_end, scheduler.clone(), handler).process_requests();

    let conn = ClientConnection::new(client_end, None);
    let mut headers = get("/entity");
    headers.request.range = vec![(Some(0), Some(9)), (Some(20), Some(29))];
    let request = conn.request(headers).unwrap();
    let response = request.response().unwrap();
    assert_eq!(Status::PartialContent, response.status.status);
    let content_type = response.entity.content_type.clone().unwrap();
    assert!(content_type.is_multipart());
    assert_eq!("byteranges", content_type.subtype);

    let multipart = request.response_multipart().unwrap();

    let part = multipart.next_part().unwrap().unwrap();
    let range = part.headers().content_range.unwrap();
    assert_eq!((Some(0), Some(9), Some(100)), (range.first, range.last, range.instance));
    let sink = MemoryStream::new();
    transfer_all(&*part.stream().unwrap(), &sink).unwrap();
    assert_eq!(sink.to_vec(), &entity[0..10]);

    let part = multipart.next_part().unwrap().unwrap();
    let range = part.headers().content_range.unwrap();
    assert_eq!((Some(20), Some(29), Some(100)), (range.first, range.last, range.instance));
    let sink = MemoryStream::new();
    transfer_all(&*part.stream().unwrap(), &sink).unwrap();
    assert_eq!(sink.to_vec(), &entity[20..30]);

    assert!(multipart.next_part().unwrap().is_none());

    scheduler.stop();
}

/// A single range comes back as `206` with `Content-Range`.
#[test]
fn single_range_request_is_served_with_content_range() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let entity: Vec<u8> = (0..100u8).collect();
    let source = entity.clone();
    let handler: RequestHandler = Arc::new(move |request| {
        let stream = Arc::new(MemoryStream::from(&source));
        respond_stream(request, stream)
    });
    ServerConnection::new(server_end, scheduler.clone(), handler).process_requests();

    let conn = ClientConnection::new(client_end, None);
    let mut headers = get("/entity");
    headers.request.range = vec![(Some(10), Some(19))];
    let request = conn.request(headers).unwrap();
    let response = request.response().unwrap();
    assert_eq!(Status::PartialContent, response.status.status);
    assert_eq!(Some(10), response.entity.content_length);
    let range = response.entity.content_range.unwrap();
    assert_eq!((Some(10), Some(19), Some(100)), (range.first, range.last, range.instance));
    let body = request.response_stream().unwrap();
    let sink = MemoryStream::new();
    transfer_all(&*body, &sink).unwrap();
    assert_eq!(sink.to_vec(), &entity[10..20]);

    scheduler.stop();
}

/// The server must answer `Expect: 100-continue` with an interim response
/// before reading the body.
#[test]
fn expect_continue_gets_an_interim_response() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler: RequestHandler = Arc::new(move |request| {
        let body = request.request_stream()?;
        let collect = MemoryStream::new();
        transfer_all(&*body, &collect)?;
        *sink.lock().unwrap() = collect.to_vec();
        respond_error(request, Status::NoContent, "", false)
    });
    ServerConnection::new(server_end, scheduler.clone(), handler).process_requests();

    // Scripted client.
    write_all(
        &*client_end,
        b"POST /upload HTTP/1.1\r\n\
          Host: example.com\r\n\
          Expect: 100-continue\r\n\
          Content-Length: 4\r\n\
          \r\n",
    )
    .unwrap();
    let lines = reader(&client_end);
    let interim = get_delimited(&*lines, b"\n", false).unwrap();
    assert_eq!(interim, b"HTTP/1.1 100 Continue\r\n");
    let blank = get_delimited(&*lines, b"\n", false).unwrap();
    assert_eq!(blank, b"\r\n");
    write_all(&*client_end, b"data").unwrap();
    let status_line = get_delimited(&*lines, b"\n", false).unwrap();
    assert_eq!(status_line, b"HTTP/1.1 204 No Content\r\n");

    // Wait for the handler to finish.
    for _ in 0..100 {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*received.lock().unwrap(), b"data");

    scheduler.stop();
}

/// A malformed request line produces `400 Bad Request` and closes.
#[test]
fn malformed_request_is_rejected() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let handler: RequestHandler = Arc::new(|_request| panic!("handler must not run"));
    ServerConnection::new(server_end, scheduler.clone(), handler).process_requests();

    write_all(&*client_end, b"this is not http\r\n\r\n").unwrap();
    let lines = reader(&client_end);
    let status_line = get_delimited(&*lines, b"\n", false).unwrap();
    assert_eq!(status_line, b"HTTP/1.1 400 Bad Request\r\n");

    scheduler.stop();
}

/// A request with a body the handler never reads is drained by
/// `finish`, keeping the connection usable.
#[test]
fn unread_request_body_is_drained() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let handler: RequestHandler =
        Arc::new(move |request| respond_error(request, Status::NoContent, "", false));
    ServerConnection::new(server_end, scheduler.clone(), handler).process_requests();

    let conn = ClientConnection::new(client_end, None);
    let mut headers = get("/upload");
    headers.request_line.method = Method::Post;
    headers.entity.content_length = Some(6);
    let request = conn.request(headers).unwrap();
    let body = request.request_stream().unwrap();
    write_all(&*body, b"unread").unwrap();
    body.close(CloseType::Both).unwrap();
    assert_eq!(Status::NoContent, request.response().unwrap().status.status);
    request.finish().unwrap();

    // The connection still works.
    let request = conn.request(get("/after")).unwrap();
    assert_eq!(Status::NoContent, request.response().unwrap().status.status);
    request.finish().unwrap();

    scheduler.stop();
}

/// Version defaulting: 1.1 with a Host header, 1.0 without; 1.0 requests
/// advertise Keep-Alive.
#[test]
fn version_defaulting_follows_the_host_header() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let peer = std::thread::spawn(move || {
        let lines = reader(&server_end);
        let request_line = get_delimited(&*lines, b"\n", false).unwrap();
        assert!(request_line.ends_with(b"HTTP/1.0\r\n"));
        let mut saw_keep_alive = false;
        loop {
            let line = get_delimited(&*lines, b"\n", false).unwrap();
            if line == b"\r\n" {
                break;
            }
            if line.to_ascii_lowercase().starts_with(b"connection:") {
                saw_keep_alive = String::from_utf8_lossy(&line).contains("Keep-Alive");
            }
        }
        assert!(saw_keep_alive);
        write_all(
            &*server_end,
            b"HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
    });

    let conn = ClientConnection::new(client_end, None);
    let mut headers = Request::default();
    headers.request_line.method = Method::Get;
    headers.request_line.uri = "/bare".to_string();
    // No host header: the request must default to 1.0.
    let request = conn.request(headers).unwrap();
    assert_eq!(Some(Version::HTTP_1_0), request.request().request_line.ver);
    assert!(set_contains(
        &request.request().general.connection,
        "Keep-Alive"
    ));
    let response = request.response().unwrap();
    assert_eq!(Status::Ok, response.status.status);
    request.finish().unwrap();
    assert!(conn.new_requests_allowed());

    peer.join().unwrap();
    scheduler.stop();
}

#[test]
fn multipart_request_body_reaches_the_handler() {
    let scheduler = scheduler(2);
    let (client_end, server_end) = pipe();

    let bodies = Arc::new(Mutex::new(Vec::new()));
    let sink = bodies.clone();
    let handler: RequestHandler = Arc::new(move |request| {
        let content_type = request.request().entity.content_type.clone().unwrap();
        assert!(content_type.is_multipart());
        assert_eq!(Some("split"), map_get(&content_type.parameters, "boundary"));
        let multipart = request.request_multipart()?;
        while let Some(part) = multipart.next_part()? {
            let collect = MemoryStream::new();
            transfer_all(&*part.stream().unwrap(), &collect)?;
            sink.lock().unwrap().push(collect.to_vec());
        }
        respond_error(request, Status::NoContent, "", false)
    });
    ServerConnection::new(server_end, scheduler.clone(), handler).process_requests();

    let conn = ClientConnection::new(client_end, None);
    let mut headers = get("/upload");
    headers.request_line.method = Method::Post;
    let mut media = strand::http::MediaType::new("multipart", "form-data");
    media
        .parameters
        .insert(Caseless::from("boundary"), "split".to_string());
    headers.entity.content_type = Some(media);
    headers
        .general
        .transfer_encoding
        .push(strand::http::ValueWithParameters::new("chunked"));
    let request = conn.request(headers).unwrap();
    let multipart = request.request_multipart().unwrap();
    for text in [b"alpha" as &[u8], b"beta"] {
        let part = multipart.next_part().unwrap().unwrap();
        let stream = part.stream().unwrap();
        write_all(&*stream, text).unwrap();
        stream.close(CloseType::Both).unwrap();
    }
    multipart.finish().unwrap();

    assert_eq!(Status::NoContent, request.response().unwrap().status.status);
    request.finish().unwrap();
    assert_eq!(
        vec![b"alpha".to_vec(), b"beta".to_vec()],
        bodies.lock().unwrap().clone()
    );

    scheduler.stop();
}
