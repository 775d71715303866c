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

//! Resumable push parser for message headers.
//!
//! `feed` consumes bytes up to and including the header terminator and no
//! further; body bytes stay with the caller. `run` drives the parser from
//! a stream using `find`, reading exact lines so the source cursor ends on
//! the terminator. Incremental feeding across arbitrary splits is
//! supported; state is carried in the partial-line buffer.

use crate::buffer::Buffer;
use crate::error::{HttpError, HttpResult, StreamError};
use crate::streams::{read_exact, Stream};

use super::{
    parse_http_date, unquote, AcceptList, AcceptListWithParameters, AcceptValue,
    AcceptValueWithParameters, AuthParams, Caseless, ChallengeList, ContentRange, ETag, ETagSet,
    EntityHeaders, IfRange, KeyValueWithParameters, MediaType, Method, ParameterizedKeyValueList,
    ParameterizedList, Product, ProductList, ProductOrComment, Request, Response, RetryAfter,
    Status, StringMap, StringSet, ValueWithParameters, Version,
};

const MAX_HEADER_LINE: usize = 64 * 1024;

/// Where parsed fields land; implemented per message kind.
trait MessageTarget {
    /// `None` for trailers, which have no start line.
    fn start_line(&mut self, line: &str) -> HttpResult<()>;
    fn header(&mut self, name: &str, value: &str) -> HttpResult<()>;
}

struct Machine<T> {
    target: T,
    partial: Vec<u8>,
    pending: Option<(String, String)>,
    saw_start_line: bool,
    complete: bool,
    error: Option<HttpError>,
}

impl<T: MessageTarget> Machine<T> {
    fn new(target: T, needs_start_line: bool) -> Self {
        Machine {
            target,
            partial: Vec::new(),
            pending: None,
            saw_start_line: !needs_start_line,
            complete: false,
            error: None,
        }
    }

    fn feed(&mut self, data: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < data.len() && !self.complete && self.error.is_none() {
            let rest = &data[consumed..];
            match memchr::memchr(b'\n', rest) {
                Some(index) => {
                    let mut line = std::mem::take(&mut self.partial);
                    line.extend_from_slice(&rest[..=index]);
                    consumed += index + 1;
                    self.line(&line);
                }
                None => {
                    self.partial.extend_from_slice(rest);
                    consumed += rest.len();
                    if self.partial.len() > MAX_HEADER_LINE {
                        self.error = Some(HttpError::BadMessageHeader);
                    }
                }
            }
        }
        consumed
    }

    fn line(&mut self, raw: &[u8]) {
        let Ok(text) = std::str::from_utf8(raw) else {
            self.error = Some(HttpError::BadMessageHeader);
            return;
        };
        let line = text.trim_end_matches(['\r', '\n']);
        if !self.saw_start_line {
            self.saw_start_line = true;
            if let Err(err) = self.target.start_line(line) {
                self.error = Some(err);
            }
            return;
        }
        if line.is_empty() {
            self.flush_pending();
            self.complete = self.error.is_none();
            return;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // obs-fold continuation
            match &mut self.pending {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => self.error = Some(HttpError::BadMessageHeader),
            }
            return;
        }
        self.flush_pending();
        let Some((name, value)) = line.split_once(':') else {
            self.error = Some(HttpError::BadMessageHeader);
            return;
        };
        if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
            self.error = Some(HttpError::BadMessageHeader);
            return;
        }
        self.pending = Some((name.to_string(), value.trim().to_string()));
    }

    fn flush_pending(&mut self) {
        if let Some((name, value)) = self.pending.take() {
            if let Err(err) = self.target.header(&name, &value) {
                self.error = Some(err);
            }
        }
    }

    fn run(&mut self, stream: &dyn Stream) -> HttpResult<u64> {
        debug_assert!(stream.supports_find());
        let mut total = 0u64;
        while !self.complete && self.error.is_none() {
            let offset = match stream.find(b"\n", MAX_HEADER_LINE, false) {
                Ok(offset) => offset,
                Err(StreamError::BufferOverflow) => {
                    self.error = Some(HttpError::BadMessageHeader);
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            if offset < 0 {
                let buffered = (-offset - 1) as usize;
                if buffered == 0 {
                    break;
                }
                // EOF mid-line; consume what is there so the caller sees
                // an incomplete, not stuck, parse.
                let mut line = Buffer::new();
                read_exact(stream, &mut line, buffered).map_err(HttpError::from)?;
                self.feed(&line.to_vec());
                total += buffered as u64;
                break;
            }
            let take = offset as usize + 1;
            let mut line = Buffer::new();
            read_exact(stream, &mut line, take).map_err(HttpError::from)?;
            let line = line.to_vec();
            let consumed = self.feed(&line);
            debug_assert_eq!(consumed, line.len());
            total += take as u64;
        }
        Ok(total)
    }
}

/// Parses a request's start line and headers.
pub struct RequestParser {
    machine: Machine<Request>,
}

impl Default for RequestParser {
    fn default() -> Self {
        RequestParser::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            machine: Machine::new(Request::default(), true),
        }
    }

    /// Consumes header bytes from `data`, never past the terminator.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        self.machine.feed(data)
    }

    /// Drives the parser from a findable stream; returns bytes consumed.
    pub fn run(&mut self, stream: &dyn Stream) -> HttpResult<u64> {
        self.machine.run(stream)
    }

    pub fn complete(&self) -> bool {
        self.machine.complete
    }

    pub fn error(&self) -> bool {
        self.machine.error.is_some()
    }

    pub fn message(&self) -> &Request {
        &self.machine.target
    }

    pub fn into_message(self) -> Request {
        self.machine.target
    }
}

/// Parses a response's status line and headers.
pub struct ResponseParser {
    machine: Machine<Response>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        ResponseParser::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        ResponseParser {
            machine: Machine::new(Response::default(), true),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> usize {
        self.machine.feed(data)
    }

    pub fn run(&mut self, stream: &dyn Stream) -> HttpResult<u64> {
        self.machine.run(stream)
    }

    pub fn complete(&self) -> bool {
        self.machine.complete
    }

    pub fn error(&self) -> bool {
        self.machine.error.is_some()
    }

    pub fn message(&self) -> &Response {
        &self.machine.target
    }

    pub fn into_message(self) -> Response {
        self.machine.target
    }
}

struct Trailer(EntityHeaders);

/// Parses an entity-header-only block: chunked trailers and multipart part
/// headers.
pub struct TrailerParser {
    machine: Machine<Trailer>,
}

impl Default for TrailerParser {
    fn default() -> Self {
        TrailerParser::new()
    }
}

impl TrailerParser {
    pub fn new() -> Self {
        TrailerParser {
            machine: Machine::new(Trailer(EntityHeaders::default()), false),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> usize {
        self.machine.feed(data)
    }

    pub fn run(&mut self, stream: &dyn Stream) -> HttpResult<u64> {
        self.machine.run(stream)
    }

    pub fn complete(&self) -> bool {
        self.machine.complete
    }

    pub fn error(&self) -> bool {
        self.machine.error.is_some()
    }

    pub fn message(&self) -> &EntityHeaders {
        &self.machine.target.0
    }

    pub fn into_message(self) -> EntityHeaders {
        self.machine.target.0
    }
}

impl MessageTarget for Request {
    fn start_line(&mut self, line: &str) -> HttpResult<()> {
        let mut parts = line.split(' ').filter(|part| !part.is_empty());
        let method = parts.next().ok_or(HttpError::BadMessageHeader)?;
        let uri = parts.next().ok_or(HttpError::BadMessageHeader)?;
        let version = parts.next().ok_or(HttpError::BadMessageHeader)?;
        if parts.next().is_some() {
            return Err(HttpError::BadMessageHeader);
        }
        self.request_line.method = Method::from_token(method);
        self.request_line.uri = uri.to_string();
        self.request_line.ver = Some(parse_version(version)?);
        Ok(())
    }

    fn header(&mut self, name: &str, value: &str) -> HttpResult<()> {
        if set_general(&mut self.general, name, value)?
            || set_entity(&mut self.entity, name, value, false)?
        {
            return Ok(());
        }
        match () {
            _ if name.eq_ignore_ascii_case("Accept-Charset") => {
                self.request.accept_charset.extend(parse_accept_list(value))
            }
            _ if name.eq_ignore_ascii_case("Accept-Encoding") => self
                .request
                .accept_encoding
                .extend(parse_accept_list(value)),
            _ if name.eq_ignore_ascii_case("Authorization") => {
                self.request.authorization = Some(parse_auth(value))
            }
            _ if name.eq_ignore_ascii_case("Expect") => {
                self.request.expect.extend(parse_kv_list(value))
            }
            _ if name.eq_ignore_ascii_case("Host") => self.request.host = value.to_string(),
            _ if name.eq_ignore_ascii_case("If-Match") => {
                self.request.if_match.extend(parse_etag_set(value)?)
            }
            _ if name.eq_ignore_ascii_case("If-Modified-Since") => {
                self.request.if_modified_since = parse_http_date(value)
            }
            _ if name.eq_ignore_ascii_case("If-None-Match") => {
                self.request.if_none_match.extend(parse_etag_set(value)?)
            }
            _ if name.eq_ignore_ascii_case("If-Range") => {
                self.request.if_range = Some(parse_if_range(value)?)
            }
            _ if name.eq_ignore_ascii_case("If-Unmodified-Since") => {
                self.request.if_unmodified_since = parse_http_date(value)
            }
            _ if name.eq_ignore_ascii_case("Proxy-Authorization") => {
                self.request.proxy_authorization = Some(parse_auth(value))
            }
            _ if name.eq_ignore_ascii_case("Range") => self.request.range = parse_range(value)?,
            _ if name.eq_ignore_ascii_case("Referer") => {
                self.request.referer = Some(value.to_string())
            }
            _ if name.eq_ignore_ascii_case("TE") => self
                .request
                .te
                .extend(parse_accept_list_with_parameters(value)),
            _ if name.eq_ignore_ascii_case("User-Agent") => {
                self.request.user_agent = parse_products_and_comments(value)
            }
            _ => {
                self.entity
                    .extension
                    .insert(Caseless::from(name), value.to_string());
            }
        }
        Ok(())
    }
}

impl MessageTarget for Response {
    fn start_line(&mut self, line: &str) -> HttpResult<()> {
        let rest = line;
        let (version, rest) = rest.split_once(' ').ok_or(HttpError::BadMessageHeader)?;
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason),
            None => (rest, ""),
        };
        self.status.ver = Some(parse_version(version)?);
        let code: u16 = code.parse().map_err(|_| HttpError::BadMessageHeader)?;
        if !(100..=999).contains(&code) {
            return Err(HttpError::BadMessageHeader);
        }
        self.status.status = Status::from_code(code);
        self.status.reason = reason.to_string();
        Ok(())
    }

    fn header(&mut self, name: &str, value: &str) -> HttpResult<()> {
        if set_general(&mut self.general, name, value)?
            || set_entity(&mut self.entity, name, value, false)?
        {
            return Ok(());
        }
        match () {
            _ if name.eq_ignore_ascii_case("Accept-Ranges") => {
                insert_set(&mut self.response.accept_ranges, value)
            }
            _ if name.eq_ignore_ascii_case("ETag") => {
                self.response.etag = Some(parse_etag(value)?)
            }
            _ if name.eq_ignore_ascii_case("Location") => {
                self.response.location = Some(value.to_string())
            }
            _ if name.eq_ignore_ascii_case("Proxy-Authenticate") => self
                .response
                .proxy_authenticate
                .extend(parse_challenge_list(value)),
            _ if name.eq_ignore_ascii_case("Retry-After") => {
                self.response.retry_after = Some(match value.parse::<u64>() {
                    Ok(delta) => RetryAfter::Delta(delta),
                    Err(_) => RetryAfter::Date(
                        parse_http_date(value).ok_or(HttpError::BadMessageHeader)?,
                    ),
                })
            }
            _ if name.eq_ignore_ascii_case("Server") => {
                self.response.server = parse_products_and_comments(value)
            }
            _ if name.eq_ignore_ascii_case("WWW-Authenticate") => self
                .response
                .www_authenticate
                .extend(parse_challenge_list(value)),
            _ => {
                self.entity
                    .extension
                    .insert(Caseless::from(name), value.to_string());
            }
        }
        Ok(())
    }
}

impl MessageTarget for Trailer {
    fn start_line(&mut self, _line: &str) -> HttpResult<()> {
        unreachable!("trailers have no start line")
    }

    fn header(&mut self, name: &str, value: &str) -> HttpResult<()> {
        if !set_entity(&mut self.0, name, value, true)? {
            self.0
                .extension
                .insert(Caseless::from(name), value.to_string());
        }
        Ok(())
    }
}

fn parse_version(text: &str) -> HttpResult<Version> {
    let digits = text
        .strip_prefix("HTTP/")
        .ok_or(HttpError::BadMessageHeader)?;
    let (major, minor) = digits.split_once('.').ok_or(HttpError::BadMessageHeader)?;
    Ok(Version {
        major: major.parse().map_err(|_| HttpError::BadMessageHeader)?,
        minor: minor.parse().map_err(|_| HttpError::BadMessageHeader)?,
    })
}

fn set_general(general: &mut super::GeneralHeaders, name: &str, value: &str) -> HttpResult<bool> {
    match () {
        _ if name.eq_ignore_ascii_case("Connection") => insert_set(&mut general.connection, value),
        _ if name.eq_ignore_ascii_case("Date") => general.date = parse_http_date(value),
        _ if name.eq_ignore_ascii_case("Proxy-Connection") => {
            insert_set(&mut general.proxy_connection, value)
        }
        _ if name.eq_ignore_ascii_case("Transfer-Encoding") => general
            .transfer_encoding
            .extend(parse_parameterized_list(value)),
        _ if name.eq_ignore_ascii_case("Trailer") => insert_set(&mut general.trailer, value),
        _ if name.eq_ignore_ascii_case("Upgrade") => {
            general.upgrade.extend(parse_product_list(value))
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn set_entity(
    entity: &mut EntityHeaders,
    name: &str,
    value: &str,
    trailer: bool,
) -> HttpResult<bool> {
    match () {
        _ if name.eq_ignore_ascii_case("Content-Encoding") => entity
            .content_encoding
            .extend(split_commas(value).into_iter().map(String::from)),
        _ if name.eq_ignore_ascii_case("Content-Length") => {
            entity.content_length =
                Some(value.parse().map_err(|_| HttpError::BadMessageHeader)?)
        }
        _ if name.eq_ignore_ascii_case("Content-Range") => {
            entity.content_range = Some(parse_content_range(value)?)
        }
        _ if !trailer && name.eq_ignore_ascii_case("Content-Type") => {
            entity.content_type = Some(parse_media_type(value)?)
        }
        _ if name.eq_ignore_ascii_case("Expires") => entity.expires = parse_http_date(value),
        _ if name.eq_ignore_ascii_case("Last-Modified") => {
            entity.last_modified = parse_http_date(value)
        }
        _ if trailer && name.eq_ignore_ascii_case("Content-Type") => {
            entity.content_type = Some(parse_media_type(value)?)
        }
        _ => return Ok(false),
    }
    Ok(true)
}

fn insert_set(set: &mut StringSet, value: &str) {
    for element in split_commas(value) {
        set.insert(Caseless::from(element));
    }
}

/// Splits a header value at top-level commas, respecting quoted strings.
fn split_commas(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (index, ch) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ',' if !quoted => {
                let piece = value[start..index].trim();
                if !piece.is_empty() {
                    out.push(piece);
                }
                start = index + 1;
            }
            _ => {}
        }
    }
    let piece = value[start..].trim();
    if !piece.is_empty() {
        out.push(piece);
    }
    out
}

/// Splits at top-level semicolons, respecting quoted strings.
fn split_semicolons(value: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (index, ch) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                out.push(value[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    out.push(value[start..].trim());
    out
}

fn parse_parameters(pieces: &[&str]) -> StringMap {
    let mut parameters = StringMap::new();
    for piece in pieces {
        match piece.split_once('=') {
            Some((key, value)) => {
                parameters.insert(Caseless::from(key.trim()), unquote(value.trim()));
            }
            None if !piece.is_empty() => {
                parameters.insert(Caseless::from(piece.trim()), String::new());
            }
            None => {}
        }
    }
    parameters
}

fn parse_parameterized_list(value: &str) -> ParameterizedList {
    split_commas(value)
        .into_iter()
        .map(|element| {
            let pieces = split_semicolons(element);
            ValueWithParameters {
                value: pieces[0].to_string(),
                parameters: parse_parameters(&pieces[1..]),
            }
        })
        .collect()
}

fn parse_kv_list(value: &str) -> ParameterizedKeyValueList {
    split_commas(value)
        .into_iter()
        .map(|element| {
            let pieces = split_semicolons(element);
            let (key, val) = match pieces[0].split_once('=') {
                Some((key, val)) => (key.trim().to_string(), unquote(val.trim())),
                None => (pieces[0].to_string(), String::new()),
            };
            KeyValueWithParameters {
                key,
                value: val,
                parameters: parse_parameters(&pieces[1..]),
            }
        })
        .collect()
}

fn parse_qvalue(text: &str) -> Option<u16> {
    let (integer, fraction) = match text.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (text, ""),
    };
    let whole: u16 = integer.parse().ok()?;
    if whole > 1 {
        return None;
    }
    let mut qvalue = whole * 1000;
    let mut scale = 100;
    for digit in fraction.bytes().take(3) {
        if !digit.is_ascii_digit() {
            return None;
        }
        qvalue += (digit - b'0') as u16 * scale;
        scale /= 10;
    }
    Some(qvalue.min(1000))
}

fn parse_accept_list(value: &str) -> AcceptList {
    split_commas(value)
        .into_iter()
        .map(|element| {
            let pieces = split_semicolons(element);
            let mut qvalue = None;
            for piece in &pieces[1..] {
                if let Some((key, val)) = piece.split_once('=') {
                    if key.trim().eq_ignore_ascii_case("q") {
                        qvalue = parse_qvalue(val.trim());
                    }
                }
            }
            AcceptValue {
                value: pieces[0].to_string(),
                qvalue,
            }
        })
        .collect()
}

fn parse_accept_list_with_parameters(value: &str) -> AcceptListWithParameters {
    split_commas(value)
        .into_iter()
        .map(|element| {
            let pieces = split_semicolons(element);
            let mut qvalue = None;
            let mut parameters = Vec::new();
            let mut accept_params = Vec::new();
            let mut seen_q = false;
            for piece in &pieces[1..] {
                let is_q = piece
                    .split_once('=')
                    .is_some_and(|(key, _)| key.trim().eq_ignore_ascii_case("q"));
                if is_q {
                    seen_q = true;
                    if let Some((_, val)) = piece.split_once('=') {
                        qvalue = parse_qvalue(val.trim());
                    }
                } else if seen_q {
                    accept_params.push(*piece);
                } else {
                    parameters.push(*piece);
                }
            }
            AcceptValueWithParameters {
                value: pieces[0].to_string(),
                parameters: parse_parameters(&parameters),
                qvalue,
                accept_params: parse_parameters(&accept_params),
            }
        })
        .collect()
}

fn parse_product(text: &str) -> Product {
    match text.split_once('/') {
        Some((product, version)) => Product {
            product: product.to_string(),
            version: version.to_string(),
        },
        None => Product {
            product: text.to_string(),
            version: String::new(),
        },
    }
}

fn parse_product_list(value: &str) -> ProductList {
    split_commas(value).into_iter().map(parse_product).collect()
}

fn parse_products_and_comments(value: &str) -> Vec<ProductOrComment> {
    let mut out = Vec::new();
    let mut rest = value.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('(') {
            let mut depth = 1;
            let mut end = stripped.len();
            let mut escaped = false;
            for (index, ch) in stripped.char_indices() {
                if escaped {
                    escaped = false;
                    continue;
                }
                match ch {
                    '\\' => escaped = true,
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            end = index;
                            break;
                        }
                    }
                    _ => {}
                }
            }
            out.push(ProductOrComment::Comment(stripped[..end].to_string()));
            rest = stripped.get(end + 1..).unwrap_or("").trim_start();
        } else {
            let end = rest.find([' ', '\t']).unwrap_or(rest.len());
            out.push(ProductOrComment::Product(parse_product(&rest[..end])));
            rest = rest[end..].trim_start();
        }
    }
    out
}

fn parse_etag(value: &str) -> HttpResult<ETag> {
    let value = value.trim();
    let (weak, rest) = match value.strip_prefix("W/") {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    if !rest.starts_with('"') || !rest.ends_with('"') || rest.len() < 2 {
        return Err(HttpError::BadMessageHeader);
    }
    Ok(ETag {
        weak,
        value: unquote(rest),
    })
}

fn parse_etag_set(value: &str) -> HttpResult<ETagSet> {
    if value.trim() == "*" {
        // The wildcard is modeled as an empty-valued strong tag.
        let mut set = ETagSet::new();
        set.insert(ETag::strong("*"));
        return Ok(set);
    }
    split_commas(value).into_iter().map(parse_etag).collect()
}

fn parse_if_range(value: &str) -> HttpResult<IfRange> {
    let trimmed = value.trim();
    if trimmed.starts_with('"') || trimmed.starts_with("W/") {
        Ok(IfRange::ETag(parse_etag(trimmed)?))
    } else {
        parse_http_date(trimmed)
            .map(IfRange::Date)
            .ok_or(HttpError::BadMessageHeader)
    }
}

fn parse_range(value: &str) -> HttpResult<super::RangeSet> {
    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(HttpError::BadMessageHeader)?;
    let mut out = Vec::new();
    for element in split_commas(spec) {
        let (first, last) = element
            .split_once('-')
            .ok_or(HttpError::BadMessageHeader)?;
        let first = match first.trim() {
            "" => None,
            digits => Some(digits.parse().map_err(|_| HttpError::BadMessageHeader)?),
        };
        let last = match last.trim() {
            "" => None,
            digits => Some(digits.parse().map_err(|_| HttpError::BadMessageHeader)?),
        };
        if first.is_none() && last.is_none() {
            return Err(HttpError::BadMessageHeader);
        }
        out.push((first, last));
    }
    Ok(out)
}

fn parse_content_range(value: &str) -> HttpResult<ContentRange> {
    let spec = value
        .trim()
        .strip_prefix("bytes ")
        .ok_or(HttpError::BadMessageHeader)?;
    let (range, instance) = spec.split_once('/').ok_or(HttpError::BadMessageHeader)?;
    let instance = match instance.trim() {
        "*" => None,
        digits => Some(digits.parse().map_err(|_| HttpError::BadMessageHeader)?),
    };
    let (first, last) = match range.trim() {
        "*" => (None, None),
        range => {
            let (first, last) = range.split_once('-').ok_or(HttpError::BadMessageHeader)?;
            (
                Some(first.trim().parse().map_err(|_| HttpError::BadMessageHeader)?),
                Some(last.trim().parse().map_err(|_| HttpError::BadMessageHeader)?),
            )
        }
    };
    Ok(ContentRange {
        first,
        last,
        instance,
    })
}

fn parse_media_type(value: &str) -> HttpResult<MediaType> {
    let pieces = split_semicolons(value);
    let (kind, subtype) = pieces[0]
        .split_once('/')
        .ok_or(HttpError::BadMessageHeader)?;
    Ok(MediaType {
        kind: kind.trim().to_string(),
        subtype: subtype.trim().to_string(),
        parameters: parse_parameters(&pieces[1..]),
    })
}

fn parse_auth(value: &str) -> AuthParams {
    let value = value.trim();
    let (scheme, rest) = match value.split_once(' ') {
        Some((scheme, rest)) => (scheme, rest.trim()),
        None => (value, ""),
    };
    let mut auth = AuthParams {
        scheme: scheme.to_string(),
        ..Default::default()
    };
    if rest.contains('=') {
        for element in split_commas(rest) {
            if let Some((key, val)) = element.split_once('=') {
                auth.parameters
                    .insert(Caseless::from(key.trim()), unquote(val.trim()));
            }
        }
    } else {
        auth.base64 = rest.to_string();
    }
    auth
}

/// A comma both separates challenges and parameters within a challenge;
/// a new challenge is recognized by `scheme [token68 | param]` shape.
fn parse_challenge_list(value: &str) -> ChallengeList {
    let mut out: ChallengeList = Vec::new();
    for element in split_commas(value) {
        match element.split_once(' ') {
            Some((scheme, rest)) if !scheme.contains('=') => {
                let mut auth = AuthParams {
                    scheme: scheme.to_string(),
                    ..Default::default()
                };
                let rest = rest.trim();
                if let Some((key, val)) = rest.split_once('=') {
                    auth.parameters
                        .insert(Caseless::from(key.trim()), unquote(val.trim()));
                } else {
                    auth.base64 = rest.to_string();
                }
                out.push(auth);
            }
            _ => match element.split_once('=') {
                Some((key, val)) => {
                    if let Some(auth) = out.last_mut() {
                        auth.parameters
                            .insert(Caseless::from(key.trim()), unquote(val.trim()));
                    }
                }
                None => out.push(AuthParams {
                    scheme: element.to_string(),
                    ..Default::default()
                }),
            },
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::http::set_contains;
    use crate::streams::buffered::BufferedStream;
    use crate::streams::memory::MemoryStream;
    use std::sync::Arc;

    const REQUEST: &[u8] = b"GET /path HTTP/1.1\r\n\
        Host: example.com\r\n\
        Connection: keep-alive, TE\r\n\
        Transfer-Encoding: gzip, chunked\r\n\
        Content-Type: multipart/form-data; boundary=xyz\r\n\
        Range: bytes=0-9,20-29\r\n\
        TE: deflate;q=0.5, gzip\r\n\
        X-Custom: anything\r\n\
        \r\nBODY";

    #[test]
    fn parses_a_full_request_and_stops_at_the_body() {
        let mut parser = RequestParser::new();
        let consumed = parser.feed(REQUEST);
        assert!(parser.complete());
        assert!(!parser.error());
        assert_eq!(REQUEST.len() - 4, consumed);

        let message = parser.message();
        assert_eq!(Method::Get, message.request_line.method);
        assert_eq!("/path", message.request_line.uri);
        assert_eq!(Some(Version::HTTP_1_1), message.request_line.ver);
        assert_eq!("example.com", message.request.host);
        assert!(set_contains(&message.general.connection, "te"));
        assert_eq!(2, message.general.transfer_encoding.len());
        assert_eq!("chunked", message.general.transfer_encoding[1].value);
        let content_type = message.entity.content_type.as_ref().unwrap();
        assert!(content_type.is_multipart());
        assert_eq!(
            Some("xyz"),
            super::super::map_get(&content_type.parameters, "boundary")
        );
        assert_eq!(
            vec![(Some(0), Some(9)), (Some(20), Some(29))],
            message.request.range
        );
        assert_eq!(Some(500), message.request.te[0].qvalue);
        assert_eq!(
            Some("anything"),
            super::super::map_get(&message.entity.extension, "x-custom")
        );
    }

    #[test]
    fn is_resumable_across_arbitrary_splits() {
        for split in 1..REQUEST.len() - 5 {
            let mut parser = RequestParser::new();
            let first = parser.feed(&REQUEST[..split]);
            assert_eq!(split, first, "prefix is all headers");
            parser.feed(&REQUEST[split..]);
            assert!(parser.complete(), "split at {split}");
            assert_eq!("example.com", parser.message().request.host);
        }
    }

    #[test]
    fn parses_a_status_line_with_reason() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        assert!(parser.complete());
        let message = parser.message();
        assert_eq!(Status::NotFound, message.status.status);
        assert_eq!(Some(Version::HTTP_1_0), message.status.ver);
        assert_eq!(Some(0), message.entity.content_length);
    }

    #[test]
    fn unregistered_status_codes_survive() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 299 Whatever\r\n\r\n");
        assert!(parser.complete());
        assert_eq!(299, parser.message().status.status.code());
    }

    #[test]
    fn obs_fold_continuations_join() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\nX-Long: part one\r\n  part two\r\n\r\n");
        assert!(parser.complete());
        assert_eq!(
            Some("part one part two"),
            super::super::map_get(&parser.message().entity.extension, "x-long")
        );
    }

    #[test]
    fn garbage_start_line_is_an_error() {
        let mut parser = RequestParser::new();
        parser.feed(b"complete nonsense\r\n\r\n");
        assert!(parser.error());
        assert!(!parser.complete());
    }

    #[test]
    fn run_leaves_body_bytes_on_the_stream() {
        let memory = Arc::new(MemoryStream::from(REQUEST));
        let stream = BufferedStream::new(memory, false);
        let mut parser = RequestParser::new();
        let consumed = parser.run(&stream).unwrap();
        assert!(parser.complete());
        assert_eq!((REQUEST.len() - 4) as u64, consumed);
        let mut body = crate::buffer::Buffer::new();
        crate::streams::Stream::read(&stream, &mut body, 16).unwrap();
        assert_eq!(body, b"BODY" as &[u8]);
    }

    #[test]
    fn trailer_parser_reads_entity_headers_only() {
        let mut parser = TrailerParser::new();
        parser.feed(b"Content-Length: 12\r\nX-Checksum: abc\r\n\r\n");
        assert!(parser.complete());
        assert_eq!(Some(12), parser.message().content_length);
    }

    #[test]
    fn challenge_list_splits_on_schemes() {
        let mut parser = ResponseParser::new();
        parser.feed(
            b"HTTP/1.1 401 Unauthorized\r\n\
              WWW-Authenticate: Basic realm=\"simple\", Digest realm=\"other\", nonce=\"xyz\"\r\n\
              \r\n",
        );
        assert!(parser.complete());
        let challenges = &parser.message().response.www_authenticate;
        assert_eq!(2, challenges.len());
        assert_eq!("Basic", challenges[0].scheme);
        assert_eq!("Digest", challenges[1].scheme);
        assert_eq!(
            Some("xyz"),
            super::super::map_get(&challenges[1].parameters, "nonce")
        );
    }
}
