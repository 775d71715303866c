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

//! Typed HTTP/1.x message model.
//!
//! Requests and responses are structured as start-line plus general,
//! role-specific, and entity header groups. Header fields are strongly
//! typed: ordered parameterized lists, case-insensitive sets, sum-typed
//! fields, challenge lists. The body is never held in the message; it is
//! obtained as a stream derived from the connection.

pub mod chunked;
pub mod client;
pub mod connection;
pub mod multipart;
pub mod parser;
pub mod server;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Write as _};

use chrono::{DateTime, TimeZone, Utc};

/// Request methods.
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    /// Any other token.
    Extension(String),
}

impl Default for Method {
    fn default() -> Self {
        Method::Get
    }
}

impl Method {
    pub fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            other => Method::Extension(other.to_string()),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Extension(token) => token,
        })
    }
}

macro_rules! statuses {
    ($($name:ident = $code:literal, $reason:literal;)*) => {
        /// Response status codes.
        /// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Status {
            $($name,)*
            /// A syntactically valid code outside the registered set.
            Unregistered(u16),
        }

        impl Status {
            pub fn code(self) -> u16 {
                match self {
                    $(Status::$name => $code,)*
                    Status::Unregistered(code) => code,
                }
            }

            pub fn from_code(code: u16) -> Status {
                match code {
                    $($code => Status::$name,)*
                    other => Status::Unregistered(other),
                }
            }

            pub fn reason(self) -> &'static str {
                match self {
                    $(Status::$name => $reason,)*
                    Status::Unregistered(_) => "",
                }
            }

            /// Informational responses never carry a body.
            pub fn is_informational(self) -> bool {
                (100..200).contains(&self.code())
            }
        }
    };
}

statuses! {
    Continue = 100, "Continue";
    SwitchingProtocols = 101, "Switching Protocols";
    Ok = 200, "OK";
    Created = 201, "Created";
    Accepted = 202, "Accepted";
    NonAuthoritativeInformation = 203, "Non-Authoritative Information";
    NoContent = 204, "No Content";
    ResetContent = 205, "Reset Content";
    PartialContent = 206, "Partial Content";
    MultipleChoices = 300, "Multiple Choices";
    MovedPermanently = 301, "Moved Permanently";
    Found = 302, "Found";
    SeeOther = 303, "See Other";
    NotModified = 304, "Not Modified";
    UseProxy = 305, "Use Proxy";
    TemporaryRedirect = 307, "Temporary Redirect";
    PermanentRedirect = 308, "Permanent Redirect";
    BadRequest = 400, "Bad Request";
    Unauthorized = 401, "Unauthorized";
    PaymentRequired = 402, "Payment Required";
    Forbidden = 403, "Forbidden";
    NotFound = 404, "Not Found";
    MethodNotAllowed = 405, "Method Not Allowed";
    NotAcceptable = 406, "Not Acceptable";
    ProxyAuthenticationRequired = 407, "Proxy Authentication Required";
    RequestTimeout = 408, "Request Timeout";
    Conflict = 409, "Conflict";
    Gone = 410, "Gone";
    LengthRequired = 411, "Length Required";
    PreconditionFailed = 412, "Precondition Failed";
    ContentTooLarge = 413, "Content Too Large";
    UriTooLong = 414, "URI Too Long";
    UnsupportedMediaType = 415, "Unsupported Media Type";
    RangeNotSatisfiable = 416, "Range Not Satisfiable";
    ExpectationFailed = 417, "Expectation Failed";
    MisdirectedRequest = 421, "Misdirected Request";
    UnprocessableContent = 422, "Unprocessable Content";
    UpgradeRequired = 426, "Upgrade Required";
    InternalServerError = 500, "Internal Server Error";
    NotImplemented = 501, "Not Implemented";
    BadGateway = 502, "Bad Gateway";
    ServiceUnavailable = 503, "Service Unavailable";
    GatewayTimeout = 504, "Gateway Timeout";
    HttpVersionNotSupported = 505, "HTTP Version Not Supported";
}

impl Default for Status {
    fn default() -> Self {
        Status::Ok
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_1_0: Version = Version { major: 1, minor: 0 };
    pub const HTTP_1_1: Version = Version { major: 1, minor: 1 };
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// A string compared and ordered case-insensitively (ASCII).
#[derive(Debug, Clone, Eq)]
pub struct Caseless(pub String);

impl Caseless {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Caseless {
    fn from(value: &str) -> Self {
        Caseless(value.to_string())
    }
}

impl PartialEq for Caseless {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl PartialOrd for Caseless {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Caseless {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .bytes()
            .map(|byte| byte.to_ascii_lowercase())
            .cmp(other.0.bytes().map(|byte| byte.to_ascii_lowercase()))
    }
}

impl Display for Caseless {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Case-insensitive string set (`Connection`, `Trailer`, ...).
pub type StringSet = BTreeSet<Caseless>;
/// Case-insensitive keyed parameters.
pub type StringMap = BTreeMap<Caseless, String>;

pub fn set_contains(set: &StringSet, value: &str) -> bool {
    set.contains(&Caseless::from(value))
}

pub fn map_get<'a>(map: &'a StringMap, key: &str) -> Option<&'a str> {
    map.get(&Caseless::from(key)).map(String::as_str)
}

/// Entity tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ETag {
    pub weak: bool,
    pub value: String,
}

impl ETag {
    pub fn strong(value: &str) -> ETag {
        ETag {
            weak: false,
            value: value.to_string(),
        }
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weak {
            f.write_str("W/")?;
        }
        f.write_str(&quote(&self.value, true, false))
    }
}

pub type ETagSet = BTreeSet<ETag>;

/// Product token in `User-Agent`/`Server`/`Upgrade`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Product {
    pub product: String,
    pub version: String,
}

impl Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.product)?;
        if !self.version.is_empty() {
            write!(f, "/{}", self.version)?;
        }
        Ok(())
    }
}

pub type ProductList = Vec<Product>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductOrComment {
    Product(Product),
    Comment(String),
}

pub type ProductAndCommentList = Vec<ProductOrComment>;

/// `value;param=x;param2=y` element of an ordered list
/// (`Transfer-Encoding`, `Upgrade`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueWithParameters {
    pub value: String,
    pub parameters: StringMap,
}

impl ValueWithParameters {
    pub fn new(value: &str) -> Self {
        ValueWithParameters {
            value: value.to_string(),
            parameters: StringMap::new(),
        }
    }
}

pub type ParameterizedList = Vec<ValueWithParameters>;

/// `key=value;param=x` element (`Expect`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValueWithParameters {
    pub key: String,
    pub value: String,
    pub parameters: StringMap,
}

pub type ParameterizedKeyValueList = Vec<KeyValueWithParameters>;

/// Challenge or credentials (`WWW-Authenticate`, `Authorization`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthParams {
    pub scheme: String,
    pub base64: String,
    pub parameters: StringMap,
}

pub type ChallengeList = Vec<AuthParams>;

/// `type/subtype;param=value`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaType {
    pub kind: String,
    pub subtype: String,
    pub parameters: StringMap,
}

impl MediaType {
    pub fn new(kind: &str, subtype: &str) -> Self {
        MediaType {
            kind: kind.to_string(),
            subtype: subtype.to_string(),
            parameters: StringMap::new(),
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.kind.eq_ignore_ascii_case("multipart")
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)?;
        for (key, value) in &self.parameters {
            write!(f, ";{}={}", key, quote(value, false, false))?;
        }
        Ok(())
    }
}

/// One element of a `Range: bytes=` set. `(None, Some(n))` is a suffix
/// range of the last `n` bytes; `(Some(n), None)` runs to the end.
pub type RangeElement = (Option<u64>, Option<u64>);
pub type RangeSet = Vec<RangeElement>;

/// `Content-Range` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentRange {
    pub first: Option<u64>,
    pub last: Option<u64>,
    pub instance: Option<u64>,
}

impl Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bytes ")?;
        match (self.first, self.last) {
            (Some(first), Some(last)) => write!(f, "{first}-{last}")?,
            _ => f.write_str("*")?,
        }
        match self.instance {
            Some(instance) => write!(f, "/{instance}"),
            None => f.write_str("/*"),
        }
    }
}

/// Accept-style element with a quality value in thousandths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptValue {
    pub value: String,
    pub qvalue: Option<u16>,
}

impl AcceptValue {
    pub fn new(value: &str) -> Self {
        AcceptValue {
            value: value.to_string(),
            qvalue: None,
        }
    }
}

pub type AcceptList = Vec<AcceptValue>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcceptValueWithParameters {
    pub value: String,
    pub parameters: StringMap,
    pub qvalue: Option<u16>,
    pub accept_params: StringMap,
}

impl AcceptValueWithParameters {
    pub fn new(value: &str) -> Self {
        AcceptValueWithParameters {
            value: value.to_string(),
            ..Default::default()
        }
    }

    pub fn with_qvalue(value: &str, qvalue: u16) -> Self {
        AcceptValueWithParameters {
            value: value.to_string(),
            qvalue: Some(qvalue),
            ..Default::default()
        }
    }
}

pub type AcceptListWithParameters = Vec<AcceptValueWithParameters>;

/// HTTP-date, parsed and emitted as IMF-fixdate.
pub type HttpDate = DateTime<Utc>;

/// `If-Range` is either an entity tag or a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfRange {
    ETag(ETag),
    Date(HttpDate),
}

/// `Retry-After` is either a date or delta-seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAfter {
    Date(HttpDate),
    Delta(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: String,
    pub ver: Option<Version>,
}

impl Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ver = self.ver.unwrap_or(Version::HTTP_1_1);
        write!(f, "{} {} {}", self.method, self.uri, ver)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusLine {
    pub status: Status,
    pub reason: String,
    pub ver: Option<Version>,
}

impl Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ver = self.ver.unwrap_or(Version::HTTP_1_1);
        let reason = if self.reason.is_empty() {
            self.status.reason()
        } else {
            &self.reason
        };
        write!(f, "{} {} {}", ver, self.status, reason)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeneralHeaders {
    pub connection: StringSet,
    pub date: Option<HttpDate>,
    // Non-standard, but honored on the client read path because it is
    // widely deployed.
    pub proxy_connection: StringSet,
    pub transfer_encoding: ParameterizedList,
    pub trailer: StringSet,
    pub upgrade: ProductList,
}

#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub accept_charset: AcceptList,
    pub accept_encoding: AcceptList,
    pub authorization: Option<AuthParams>,
    pub expect: ParameterizedKeyValueList,
    pub host: String,
    pub if_match: ETagSet,
    pub if_modified_since: Option<HttpDate>,
    pub if_none_match: ETagSet,
    pub if_range: Option<IfRange>,
    pub if_unmodified_since: Option<HttpDate>,
    pub proxy_authorization: Option<AuthParams>,
    pub range: RangeSet,
    pub referer: Option<String>,
    pub te: AcceptListWithParameters,
    pub user_agent: ProductAndCommentList,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    pub accept_ranges: StringSet,
    pub etag: Option<ETag>,
    pub location: Option<String>,
    pub proxy_authenticate: ChallengeList,
    pub retry_after: Option<RetryAfter>,
    pub server: ProductAndCommentList,
    pub www_authenticate: ChallengeList,
}

#[derive(Debug, Clone, Default)]
pub struct EntityHeaders {
    pub content_encoding: Vec<String>,
    pub content_length: Option<u64>,
    pub content_range: Option<ContentRange>,
    pub content_type: Option<MediaType>,
    pub expires: Option<HttpDate>,
    pub last_modified: Option<HttpDate>,
    /// Unrecognized entity headers, preserved verbatim.
    pub extension: StringMap,
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub request_line: RequestLine,
    pub general: GeneralHeaders,
    pub request: RequestHeaders,
    pub entity: EntityHeaders,
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: StatusLine,
    pub general: GeneralHeaders,
    pub response: ResponseHeaders,
    pub entity: EntityHeaders,
}

// ---------------------------------------------------------------------------
// Formatting

const TOKEN_CHARS: &[u8] = b"!#$%&'*+-.^_`|~";

pub(crate) fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || TOKEN_CHARS.contains(&byte)
}

fn is_token(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(is_token_char)
}

/// Quotes per RFC 7230: a valid `token` passes through untouched unless
/// `always_quote`; anything else becomes a `quoted-string` (or `comment`).
pub fn quote(value: &str, always_quote: bool, comment: bool) -> String {
    if !always_quote && !comment && is_token(value) {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push(if comment { '(' } else { '"' });
    for ch in value.chars() {
        if ch == '\\' || (!comment && ch == '"') || (comment && (ch == '(' || ch == ')')) {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push(if comment { ')' } else { '"' });
    quoted
}

/// Reverses [`quote`] for a quoted-string; bare tokens pass through.
pub fn unquote(value: &str) -> String {
    let inner = match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner,
        None => return value.to_string(),
    };
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    out
}

const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub fn format_http_date(date: &HttpDate) -> String {
    date.format(IMF_FIXDATE).to_string()
}

/// Parses the three date formats RFC 7231 requires acceptors to handle.
pub fn parse_http_date(value: &str) -> Option<HttpDate> {
    let value = value.trim();
    for format in [IMF_FIXDATE, "%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"] {
        if let Ok(parsed) = chrono::NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&parsed));
        }
    }
    None
}

fn fmt_qvalue(out: &mut String, qvalue: u16) {
    if qvalue >= 1000 {
        out.push_str(";q=1");
        return;
    }
    let _ = write!(out, ";q=0.{:03}", qvalue);
    while out.ends_with('0') {
        out.pop();
    }
    if out.ends_with('.') {
        out.pop();
    }
}

fn fmt_parameters(out: &mut String, parameters: &StringMap) {
    for (key, value) in parameters {
        let _ = write!(out, ";{}={}", key, quote(value, false, false));
    }
}

struct HeaderWriter<'a, 'b> {
    f: &'a mut fmt::Formatter<'b>,
}

impl HeaderWriter<'_, '_> {
    fn field(&mut self, name: &str, value: impl Display) -> fmt::Result {
        write!(self.f, "{name}: {value}\r\n")
    }

    fn optional(&mut self, name: &str, value: Option<impl Display>) -> fmt::Result {
        match value {
            Some(value) => self.field(name, value),
            None => Ok(()),
        }
    }

    fn date(&mut self, name: &str, value: &Option<HttpDate>) -> fmt::Result {
        match value {
            Some(date) => self.field(name, format_http_date(date)),
            None => Ok(()),
        }
    }

    fn set(&mut self, name: &str, set: &StringSet) -> fmt::Result {
        if set.is_empty() {
            return Ok(());
        }
        let joined = set
            .iter()
            .map(Caseless::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        self.field(name, joined)
    }

    fn parameterized(&mut self, name: &str, list: &ParameterizedList) -> fmt::Result {
        if list.is_empty() {
            return Ok(());
        }
        let mut out = String::new();
        for (index, element) in list.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            out.push_str(&element.value);
            fmt_parameters(&mut out, &element.parameters);
        }
        self.field(name, out)
    }

    fn accept(&mut self, name: &str, list: &AcceptList) -> fmt::Result {
        if list.is_empty() {
            return Ok(());
        }
        let mut out = String::new();
        for (index, element) in list.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            out.push_str(&element.value);
            if let Some(qvalue) = element.qvalue {
                fmt_qvalue(&mut out, qvalue);
            }
        }
        self.field(name, out)
    }

    fn accept_parameterized(&mut self, name: &str, list: &AcceptListWithParameters) -> fmt::Result {
        if list.is_empty() {
            return Ok(());
        }
        let mut out = String::new();
        for (index, element) in list.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            out.push_str(&element.value);
            fmt_parameters(&mut out, &element.parameters);
            if let Some(qvalue) = element.qvalue {
                fmt_qvalue(&mut out, qvalue);
            }
            fmt_parameters(&mut out, &element.accept_params);
        }
        self.field(name, out)
    }

    fn products(&mut self, name: &str, list: &ProductAndCommentList) -> fmt::Result {
        if list.is_empty() {
            return Ok(());
        }
        let mut out = String::new();
        for (index, element) in list.iter().enumerate() {
            if index > 0 {
                out.push(' ');
            }
            match element {
                ProductOrComment::Product(product) => {
                    let _ = write!(out, "{product}");
                }
                ProductOrComment::Comment(comment) => {
                    out.push_str(&quote(comment, true, true));
                }
            }
        }
        self.field(name, out)
    }

    fn auth(&mut self, name: &str, value: &Option<AuthParams>) -> fmt::Result {
        match value {
            Some(auth) => self.field(name, format_auth(auth)),
            None => Ok(()),
        }
    }

    fn challenges(&mut self, name: &str, list: &ChallengeList) -> fmt::Result {
        if list.is_empty() {
            return Ok(());
        }
        let joined = list.iter().map(format_auth).collect::<Vec<_>>().join(", ");
        self.field(name, joined)
    }

    fn general(&mut self, general: &GeneralHeaders) -> fmt::Result {
        self.set("Connection", &general.connection)?;
        self.date("Date", &general.date)?;
        self.set("Proxy-Connection", &general.proxy_connection)?;
        self.parameterized("Transfer-Encoding", &general.transfer_encoding)?;
        self.set("Trailer", &general.trailer)?;
        if !general.upgrade.is_empty() {
            let joined = general
                .upgrade
                .iter()
                .map(Product::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            self.field("Upgrade", joined)?;
        }
        Ok(())
    }

    fn entity(&mut self, entity: &EntityHeaders) -> fmt::Result {
        if !entity.content_encoding.is_empty() {
            self.field("Content-Encoding", entity.content_encoding.join(", "))?;
        }
        self.optional("Content-Length", entity.content_length)?;
        self.optional("Content-Range", entity.content_range)?;
        self.optional("Content-Type", entity.content_type.as_ref())?;
        self.date("Expires", &entity.expires)?;
        self.date("Last-Modified", &entity.last_modified)?;
        for (key, value) in &entity.extension {
            self.field(key.as_str(), value)?;
        }
        Ok(())
    }
}

fn format_auth(auth: &AuthParams) -> String {
    let mut out = auth.scheme.clone();
    if !auth.base64.is_empty() {
        let _ = write!(out, " {}", auth.base64);
    } else if !auth.parameters.is_empty() {
        let mut first = true;
        for (key, value) in &auth.parameters {
            out.push_str(if first { " " } else { ", " });
            first = false;
            let _ = write!(out, "{}={}", key, quote(value, false, false));
        }
    }
    out
}

impl Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}\r", self.request_line)?;
        let mut w = HeaderWriter { f };
        w.general(&self.general)?;
        let headers = &self.request;
        w.accept("Accept-Charset", &headers.accept_charset)?;
        w.accept("Accept-Encoding", &headers.accept_encoding)?;
        w.auth("Authorization", &headers.authorization)?;
        if !headers.expect.is_empty() {
            let mut out = String::new();
            for (index, element) in headers.expect.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(&element.key);
                if !element.value.is_empty() {
                    let _ = write!(out, "={}", quote(&element.value, false, false));
                }
                fmt_parameters(&mut out, &element.parameters);
            }
            w.field("Expect", out)?;
        }
        if !headers.host.is_empty() {
            w.field("Host", &headers.host)?;
        }
        if !headers.if_match.is_empty() {
            let joined = headers
                .if_match
                .iter()
                .map(ETag::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            w.field("If-Match", joined)?;
        }
        w.date("If-Modified-Since", &headers.if_modified_since)?;
        if !headers.if_none_match.is_empty() {
            let joined = headers
                .if_none_match
                .iter()
                .map(ETag::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            w.field("If-None-Match", joined)?;
        }
        match &headers.if_range {
            Some(IfRange::ETag(etag)) => w.field("If-Range", etag)?,
            Some(IfRange::Date(date)) => w.field("If-Range", format_http_date(date))?,
            None => {}
        }
        w.date("If-Unmodified-Since", &headers.if_unmodified_since)?;
        w.auth("Proxy-Authorization", &headers.proxy_authorization)?;
        if !headers.range.is_empty() {
            let mut out = String::from("bytes=");
            for (index, (first, last)) in headers.range.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                if let Some(first) = first {
                    let _ = write!(out, "{first}");
                }
                out.push('-');
                if let Some(last) = last {
                    let _ = write!(out, "{last}");
                }
            }
            w.field("Range", out)?;
        }
        w.optional("Referer", headers.referer.as_ref())?;
        w.accept_parameterized("TE", &headers.te)?;
        w.products("User-Agent", &headers.user_agent)?;
        w.entity(&self.entity)?;
        f.write_str("\r\n")
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}\r", self.status)?;
        let mut w = HeaderWriter { f };
        w.general(&self.general)?;
        let headers = &self.response;
        w.set("Accept-Ranges", &headers.accept_ranges)?;
        w.optional("ETag", headers.etag.as_ref())?;
        w.optional("Location", headers.location.as_ref())?;
        w.challenges("Proxy-Authenticate", &headers.proxy_authenticate)?;
        match &headers.retry_after {
            Some(RetryAfter::Date(date)) => w.field("Retry-After", format_http_date(date))?,
            Some(RetryAfter::Delta(delta)) => w.field("Retry-After", delta)?,
            None => {}
        }
        w.products("Server", &headers.server)?;
        w.challenges("WWW-Authenticate", &headers.www_authenticate)?;
        w.entity(&self.entity)?;
        f.write_str("\r\n")
    }
}

/// Formats an entity-header-only block (multipart part headers and chunked
/// trailers).
pub struct EntityHeadersBlock<'a>(pub &'a EntityHeaders);

impl Display for EntityHeadersBlock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut w = HeaderWriter { f };
        w.entity(self.0)
    }
}

// ---------------------------------------------------------------------------
// Acceptability

/// Whether `value` is acceptable per an Accept-style list. An empty or
/// silent list answers `default_missing`.
pub fn is_acceptable(
    list: &AcceptListWithParameters,
    value: &AcceptValueWithParameters,
    default_missing: bool,
) -> bool {
    for element in list {
        if element.value.eq_ignore_ascii_case(&value.value)
            && element.parameters == value.parameters
        {
            return element.qvalue.unwrap_or(1000) > 0;
        }
    }
    default_missing
}

/// Picks the client's most preferred element of `available` (which is
/// ordered by server preference, qvalue carrying the server's weight).
/// Returns `None` if the client accepts none of them.
pub fn preferred<'a>(
    list: &AcceptListWithParameters,
    available: &'a AcceptListWithParameters,
) -> Option<&'a AcceptValueWithParameters> {
    let mut best: Option<(&AcceptValueWithParameters, u32)> = None;
    for candidate in available {
        let client_q = list.iter().find_map(|element| {
            (element.value.eq_ignore_ascii_case(&candidate.value)
                && element.parameters == candidate.parameters)
                .then(|| element.qvalue.unwrap_or(1000))
        });
        let Some(client_q) = client_q else {
            continue;
        };
        if client_q == 0 {
            continue;
        }
        let weight = client_q as u32 * candidate.qvalue.unwrap_or(1000) as u32;
        match best {
            Some((_, best_weight)) if best_weight >= weight => {}
            _ => best = Some((candidate, weight)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quote_leaves_tokens_alone() {
        assert_eq!("token", quote("token", false, false));
        assert_eq!("\"two words\"", quote("two words", false, false));
        assert_eq!("\"a\\\"b\"", quote("a\"b", false, false));
    }

    #[test]
    fn unquote_round_trips() {
        for value in ["token", "two words", "a\"b", "back\\slash"] {
            assert_eq!(value, unquote(&quote(value, false, false)));
        }
    }

    #[test]
    fn http_date_round_trips() {
        let date = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!("Sun, 06 Nov 1994 08:49:37 GMT", format_http_date(&date));
    }

    #[test]
    fn obsolete_date_formats_are_accepted() {
        assert!(parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT").is_some());
        assert!(parse_http_date("Sun Nov  6 08:49:37 1994").is_some());
    }

    #[test]
    fn request_formats_canonically() {
        let mut request = Request::default();
        request.request_line.method = Method::Get;
        request.request_line.uri = "/index.html".to_string();
        request.request_line.ver = Some(Version::HTTP_1_1);
        request.request.host = "example.com".to_string();
        request.general.connection.insert(Caseless::from("close"));
        let text = request.to_string();
        assert!(text.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_uses_default_reason() {
        let mut response = Response::default();
        response.status.status = Status::NotFound;
        response.status.ver = Some(Version::HTTP_1_1);
        assert!(response.to_string().starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn caseless_set_ignores_case() {
        let mut set = StringSet::new();
        set.insert(Caseless::from("Keep-Alive"));
        assert!(set_contains(&set, "keep-alive"));
        assert!(!set_contains(&set, "close"));
    }

    #[test]
    fn preferred_weighs_client_and_server() {
        let client = vec![
            AcceptValueWithParameters::with_qvalue("gzip", 500),
            AcceptValueWithParameters::with_qvalue("deflate", 1000),
        ];
        let available = vec![
            AcceptValueWithParameters::with_qvalue("deflate", 1000),
            AcceptValueWithParameters::with_qvalue("gzip", 500),
        ];
        assert_eq!("deflate", preferred(&client, &available).unwrap().value);
    }

    #[test]
    fn is_acceptable_honors_default_for_missing() {
        let list = vec![AcceptValueWithParameters::with_qvalue("trailers", 1000)];
        assert!(is_acceptable(
            &list,
            &AcceptValueWithParameters::new("chunked"),
            true
        ));
        assert!(!is_acceptable(
            &list,
            &AcceptValueWithParameters::new("chunked"),
            false
        ));
    }

    #[test]
    fn qvalue_formats_minimally() {
        let mut out = String::new();
        fmt_qvalue(&mut out, 500);
        assert_eq!(";q=0.5", out);
        let mut out = String::new();
        fmt_qvalue(&mut out, 1000);
        assert_eq!(";q=1", out);
    }
}
