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

//! Error taxonomy for the stream stack and the HTTP engine.

use std::io;

use thiserror::Error;

/// Which part of a chunked transfer coding failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPart {
    /// The hex size line introducing a chunk.
    Header,
    /// The CRLF terminating a chunk's data.
    Footer,
}

/// Errors raised by streams and filters.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The stream ended before the operation could be satisfied.
    #[error("unexpected end of stream")]
    UnexpectedEof,
    /// A write was attempted past the fixed end of a stream.
    #[error("write beyond end of stream")]
    WriteBeyondEof,
    /// A blocking operation was cancelled by `cancel_read`/`cancel_write`.
    #[error("operation aborted")]
    OperationAborted,
    /// A timeout stream latched after one of its timers expired.
    #[error("timed out")]
    TimedOut,
    /// A bounded search scanned past its sanity limit.
    #[error("buffer overflow")]
    BufferOverflow,
    /// The peer closed the connection while data remained to be written.
    #[error("broken pipe")]
    BrokenPipe,
    /// A chunked transfer coding line could not be parsed.
    #[error("invalid chunk {part:?}: {line:?}")]
    InvalidChunk {
        /// Header or footer.
        part: ChunkPart,
        /// The offending line, verbatim.
        line: String,
    },
    /// Compressed data did not start with a recognized header.
    #[error("unknown compression format")]
    UnknownFormat,
    /// Compressed data failed to decode.
    #[error("corrupted compressed data")]
    Corrupted,
    /// The deflate stream requires a preset dictionary we do not have.
    #[error("preset dictionary required")]
    NeedPresetDictionary,
    /// TLS handshake or record-layer failure.
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    /// The peer certificate did not match the expected hostname.
    #[error("certificate does not match hostname {0:?}")]
    CertificateMismatch(String),
    /// The operation is not supported by this stream.
    #[error("unsupported stream operation: {0}")]
    Unsupported(&'static str),
    /// An underlying I/O failure.
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => StreamError::UnexpectedEof,
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => StreamError::BrokenPipe,
            _ => StreamError::Io(err),
        }
    }
}

impl StreamError {
    /// Clones the error for reporting to a second observer.
    ///
    /// `io::Error` is not `Clone`, so transport errors degrade to a copy
    /// carrying the same kind and message.
    pub fn duplicate(&self) -> StreamError {
        match self {
            StreamError::UnexpectedEof => StreamError::UnexpectedEof,
            StreamError::WriteBeyondEof => StreamError::WriteBeyondEof,
            StreamError::OperationAborted => StreamError::OperationAborted,
            StreamError::TimedOut => StreamError::TimedOut,
            StreamError::BufferOverflow => StreamError::BufferOverflow,
            StreamError::BrokenPipe => StreamError::BrokenPipe,
            StreamError::InvalidChunk { part, line } => StreamError::InvalidChunk {
                part: *part,
                line: line.clone(),
            },
            StreamError::UnknownFormat => StreamError::UnknownFormat,
            StreamError::Corrupted => StreamError::Corrupted,
            StreamError::NeedPresetDictionary => StreamError::NeedPresetDictionary,
            StreamError::Tls(err) => StreamError::Tls(err.clone()),
            StreamError::CertificateMismatch(host) => {
                StreamError::CertificateMismatch(host.clone())
            }
            StreamError::Unsupported(op) => StreamError::Unsupported(op),
            StreamError::Io(err) => {
                StreamError::Io(io::Error::new(err.kind(), err.to_string()))
            }
        }
    }
}

/// Errors raised by the HTTP engine.
#[derive(Error, Debug)]
pub enum HttpError {
    /// Message headers could not be parsed at all.
    #[error("bad message header")]
    BadMessageHeader,
    /// The stream ended in the middle of message headers.
    #[error("incomplete message header")]
    IncompleteMessageHeader,
    /// Headers parsed, but are not logically valid.
    #[error("invalid message header: {0}")]
    InvalidMessageHeader(String),
    /// The transfer-coding stack is unsupported or malformed.
    #[error("invalid transfer encoding: {0}")]
    InvalidTransferEncoding(String),
    /// An earlier request on this connection failed, poisoning this one.
    #[error("prior request failed")]
    PriorRequestFailed,
    /// The peer announced connection close before this request's turn.
    #[error("connection voluntarily closed")]
    ConnectionVoluntarilyClosed,
    /// A `multipart/*` content type without a boundary parameter.
    #[error("missing multipart boundary")]
    MissingMultipartBoundary,
    /// A multipart boundary that violates the grammar, or data that does
    /// not frame on it.
    #[error("invalid multipart boundary")]
    InvalidMultipartBoundary,
    /// A stream-level failure underneath the HTTP engine.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl HttpError {
    /// See [`StreamError::duplicate`].
    pub fn duplicate(&self) -> HttpError {
        match self {
            HttpError::BadMessageHeader => HttpError::BadMessageHeader,
            HttpError::IncompleteMessageHeader => HttpError::IncompleteMessageHeader,
            HttpError::InvalidMessageHeader(m) => HttpError::InvalidMessageHeader(m.clone()),
            HttpError::InvalidTransferEncoding(m) => {
                HttpError::InvalidTransferEncoding(m.clone())
            }
            HttpError::PriorRequestFailed => HttpError::PriorRequestFailed,
            HttpError::ConnectionVoluntarilyClosed => HttpError::ConnectionVoluntarilyClosed,
            HttpError::MissingMultipartBoundary => HttpError::MissingMultipartBoundary,
            HttpError::InvalidMultipartBoundary => HttpError::InvalidMultipartBoundary,
            HttpError::Stream(err) => HttpError::Stream(err.duplicate()),
        }
    }
}

/// Result alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Result alias for HTTP operations.
pub type HttpResult<T> = Result<T, HttpError>;
