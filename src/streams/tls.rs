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

//! TLS over any byte stream.
//!
//! [`TlsStream::connect`] / [`TlsStream::accept`] drive the handshake by
//! alternately moving ciphertext between the rustls connection and the
//! parent stream; data operations do the same on demand. Certificate chain
//! validation is rustls's job (configured through the `ClientConfig`);
//! [`TlsStream::verify_peer_certificate`] enforces the hostname policy,
//! with a wildcard permitted in the first label only.
//!
//! The rustls state is never locked across a blocking parent operation, so
//! a reader fiber and a writer fiber can share one TLS session.

use std::sync::{Arc, Mutex};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use tracing::trace;

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};

use super::filter::{FilterBase, FilterStream};
use super::{CloseType, StreamHandle};

const CHUNK: usize = 16 * 1024;

struct TlsState {
    conn: Connection,
    parent_eof: bool,
    close_notify_sent: bool,
}

pub struct TlsStream {
    base: FilterBase,
    state: Mutex<TlsState>,
    server_name: Option<String>,
}

impl TlsStream {
    /// Client side. `server_name` doubles as the SNI hint.
    pub fn client(
        parent: StreamHandle,
        own: bool,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> StreamResult<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| StreamError::CertificateMismatch(server_name.to_string()))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(TlsStream {
            base: FilterBase::new(parent, own),
            state: Mutex::new(TlsState {
                conn: Connection::Client(conn),
                parent_eof: false,
                close_notify_sent: false,
            }),
            server_name: Some(server_name.to_string()),
        })
    }

    /// Server side.
    pub fn server(parent: StreamHandle, own: bool, config: Arc<ServerConfig>) -> StreamResult<Self> {
        let conn = ServerConnection::new(config)?;
        Ok(TlsStream {
            base: FilterBase::new(parent, own),
            state: Mutex::new(TlsState {
                conn: Connection::Server(conn),
                parent_eof: false,
                close_notify_sent: false,
            }),
            server_name: None,
        })
    }

    /// Drives the client handshake to completion.
    pub fn connect(&self) -> StreamResult<()> {
        self.handshake()
    }

    /// Drives the server handshake to completion.
    pub fn accept(&self) -> StreamResult<()> {
        self.handshake()
    }

    fn handshake(&self) -> StreamResult<()> {
        loop {
            let (handshaking, outbound) = {
                let mut state = self.state.lock().unwrap();
                (state.conn.is_handshaking(), drain_tls(&mut state.conn))
            };
            if !outbound.is_empty() {
                super::write_all(&*self.parent(), &outbound)?;
                self.parent().flush(false)?;
            }
            if !handshaking {
                return Ok(());
            }
            self.pump_inbound()?;
        }
    }

    /// Reads ciphertext from the parent and feeds it to rustls. Called
    /// with the state lock released.
    fn pump_inbound(&self) -> StreamResult<()> {
        let mut raw = Buffer::new();
        let read = self.parent().read(&mut raw, CHUNK)?;
        let mut state = self.state.lock().unwrap();
        if read == 0 {
            state.parent_eof = true;
            return Ok(());
        }
        let flat = raw.to_vec();
        let mut cursor: &[u8] = &flat;
        while !cursor.is_empty() {
            state
                .conn
                .read_tls(&mut cursor)
                .map_err(StreamError::from)?;
            state.conn.process_new_packets()?;
        }
        Ok(())
    }

    /// Checks the negotiated peer identity against `hostname`.
    pub fn verify_peer_certificate(&self, hostname: &str) -> StreamResult<()> {
        {
            let state = self.state.lock().unwrap();
            if state.conn.peer_certificates().is_none() {
                return Err(StreamError::CertificateMismatch(hostname.to_string()));
            }
        }
        let Some(verified) = &self.server_name else {
            return Err(StreamError::CertificateMismatch(hostname.to_string()));
        };
        if verified.eq_ignore_ascii_case(hostname) || hostname_matches(verified, hostname) {
            return Ok(());
        }
        Err(StreamError::CertificateMismatch(hostname.to_string()))
    }

    /// The SNI hint sent (client) or received (server).
    pub fn server_name(&self) -> Option<String> {
        if let Some(name) = &self.server_name {
            return Some(name.clone());
        }
        let state = self.state.lock().unwrap();
        match &state.conn {
            Connection::Server(server) => server.server_name().map(str::to_string),
            Connection::Client(_) => None,
        }
    }
}

fn drain_tls(conn: &mut Connection) -> Vec<u8> {
    let mut outbound = Vec::new();
    while conn.wants_write() {
        // Writing into a Vec cannot fail.
        let _ = conn.write_tls(&mut outbound);
    }
    outbound
}

/// DNS-style hostname match: case-insensitive, `*` allowed as the whole
/// first label and matching exactly one label.
pub fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    if pattern.eq_ignore_ascii_case(hostname) {
        return true;
    }
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    let Some((first, rest)) = hostname.split_once('.') else {
        return false;
    };
    !first.is_empty() && rest.eq_ignore_ascii_case(suffix)
}

impl FilterStream for TlsStream {
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
        self.parent().supports_read()
    }

    fn supports_write(&self) -> bool {
        self.parent().supports_write()
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        loop {
            let outbound = {
                let mut state = self.state.lock().unwrap();
                match std::io::Read::read(&mut state.conn.reader(), buffer.write_slice(len)) {
                    Ok(read) => {
                        buffer.produce(read);
                        return Ok(read);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        if state.parent_eof {
                            // Truncated: the transport ended without a
                            // close_notify.
                            return Err(StreamError::UnexpectedEof);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                        return Err(StreamError::UnexpectedEof);
                    }
                    Err(err) => return Err(err.into()),
                }
                drain_tls(&mut state.conn)
            };
            if !outbound.is_empty() {
                super::write_all(&*self.parent(), &outbound)?;
            }
            self.pump_inbound()?;
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        let mut window = Buffer::new();
        window.copy_in_from(buffer, len);
        let flat = window.to_vec();
        let (written, outbound) = {
            let mut state = self.state.lock().unwrap();
            let written = std::io::Write::write(&mut state.conn.writer(), &flat)
                .map_err(StreamError::from)?;
            (written, drain_tls(&mut state.conn))
        };
        if !outbound.is_empty() {
            super::write_all(&*self.parent(), &outbound)?;
        }
        trace!(written, "tls write");
        Ok(written)
    }

    fn flush(&self, flush_parent: bool) -> StreamResult<()> {
        let outbound = {
            let mut state = self.state.lock().unwrap();
            drain_tls(&mut state.conn)
        };
        if !outbound.is_empty() {
            super::write_all(&*self.parent(), &outbound)?;
        }
        if flush_parent {
            self.parent().flush(true)?;
        }
        Ok(())
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        if close_type.closes_write() {
            let outbound = {
                let mut state = self.state.lock().unwrap();
                if !state.close_notify_sent {
                    state.close_notify_sent = true;
                    state.conn.send_close_notify();
                }
                drain_tls(&mut state.conn)
            };
            if !outbound.is_empty() {
                super::write_all(&*self.parent(), &outbound)?;
                self.parent().flush(false)?;
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
    use super::hostname_matches;

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(hostname_matches("Example.COM", "example.com"));
    }

    #[test]
    fn wildcard_matches_exactly_one_label() {
        assert!(hostname_matches("*.example.com", "www.example.com"));
        assert!(!hostname_matches("*.example.com", "a.b.example.com"));
        assert!(!hostname_matches("*.example.com", "example.com"));
    }

    #[test]
    fn wildcard_only_in_first_label() {
        assert!(!hostname_matches("www.*.com", "www.example.com"));
    }
}
