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

//! TCP front door for the HTTP engine.
//!
//! The listener accepts on a fiber parked on the I/O manager; each
//! accepted connection becomes a [`SocketStream`] with a
//! [`ServerConnection`] processing its requests. Connections keep
//! themselves alive through the request fibers that reference them.

use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpListener;
use mio::Token;
use tracing::{debug, warn};

use crate::error::StreamResult;
use crate::fiber::Scheduler;
use crate::http::client::ClientConnection;
use crate::http::server::{RequestHandler, ServerConnection};
use crate::io::{Direction, IoManager};
use crate::streams::socket::SocketStream;
use crate::timer::TimerManager;

/// Bound listening socket.
pub struct TcpServer {
    listener: TcpListener,
    token: Token,
    io: IoManager,
    scheduler: Scheduler,
}

impl TcpServer {
    pub fn bind(io: &IoManager, scheduler: &Scheduler, addr: SocketAddr) -> StreamResult<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let token = io.register_source(&mut listener)?;
        Ok(TcpServer {
            listener,
            token,
            io: io.clone(),
            scheduler: scheduler.clone(),
        })
    }

    pub fn local_addr(&self) -> StreamResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; run it on a fiber. Returns when the registration is
    /// cancelled.
    pub fn run(&self, handler: RequestHandler) -> StreamResult<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let socket = match SocketStream::new(&self.io, stream) {
                        Ok(socket) => socket,
                        Err(err) => {
                            warn!(%err, "failed to adopt accepted socket");
                            continue;
                        }
                    };
                    let connection = ServerConnection::new(
                        Arc::new(socket),
                        self.scheduler.clone(),
                        handler.clone(),
                    );
                    connection.process_requests();
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.io.wait_ready(self.token, Direction::Read)?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Unblocks a fiber parked in [`TcpServer::run`].
    pub fn stop(&self) {
        self.io.cancel_wait(self.token, Direction::Read);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let token = self.token;
        let io = self.io.clone();
        io.deregister_source(&mut self.listener, token);
    }
}

/// Opens a client connection to `addr`.
pub fn connect(
    io: &IoManager,
    addr: SocketAddr,
    timers: Option<TimerManager>,
) -> StreamResult<ClientConnection> {
    let socket = SocketStream::connect(io, addr)?;
    let _ = socket.set_nodelay(true);
    Ok(ClientConnection::new(Arc::new(socket), timers))
}
