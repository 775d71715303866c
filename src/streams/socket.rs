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

//! Nonblocking TCP stream driven by the I/O manager.
//!
//! Reads and writes run on the calling fiber; `WouldBlock` parks the fiber
//! on the readiness slot until the poller resumes it. `cancel_read` and
//! `cancel_write` abort a parked fiber from anywhere.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use mio::Token;

use crate::buffer::Buffer;
use crate::error::StreamResult;
use crate::io::{Direction, IoManager};

use super::{CloseType, Stream};

pub struct SocketStream {
    stream: TcpStream,
    token: Token,
    io: IoManager,
}

impl SocketStream {
    /// Adopts an already-connected nonblocking stream.
    pub fn new(io: &IoManager, mut stream: TcpStream) -> StreamResult<Self> {
        let token = io.register_source(&mut stream)?;
        Ok(SocketStream {
            stream,
            token,
            io: io.clone(),
        })
    }

    /// Opens a connection, parking the caller until it is established.
    pub fn connect(io: &IoManager, addr: SocketAddr) -> StreamResult<Self> {
        let stream = TcpStream::connect(addr)?;
        let socket = SocketStream::new(io, stream)?;
        socket.io.wait_ready(socket.token, Direction::Write)?;
        if let Some(err) = socket.stream.take_error()? {
            return Err(err.into());
        }
        // Connection refused surfaces as an error-less writable event on
        // some platforms; peer_addr is the portable check.
        socket.stream.peer_addr()?;
        Ok(socket)
    }

    pub fn peer_addr(&self) -> StreamResult<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn local_addr(&self) -> StreamResult<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> StreamResult<()> {
        Ok(self.stream.set_nodelay(nodelay)?)
    }
}

impl Drop for SocketStream {
    fn drop(&mut self) {
        let token = self.token;
        let io = self.io.clone();
        io.deregister_source(&mut self.stream, token);
    }
}

impl Stream for SocketStream {
    fn supports_read(&self) -> bool {
        true
    }
    fn supports_write(&self) -> bool {
        true
    }
    fn supports_half_close(&self) -> bool {
        true
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        loop {
            match (&self.stream).read(buffer.write_slice(len)) {
                Ok(read) => {
                    buffer.produce(read);
                    return Ok(read);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.io.wait_ready(self.token, Direction::Read)?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        let slice = buffer
            .read_buffers()
            .next()
            .expect("write of empty buffer");
        let take = slice.len().min(len);
        loop {
            match (&self.stream).write(&slice[..take]) {
                Ok(written) => return Ok(written),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.io.wait_ready(self.token, Direction::Write)?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        let how = match close_type {
            CloseType::Read => Shutdown::Read,
            CloseType::Write => Shutdown::Write,
            CloseType::Both => Shutdown::Both,
        };
        match self.stream.shutdown(how) {
            Ok(()) => Ok(()),
            // Already gone; close is idempotent.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn cancel_read(&self) {
        self.io.cancel_wait(self.token, Direction::Read);
    }

    fn cancel_write(&self) {
        self.io.cancel_wait(self.token, Direction::Write);
    }
}
