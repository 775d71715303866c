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

//! In-memory full-duplex pipe.
//!
//! [`pipe`] returns two connected ends. Data written on one end is read on
//! the other; a reader with nothing available parks until the writer
//! produces, closes, or cancels. Both ends support half-close, so the pair
//! behaves like a loopback socket for the HTTP engine and its tests.

use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::error::{StreamError, StreamResult};
use crate::fiber::{Parker, Resumer, Wakeup};

use super::{CloseType, Stream, StreamHandle};

#[derive(Default)]
struct Channel {
    buffer: Buffer,
    write_closed: bool,
    read_closed: bool,
    reader: Option<Resumer>,
}

#[derive(Default)]
struct PipeState {
    // channels[e] carries data written by end e.
    channels: [Channel; 2],
}

/// One end of an in-memory pipe.
pub struct PipeStream {
    state: Arc<Mutex<PipeState>>,
    end: usize,
}

/// Creates a connected pair of pipe ends.
pub fn pipe() -> (StreamHandle, StreamHandle) {
    let state = Arc::new(Mutex::new(PipeState::default()));
    (
        Arc::new(PipeStream {
            state: state.clone(),
            end: 0,
        }),
        Arc::new(PipeStream { state, end: 1 }),
    )
}

impl PipeStream {
    #[inline]
    fn inbound(&self) -> usize {
        1 - self.end
    }
}

impl Stream for PipeStream {
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
            let parker = {
                let mut state = self.state.lock().unwrap();
                let channel = &mut state.channels[self.inbound()];
                if channel.read_closed {
                    return Err(StreamError::OperationAborted);
                }
                if !channel.buffer.is_empty() {
                    let take = channel.buffer.read_available().min(len);
                    buffer.copy_in_from(&channel.buffer, take);
                    channel.buffer.consume(take);
                    return Ok(take);
                }
                if channel.write_closed {
                    return Ok(0);
                }
                debug_assert!(channel.reader.is_none(), "concurrent readers on one pipe end");
                let parker = Parker::new();
                channel.reader = Some(parker.resumer());
                parker
            };
            match parker.park() {
                Wakeup::Resume => continue,
                Wakeup::Abort => return Err(StreamError::OperationAborted),
            }
        }
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        debug_assert!(buffer.read_available() >= len);
        let reader = {
            let mut state = self.state.lock().unwrap();
            let channel = &mut state.channels[self.end];
            if channel.write_closed {
                return Err(StreamError::BrokenPipe);
            }
            if channel.read_closed {
                return Err(StreamError::BrokenPipe);
            }
            channel.buffer.copy_in_from(buffer, len);
            channel.reader.take()
        };
        if let Some(reader) = reader {
            reader.resume(Wakeup::Resume);
        }
        Ok(len)
    }

    fn close(&self, close_type: CloseType) -> StreamResult<()> {
        let mut resumers = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if close_type.closes_write() {
                let channel = &mut state.channels[self.end];
                channel.write_closed = true;
                // Wake the peer's reader so it observes EOF.
                resumers.extend(channel.reader.take());
            }
            if close_type.closes_read() {
                let channel = &mut state.channels[self.inbound()];
                channel.read_closed = true;
                resumers.extend(channel.reader.take());
            }
        }
        for resumer in resumers {
            resumer.resume(Wakeup::Resume);
        }
        Ok(())
    }

    fn cancel_read(&self) {
        let reader = {
            let mut state = self.state.lock().unwrap();
            state.channels[self.inbound()].reader.take()
        };
        if let Some(reader) = reader {
            reader.resume(Wakeup::Abort);
        }
    }

    fn cancel_write(&self) {
        // Writes never block; nothing to cancel.
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::write_all;
    use std::time::Duration;

    #[test]
    fn bytes_cross_between_ends() {
        let (a, b) = pipe();
        write_all(&*a, b"ping").unwrap();
        let mut buffer = Buffer::new();
        assert_eq!(4, b.read(&mut buffer, 16).unwrap());
        assert_eq!(buffer, b"ping" as &[u8]);
    }

    #[test]
    fn close_write_is_eof_for_the_peer() {
        let (a, b) = pipe();
        write_all(&*a, b"last").unwrap();
        a.close(CloseType::Write).unwrap();
        let mut buffer = Buffer::new();
        assert_eq!(4, b.read(&mut buffer, 16).unwrap());
        assert_eq!(0, b.read(&mut buffer, 16).unwrap());
    }

    #[test]
    fn blocked_reader_wakes_on_write() {
        let (a, b) = pipe();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            write_all(&*a, b"late").unwrap();
        });
        let mut buffer = Buffer::new();
        assert_eq!(4, b.read(&mut buffer, 16).unwrap());
        writer.join().unwrap();
    }

    #[test]
    fn cancel_read_aborts_a_blocked_reader() {
        let (_a, b) = pipe();
        let b2 = b.clone();
        let reader = std::thread::spawn(move || {
            let mut buffer = Buffer::new();
            b2.read(&mut buffer, 16)
        });
        std::thread::sleep(Duration::from_millis(5));
        b.cancel_read();
        assert!(matches!(
            reader.join().unwrap(),
            Err(StreamError::OperationAborted)
        ));
    }

    #[test]
    fn write_after_peer_close_read_is_broken_pipe() {
        let (a, b) = pipe();
        b.close(CloseType::Read).unwrap();
        assert!(matches!(
            a.write(&Buffer::from(b"x"), 1),
            Err(StreamError::BrokenPipe)
        ));
    }
}
