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

//! Bounded source of random bytes.

use std::sync::Mutex;

use rand::RngCore;

use crate::buffer::Buffer;
use crate::error::StreamResult;

use super::Stream;

/// Produces `len` random bytes, then EOF.
#[derive(Debug)]
pub struct RandomStream {
    remaining: Mutex<u64>,
}

impl RandomStream {
    pub fn new(len: u64) -> Self {
        RandomStream {
            remaining: Mutex::new(len),
        }
    }
}

impl Stream for RandomStream {
    fn supports_read(&self) -> bool {
        true
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        let mut remaining = self.remaining.lock().unwrap();
        let take = (*remaining).min(len as u64) as usize;
        if take > 0 {
            rand::thread_rng().fill_bytes(buffer.write_slice(take));
            buffer.produce(take);
            *remaining -= take as u64;
        }
        Ok(take)
    }
}
