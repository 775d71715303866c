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

//! Rate limiting via a caller-supplied throughput provider.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::Buffer;
use crate::error::StreamResult;
use crate::timer::{sleep, TimerManager};

use super::filter::{FilterBase, FilterStream};
use super::StreamHandle;

/// Returns the current limit in bits per second. `0` and `u64::MAX` both
/// mean unlimited, so a provider can be toggled without re-stacking.
pub type ThrottleProvider = Arc<dyn Fn() -> u64 + Send + Sync>;

// Never sleep longer than a tenth of a second per decision.
const MAX_SLEEP: Duration = Duration::from_millis(100);

struct Lane {
    last: Option<Instant>,
    moved: usize,
}

/// Limits read and write throughput independently, sleeping the current
/// fiber through the timer manager when recent throughput would exceed the
/// provider's limit.
pub struct ThrottleStream {
    base: FilterBase,
    provider: ThrottleProvider,
    timers: Option<TimerManager>,
    read_lane: Mutex<Lane>,
    write_lane: Mutex<Lane>,
}

impl ThrottleStream {
    pub fn new(
        parent: StreamHandle,
        own: bool,
        provider: ThrottleProvider,
        timers: Option<TimerManager>,
    ) -> Self {
        ThrottleStream {
            base: FilterBase::new(parent, own),
            provider,
            timers,
            read_lane: Mutex::new(Lane {
                last: None,
                moved: 0,
            }),
            write_lane: Mutex::new(Lane {
                last: None,
                moved: 0,
            }),
        }
    }

    /// Applies the limit to one lane and returns the clamped transfer
    /// size for this decision.
    fn pace(&self, lane: &Mutex<Lane>, len: usize) -> usize {
        let throttle = (self.provider)();
        if throttle == 0 || throttle == u64::MAX {
            let mut lane = lane.lock().unwrap();
            lane.moved = 0;
            return len;
        }
        let now = Instant::now();
        let (min_time, actual_time) = {
            let lane = lane.lock().unwrap();
            let min_micros = 1_000_000u128 * (lane.moved as u128 * 8) / throttle as u128;
            let actual = lane
                .last
                .map(|last| now.duration_since(last))
                .unwrap_or(Duration::MAX);
            (Duration::from_micros(min_micros.min(u64::MAX as u128) as u64), actual)
        };
        if actual_time < min_time {
            let wanted = min_time - actual_time;
            let nap = wanted.min(MAX_SLEEP);
            debug!(?nap, throttle, "throttling");
            match &self.timers {
                Some(timers) => sleep(timers, nap),
                None => std::thread::sleep(nap),
            }
            lane.lock().unwrap().last = Some(Instant::now());
        } else {
            lane.lock().unwrap().last = Some(now);
        }
        // Aim for no more than a tenth of a second's worth of data.
        let clamp = (throttle / 8 / 10).min(usize::MAX as u64) as usize;
        len.min(clamp).max(1)
    }
}

impl FilterStream for ThrottleStream {
    fn parent(&self) -> StreamHandle {
        self.base.parent()
    }

    fn owns_parent(&self) -> bool {
        self.base.owns_parent()
    }

    fn read(&self, buffer: &mut Buffer, len: usize) -> StreamResult<usize> {
        debug_assert!(len != 0);
        let len = self.pace(&self.read_lane, len);
        let result = self.parent().read(buffer, len)?;
        self.read_lane.lock().unwrap().moved = result;
        Ok(result)
    }

    fn write(&self, buffer: &Buffer, len: usize) -> StreamResult<usize> {
        debug_assert!(len != 0);
        let len = self.pace(&self.write_lane, len);
        let result = self.parent().write(buffer, len)?;
        self.write_lane.lock().unwrap().moved = result;
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::streams::memory::MemoryStream;
    use crate::streams::{transfer_all, Stream};

    #[test]
    fn unlimited_provider_passes_through() {
        let parent = Arc::new(MemoryStream::from(b"abcdefgh"));
        let throttled = ThrottleStream::new(parent, false, Arc::new(|| 0), None);
        let out = MemoryStream::new();
        assert_eq!(8, transfer_all(&throttled, &out).unwrap());
    }

    #[test]
    fn tight_limit_clamps_each_read() {
        // 80 bits/s => 1 byte per tenth-of-a-second decision.
        let parent = Arc::new(MemoryStream::from(b"abcdef"));
        let throttled = ThrottleStream::new(parent, false, Arc::new(|| 80), None);
        let mut buffer = Buffer::new();
        let read = Stream::read(&throttled, &mut buffer, 6).unwrap();
        assert_eq!(1, read);
    }

    #[test]
    fn sleep_is_clamped_to_the_decision_limit() {
        let parent = Arc::new(MemoryStream::from(&[0u8; 64]));
        let throttled = ThrottleStream::new(parent, false, Arc::new(|| 8), None);
        let mut buffer = Buffer::new();
        // First read primes the lane; the second would owe seconds of
        // sleep, but must be clamped to about 100ms.
        Stream::read(&throttled, &mut buffer, 8).unwrap();
        let start = Instant::now();
        Stream::read(&throttled, &mut buffer, 8).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
