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

#![warn(rust_2018_idioms, unused_imports)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! strand is a fiber-multiplexed HTTP/1.1 client and server over a
//! composable byte-stream stack.
//!
//! The two halves are tightly coupled: the HTTP engine is expressed in
//! terms of the stream stack, and its pipelining and cancellation
//! correctness rely on the stream contract. Cooperative fibers multiplexed
//! by the [`fiber::Scheduler`] drive request and response directions
//! concurrently within one connection; readiness comes from the
//! [`io::IoManager`], deadlines from the [`timer::TimerManager`].

pub mod buffer;
pub mod error;
pub mod fiber;
pub mod http;
pub mod io;
pub mod net;
pub mod streams;
pub mod timer;

pub use buffer::Buffer;
pub use error::{HttpError, StreamError};
pub use fiber::Scheduler;
pub use io::IoManager;
pub use streams::{Stream, StreamHandle};
pub use timer::TimerManager;
