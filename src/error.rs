// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Crate-wide error type.
//!
//! The runtime is nearly infallible at the API level: the handful of things
//! that can actually fail are construction-time resource
//! acquisition. Misuse (resuming a coroutine that isn't ready for it, calling
//! `yield_now` outside a running coroutine) is a logic bug, not a recoverable
//! error, and is asserted against in debug builds instead of being threaded
//! through `Result`.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to allocate coroutine stack: {0}")]
    Stack(#[source] io::Error),

    #[error("failed to create event descriptor: {0}")]
    Event(#[source] io::Error),

    #[error("failed to set up the readiness gate: {0}")]
    Gate(#[source] io::Error),

    #[error("coroutine stack_size must be nonzero")]
    ZeroSizedStack,
}
