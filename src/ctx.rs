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

//! The context-switch primitive.
//!
//! This is deliberately a thin shim: the actual stack swap and non-local jump
//! are provided by the `context` crate (the same `boost.context`-derived
//! machinery the teacher lineage used), so the only thing left to us is
//! stack allocation and a couple of type aliases so the rest of the crate
//! doesn't have to spell out `context::...` everywhere.
//!
//! `context::Context::resume` consumes a `Context` and returns a `Transfer`
//! carrying a *new* `Context` representing the point execution just left —
//! ready to be resumed again later. A coroutine's suspension point is
//! therefore not a fixed object but a value that gets threaded forward on
//! every hand-off; see [`crate::coroutine`] for how that chain is stored.

use std::io;

pub use context::{Context, Transfer};
use context::stack::ProtectedFixedSizeStack;

use crate::error::{Error, Result};

/// A coroutine's private stack. Guard-paged by `context`, which is stricter
/// than the spec requires ("no guard page is required for correctness") but
/// free, and it turns a stack overflow into a clean SIGSEGV instead of silent
/// corruption of a neighboring allocation.
pub struct Stack(ProtectedFixedSizeStack);

impl Stack {
    pub fn allocate(size: usize) -> Result<Stack> {
        if size == 0 {
            return Err(Error::ZeroSizedStack);
        }
        ProtectedFixedSizeStack::new(size)
            .map(Stack)
            .map_err(|e| Error::Stack(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }

    pub fn as_context_stack(&self) -> &ProtectedFixedSizeStack {
        &self.0
    }
}

/// Builds the not-yet-running `Context` for a fresh coroutine. `entry` is
/// only ever invoked once, the first time this `Context` is resumed.
pub fn new_entry_context(stack: &Stack, entry: extern "C" fn(Transfer) -> !) -> Context {
    Context::new(stack.as_context_stack(), entry)
}
