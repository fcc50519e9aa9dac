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

//! Single-threaded stackful coroutines scheduled by file-descriptor readiness.
//!
//! A [`Machine`] owns a fixed set of coroutines and runs them cooperatively on
//! the OS thread that calls [`Machine::run`]: exactly one coroutine executes
//! at a time, and it only gives up control by calling one of
//! [`CoroutineHandle::yield_now`], [`CoroutineHandle::wait`],
//! [`CoroutineHandle::call`]/[`CoroutineHandle::yield_value`], or by
//! returning/[`CoroutineHandle::exit`]ing. Between hand-offs, the machine asks
//! the host's readiness multiplexer (epoll/kqueue, via [`mio`]) which
//! descriptor became ready and wakes the coroutine waiting on it.
//!
//! ```no_run
//! use corofd::Machine;
//!
//! let machine = Machine::new().expect("machine");
//! let co = machine
//!     .spawn(|me| {
//!         println!("before yield");
//!         me.yield_now();
//!         println!("back again");
//!     })
//!     .expect("spawn");
//! co.start();
//! machine.run();
//! ```

mod coroutine;
mod ctx;
mod error;
mod gate;
mod id;
mod machine;

pub use coroutine::{CoroutineHandle, State, DEFAULT_STACK_SIZE};
pub use error::{Error, Result};
pub use gate::{Interest, Readiness};
pub use machine::{CoroutineBuilder, Machine, MachineConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn yield_now_resumes_a_hundred_times() {
        let machine = Machine::new().expect("machine");
        let count = Rc::new(RefCell::new(0));
        let count_in = count.clone();

        let co = machine
            .spawn(move |me| {
                for _ in 0..100 {
                    *count_in.borrow_mut() += 1;
                    me.yield_now();
                }
            })
            .expect("spawn");
        co.start();
        machine.run();

        assert_eq!(*count.borrow(), 100);
        assert_eq!(co.state(), State::Dead);
    }

    #[test]
    fn generator_produces_values_in_order() {
        let machine = Machine::new().expect("machine");
        let producer = machine
            .spawn(|me| {
                for v in 1..=4 {
                    me.yield_value(v);
                }
            })
            .expect("spawn");

        let main = machine
            .spawn(move |me| {
                let mut seen = Vec::new();
                while me.is_alive(&producer) {
                    if let Some(v) = me.call::<i32>(&producer) {
                        seen.push(v);
                    }
                }
                assert_eq!(seen, vec![1, 2, 3, 4]);
            })
            .expect("spawn");
        main.start();
        machine.run();
    }

    #[test]
    fn stop_halts_the_loop_early() {
        let machine = Machine::new().expect("machine");
        let m = machine.clone();
        let ticks = Rc::new(RefCell::new(0));
        let ticks_in = ticks.clone();

        machine
            .spawn(move |me| loop {
                *ticks_in.borrow_mut() += 1;
                if *ticks_in.borrow() == 3 {
                    m.stop();
                }
                me.yield_now();
            })
            .expect("spawn")
            .start();

        machine.run();
        assert!(*ticks.borrow() >= 3);
    }
}
