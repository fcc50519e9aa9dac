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

//! The readiness gate: a single syscall that reports which of N registered
//! descriptors became ready, plus a user-triggerable event object.
//!
//! The multiplexing itself is `mio::Poll` (epoll on Linux, kqueue on
//! macOS/BSD). The user-triggerable event is hand-rolled per platform — an
//! `eventfd(2)` on Linux, a kqueue `EVFILT_USER` everywhere else kqueue is
//! available — since mio does not expose a portable "fire this readiness by
//! hand" primitive for raw fds.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Interest as MioInterest, Poll, Token};

use crate::error::{Error, Result};

bitflags! {
    /// The interest mask a `wait` registers: a subset of
    /// `{readable, writable}`, matching the host readiness primitive's flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
    }
}

bitflags! {
    /// The readiness actually observed for a descriptor: a subset of
    /// `{readable, writable, error}`. `ERROR` folds in both `POLLERR` and
    /// `POLLHUP` — the caller must recheck the descriptor to tell them apart
    /// rather than having the coroutine killed out from under it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        const ERROR = 0b100;
    }
}

impl Interest {
    fn to_mio(self) -> MioInterest {
        match (
            self.contains(Interest::READABLE),
            self.contains(Interest::WRITABLE),
        ) {
            (true, true) => MioInterest::READABLE.add(MioInterest::WRITABLE),
            (true, false) => MioInterest::READABLE,
            (false, true) => MioInterest::WRITABLE,
            (false, false) => MioInterest::READABLE,
        }
    }
}

/// A user-triggerable, level-triggered readiness object.
///
/// One of these is owned by every coroutine (its `event_slot`) and one by
/// the machine (its `interrupt_event`). `fire` makes it readable from any
/// context (including another coroutine, which is how `call`/`yield_value`
/// wake a peer); `clear` makes it not-readable again.
#[cfg(target_os = "linux")]
pub struct Event {
    fd: RawFd,
}

#[cfg(target_os = "linux")]
impl Event {
    pub fn new() -> Result<Event> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Event(io::Error::last_os_error()));
        }
        Ok(Event { fd })
    }

    pub fn fire(&self) {
        let value: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN just means the counter is already saturated/pending; the
        // object is already readable, which is all `fire` promises.
        let _ = ret;
    }

    pub fn clear(&self) {
        let mut value: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

#[cfg(target_os = "linux")]
impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(target_os = "linux")]
impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// kqueue-based `EVFILT_USER` event for BSD/macOS hosts.
#[cfg(not(target_os = "linux"))]
pub struct Event {
    kq: RawFd,
    ident: usize,
}

#[cfg(not(target_os = "linux"))]
impl Event {
    pub fn new() -> Result<Event> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::Event(io::Error::last_os_error()));
        }
        let ident = 1usize;
        let changes = [libc::kevent {
            ident,
            filter: libc::EVFILT_USER,
            flags: libc::EV_ADD | libc::EV_CLEAR,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        }];
        let ret = unsafe {
            libc::kevent(
                kq,
                changes.as_ptr(),
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(Error::Event(err));
        }
        Ok(Event { kq, ident })
    }

    pub fn fire(&self) {
        let changes = [libc::kevent {
            ident: self.ident,
            filter: libc::EVFILT_USER,
            flags: 0,
            fflags: libc::NOTE_TRIGGER,
            data: 0,
            udata: std::ptr::null_mut(),
        }];
        unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            );
        }
    }

    pub fn clear(&self) {
        // EV_CLEAR on the registration already resets the user flag on each
        // delivered kevent; nothing further to drain here.
    }
}

#[cfg(not(target_os = "linux"))]
impl AsRawFd for Event {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

#[cfg(not(target_os = "linux"))]
impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

/// A readiness entry reported by a single [`Gate::poll`] round.
#[derive(Debug, Clone, Copy)]
pub struct Fired {
    pub token: usize,
    pub readiness: Readiness,
}

/// Thin wrapper over `mio::Poll` presenting exactly the operation the spec
/// needs: register raw descriptors under small integer tokens, block until at
/// least one fires, report which.
pub struct Gate {
    poll: Poll,
    events: Events,
}

impl Gate {
    pub fn new(capacity: usize) -> Result<Gate> {
        let poll = Poll::new().map_err(Error::Gate)?;
        Ok(Gate {
            poll,
            events: Events::with_capacity(capacity.max(16)),
        })
    }

    pub fn register(&self, fd: RawFd, token: usize, interest: Interest) -> Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), interest.to_mio())
            .map_err(Error::Gate)
    }

    pub fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token), interest.to_mio())
            .map_err(Error::Gate)
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        match self.poll.registry().deregister(&mut SourceFd(&fd)) {
            Ok(()) => Ok(()),
            // Already gone (e.g. the fd was closed by its owner) -- not an
            // error the caller can act on.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Gate(e)),
        }
    }

    /// Blocks indefinitely until at least one registered descriptor fires,
    /// then returns the set of fired (token, readiness) pairs.
    pub fn poll(&mut self) -> Result<Vec<Fired>> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Gate(e)),
            }
        }

        let mut fired = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            let mut readiness = Readiness::empty();
            if event.is_readable() {
                readiness |= Readiness::READABLE;
            }
            if event.is_writable() {
                readiness |= Readiness::WRITABLE;
            }
            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                readiness |= Readiness::ERROR;
            }
            fired.push(Fired {
                token: event.token().0,
                readiness,
            });
        }
        Ok(fired)
    }

    /// Used by [`Gate::poll`]'s caller to size the next round's readiness
    /// array without forcing a reallocation for the common case.
    pub fn set_capacity_hint(&mut self, capacity: usize) {
        if self.events.capacity() < capacity {
            self.events = Events::with_capacity(capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_fires_and_clears() {
        let ev = Event::new().expect("event");
        ev.fire();
        ev.clear();
    }

    #[test]
    fn gate_observes_a_fired_event() {
        let mut gate = Gate::new(4).expect("gate");
        let ev = Event::new().expect("event");
        gate.register(ev.as_raw_fd(), 7, Interest::READABLE)
            .expect("register");
        ev.fire();
        let fired = gate.poll().expect("poll");
        assert!(fired.iter().any(|f| f.token == 7));
        ev.clear();
    }
}
