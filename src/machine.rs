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

//! The scheduler: owns membership, the readiness gate, the interrupt event
//! and the tick counter, and drives the main loop.

use std::cell::UnsafeCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::coroutine::{CoroutineHandle, State, SuspendReason, DEFAULT_STACK_SIZE};
use crate::error::Result;
use crate::gate::{Event, Gate, Interest, Readiness};
use crate::id::IdAllocator;

const INTERRUPT_TOKEN: usize = 0;

/// The few knobs the spec names as defaults, gathered into a builder so a
/// `Machine` can be constructed with non-default values without a sprawling
/// constructor argument list.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub stack_size: usize,
    pub gate_capacity: usize,
    pub name: Option<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            stack_size: DEFAULT_STACK_SIZE,
            gate_capacity: 16,
            name: None,
        }
    }
}

impl MachineConfig {
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn gate_capacity(mut self, capacity: usize) -> Self {
        self.gate_capacity = capacity;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

pub(crate) struct MachineInner {
    pub members: Vec<CoroutineHandle>,
    pub id_alloc: IdAllocator,
    pub gate: Gate,
    pub interrupt_event: Event,
    pub running: bool,
    pub tick: u64,
    pub config: MachineConfig,
    pub current: Option<CoroutineHandle>,
    /// Raw fds registered with the gate on the previous round, so the next
    /// round can cleanly deregister before rebuilding the readiness array.
    previous_fds: Vec<RawFd>,
}

/// The coroutine machine. Cheap to clone (an `Rc` handle); every clone
/// refers to the same scheduler.
#[derive(Clone)]
pub struct Machine(pub(crate) Rc<UnsafeCell<MachineInner>>);

impl Machine {
    pub fn new() -> Result<Machine> {
        Machine::with_config(MachineConfig::default())
    }

    pub fn with_config(config: MachineConfig) -> Result<Machine> {
        let gate = Gate::new(config.gate_capacity)?;
        let interrupt_event = Event::new()?;
        gate.register(interrupt_event.as_raw_fd(), INTERRUPT_TOKEN, Interest::READABLE)?;

        let inner = MachineInner {
            members: Vec::new(),
            id_alloc: IdAllocator::new(),
            gate,
            interrupt_event,
            running: true,
            tick: 0,
            config,
            current: None,
            previous_fds: Vec::new(),
        };

        Ok(Machine(Rc::new(UnsafeCell::new(inner))))
    }

    fn inner(&self) -> &MachineInner {
        unsafe { &*self.0.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn inner_mut(&self) -> &mut MachineInner {
        unsafe { &mut *self.0.get() }
    }

    /// Starts building a coroutine pinned to this machine with non-default
    /// name/stack size.
    pub fn coroutine(&self) -> CoroutineBuilder<'_> {
        CoroutineBuilder {
            machine: self,
            name: None,
            stack_size: self.inner().config.stack_size,
        }
    }

    /// Spawns a coroutine with every default, in state `New`.
    pub fn spawn<F>(&self, body: F) -> Result<CoroutineHandle>
    where
        F: FnOnce(CoroutineHandle) + 'static,
    {
        self.coroutine().spawn(body)
    }

    pub(crate) fn add_coroutine(&self, handle: CoroutineHandle) -> CoroutineHandle {
        let id = self.inner_mut().id_alloc.allocate();
        handle.inner_mut().id = id;
        if handle.inner().name.is_empty() {
            handle.inner_mut().name = format!("co-{id}");
        }
        trace!("coroutine {} ({}) registered with machine", id, handle.name());
        self.inner_mut().members.push(handle.clone());
        handle
    }

    fn remove_coroutine(&self, handle: &CoroutineHandle) {
        let inner = self.inner_mut();
        inner.id_alloc.release(handle.id());
        inner.members.retain(|m| !m.ptr_eq(handle));
        trace!("coroutine {} removed from machine", handle.id());
    }

    pub fn tick(&self) -> u64 {
        self.inner().tick
    }

    pub fn len(&self) -> usize {
        self.inner().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().members.is_empty()
    }

    /// Requests the main loop stop after the current poll round returns.
    /// Safe to call from within a running coroutine; the loop only observes
    /// `running == false` once that coroutine reaches a suspension point.
    pub fn stop(&self) {
        debug!("machine stop requested");
        let inner = self.inner_mut();
        inner.running = false;
        inner.interrupt_event.fire();
    }

    /// Tears down membership, the ID set and the interrupt event. Any
    /// coroutine still alive at this point is simply dropped along with its
    /// stack; nothing it was waiting on is notified.
    pub fn destruct(&self) {
        let inner = self.inner_mut();
        inner.running = false;
        inner.members.clear();
    }

    /// A textual listing of coroutines (id, name, state, last-suspended
    /// tick) for diagnostics.
    pub fn show(&self) -> String {
        let inner = self.inner();
        let mut out = String::new();
        for m in &inner.members {
            out.push_str(&format!(
                "[{:>3}] {:<16} {:?} (last tick {})\n",
                m.id(),
                m.name(),
                m.state(),
                m.inner().last_tick
            ));
        }
        out
    }

    /// Runs the main loop: repeats while `running` and membership is
    /// nonempty.
    pub fn run(&self) {
        loop {
            {
                let inner = self.inner();
                if !inner.running || inner.members.is_empty() {
                    break;
                }
            }

            match self.select_runnable() {
                Some(chosen) => self.resume_chosen(chosen),
                None => {
                    if !self.inner().running {
                        break;
                    }
                }
            }
        }
    }

    /// One round of select-runnable: build the readiness array, pre-fire
    /// `Ready` coroutines, poll, and fairly pick one runnable coroutine (or
    /// none).
    fn select_runnable(&self) -> Option<CoroutineHandle> {
        let inner = self.inner_mut();

        for fd in inner.previous_fds.drain(..) {
            let _ = inner.gate.deregister(fd);
        }

        let mut blocked: Vec<CoroutineHandle> = Vec::new();
        for member in inner.members.iter() {
            match member.state() {
                State::Waiting => {
                    let fd = member.inner().wait_fd;
                    let interest = member.inner().wait_interest;
                    let token = blocked.len() + 1;
                    if let Err(e) = inner.gate.register(fd, token, interest) {
                        warn!("failed to register waiting coroutine {}: {}", member.id(), e);
                        continue;
                    }
                    inner.previous_fds.push(fd);
                    blocked.push(member.clone());
                }
                State::Ready => {
                    member.fire_event();
                    let fd = member.event_fd();
                    let token = blocked.len() + 1;
                    if let Err(e) = inner.gate.register(fd, token, Interest::READABLE) {
                        warn!("failed to register ready coroutine {}: {}", member.id(), e);
                        continue;
                    }
                    inner.previous_fds.push(fd);
                    blocked.push(member.clone());
                }
                State::Yielded => {
                    let fd = member.event_fd();
                    let token = blocked.len() + 1;
                    if let Err(e) = inner.gate.register(fd, token, Interest::READABLE) {
                        warn!("failed to register yielded coroutine {}: {}", member.id(), e);
                        continue;
                    }
                    inner.previous_fds.push(fd);
                    blocked.push(member.clone());
                }
                State::New | State::Running | State::Dead => {}
            }
        }

        inner.gate.set_capacity_hint(blocked.len() + 1);

        let fired = match inner.gate.poll() {
            Ok(f) => f,
            Err(e) => {
                warn!("readiness gate poll failed: {}", e);
                return None;
            }
        };
        inner.tick += 1;
        let tick = inner.tick;

        let mut interrupted = false;
        let mut runnable: Vec<(usize, Readiness)> = Vec::new();
        for f in fired {
            if f.token == INTERRUPT_TOKEN {
                interrupted = true;
            } else {
                runnable.push((f.token - 1, f.readiness));
            }
        }

        if interrupted {
            inner.interrupt_event.clear();
            if !inner.running {
                return None;
            }
        }

        if runnable.is_empty() {
            return None;
        }

        // Fair pick: greatest (tick - last_tick), ties broken by membership
        // order. `runnable` is built in ascending blocked-index order above
        // (which mirrors membership order), so a strict `>` comparison below
        // keeps the first (earliest-inserted) winner on ties.
        runnable.sort_by_key(|(idx, _)| *idx);
        let mut best: Option<(usize, Readiness, u64)> = None;
        for (idx, readiness) in runnable {
            let waited = tick.saturating_sub(blocked[idx].inner().last_tick);
            let replace = match &best {
                None => true,
                Some((_, _, best_waited)) => waited > *best_waited,
            };
            if replace {
                best = Some((idx, readiness, waited));
            }
        }

        let (chosen_idx, chosen_readiness, _) = best.expect("runnable set nonempty");
        let chosen = blocked[chosen_idx].clone();
        chosen.inner_mut().last_readiness = chosen_readiness;

        // Only the Ready/Yielded path used the coroutine's own event; a
        // Waiting coroutine's readiness came from its user-owned wait_fd,
        // which is not ours to clear.
        if chosen.state() != State::Waiting {
            chosen.clear_event();
        }

        debug!(
            "select-runnable: chose coroutine {} ({}) at tick {}",
            chosen.id(),
            chosen.name(),
            tick
        );

        Some(chosen)
    }

    fn resume_chosen(&self, chosen: CoroutineHandle) {
        chosen.inner_mut().state = State::Running;
        self.inner_mut().current = Some(chosen.clone());

        let payload = chosen.inner_mut().entry_payload.take().unwrap_or(0);
        let entry_ctx = chosen
            .inner_mut()
            .resume_point
            .take()
            .expect("scheduled coroutine has no resume point");

        let transfer = entry_ctx.resume(payload);
        chosen.inner_mut().resume_point = Some(transfer.context);

        let reason = chosen.inner().pending_reason;
        let tick = self.inner().tick;
        match reason {
            SuspendReason::Yielded => {
                chosen.inner_mut().state = State::Yielded;
                chosen.inner_mut().last_tick = tick;
            }
            SuspendReason::Waiting { fd, interest } => {
                chosen.inner_mut().state = State::Waiting;
                chosen.inner_mut().wait_fd = fd;
                chosen.inner_mut().wait_interest = interest;
                chosen.inner_mut().last_tick = tick;
            }
            SuspendReason::Dead => {
                chosen.inner_mut().state = State::Dead;
                trace!("coroutine {} ({}) is dead", chosen.id(), chosen.name());
                self.remove_coroutine(&chosen);
            }
        }

        self.inner_mut().current = None;
    }
}

/// Builder for spawning a coroutine with non-default name/stack size.
pub struct CoroutineBuilder<'m> {
    machine: &'m Machine,
    name: Option<String>,
    stack_size: usize,
}

impl<'m> CoroutineBuilder<'m> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn spawn<F>(self, body: F) -> Result<CoroutineHandle>
    where
        F: FnOnce(CoroutineHandle) + 'static,
    {
        let handle = CoroutineHandle::spawn(
            self.machine,
            self.name.unwrap_or_default(),
            self.stack_size,
            Box::new(body),
        )?;
        Ok(self.machine.add_coroutine(handle))
    }
}
