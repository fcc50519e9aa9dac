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

//! The coroutine object and the generator/caller rendezvous protocol built
//! on top of it.

use std::any::Any;
use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::ptr;
use std::rc::{Rc, Weak};

use log::trace;

use crate::ctx::{self, Stack, Transfer};
use crate::error::Result;
use crate::gate::{Event, Interest, Readiness};
use crate::machine::{Machine, MachineInner};

/// Default stack size for a coroutine that doesn't ask for a specific one.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;

/// Lifecycle states a coroutine moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Ready,
    Running,
    Yielded,
    Waiting,
    Dead,
}

/// Why a coroutine handed control back to the scheduler. Set by the
/// coroutine's own suspension methods just before the context switch;
/// consumed by [`Machine::run`] right after the switch returns.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SuspendReason {
    Yielded,
    Waiting { fd: RawFd, interest: Interest },
    Dead,
}

pub(crate) struct CoroutineInner {
    pub id: usize,
    pub name: String,
    pub state: State,
    pub stack: Option<Stack>,
    /// Where the scheduler resumes this coroutine from. `None` exactly when
    /// the coroutine is `Running` or `Dead`.
    pub resume_point: Option<ctx::Context>,
    /// Where this coroutine, mid-suspend-call, jumps back to reach the
    /// scheduler. `None` except while the coroutine is actually executing.
    pub return_point: Option<ctx::Context>,
    /// Raw pointer to the boxed `EntryPackage`, consumed by the very first
    /// resume. `None` after the coroutine has started at least once.
    pub entry_payload: Option<usize>,
    pub pending_reason: SuspendReason,
    pub wait_fd: RawFd,
    pub wait_interest: Interest,
    pub last_readiness: Readiness,
    pub event: Event,
    pub caller: Option<Weak<UnsafeCell<CoroutineInner>>>,
    pub result_ptr: *mut u8,
    pub result_size: usize,
    pub user_data: Option<Box<dyn Any>>,
    /// The machine tick at which this coroutine last suspended. Drives fair
    /// selection (`tick - last_tick`) and doubles as the diagnostic stand-in
    /// for a captured instruction address: this implementation has no
    /// portable way to read the suspended stack's program counter through
    /// the `context` crate, so `Machine::show` reports the tick instead.
    pub last_tick: u64,
    pub machine: Weak<UnsafeCell<MachineInner>>,
}

/// A cheap, clonable reference to a coroutine. All of the runtime's public
/// coroutine API hangs off this handle; see the module docs for why the
/// fields it wraps are behind an `UnsafeCell` rather than borrow-checked.
///
/// This is a single-threaded, `!Send`/`!Sync` runtime: only one coroutine
/// ever executes at a time and the scheduler that hands control between them
/// runs on the same OS thread, so the `UnsafeCell` aliasing here is no more
/// dangerous than a `RefCell` would be -- it is simply cheaper, and it lets
/// raw pointers cross the FFI-shaped context-switch boundary without
/// fighting the borrow checker over a switch that, from its point of view,
/// never returns.
#[derive(Clone)]
pub struct CoroutineHandle(pub(crate) Rc<UnsafeCell<CoroutineInner>>);

struct EntryPackage {
    handle: CoroutineHandle,
    body: Box<dyn FnOnce(CoroutineHandle)>,
}

impl CoroutineHandle {
    pub(crate) fn inner(&self) -> &CoroutineInner {
        unsafe { &*self.0.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn inner_mut(&self) -> &mut CoroutineInner {
        unsafe { &mut *self.0.get() }
    }

    pub(crate) fn ptr_eq(&self, other: &CoroutineHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn machine(&self) -> Rc<UnsafeCell<MachineInner>> {
        self.inner()
            .machine
            .upgrade()
            .expect("coroutine outlived its machine")
    }

    /// Builds a new coroutine pinned to `machine`, in state `New`.
    pub(crate) fn spawn(
        machine: &Machine,
        name: String,
        stack_size: usize,
        body: Box<dyn FnOnce(CoroutineHandle)>,
    ) -> Result<CoroutineHandle> {
        let stack = Stack::allocate(stack_size)?;
        let event = Event::new()?;
        let entry_ctx = ctx::new_entry_context(&stack, trampoline);

        let inner = CoroutineInner {
            id: 0, // assigned by Machine::add_coroutine
            name,
            state: State::New,
            stack: Some(stack),
            resume_point: Some(entry_ctx),
            return_point: None,
            entry_payload: None,
            pending_reason: SuspendReason::Yielded,
            wait_fd: -1,
            wait_interest: Interest::empty(),
            last_readiness: Readiness::empty(),
            event,
            caller: None,
            result_ptr: ptr::null_mut(),
            result_size: 0,
            user_data: None,
            last_tick: 0,
            machine: Rc::downgrade(&machine.0),
        };

        let handle = CoroutineHandle(Rc::new(UnsafeCell::new(inner)));

        let package = Box::new(EntryPackage {
            handle: handle.clone(),
            body,
        });
        handle.inner_mut().entry_payload = Some(Box::into_raw(package) as usize);

        Ok(handle)
    }

    pub fn id(&self) -> usize {
        self.inner().id
    }

    pub fn name(&self) -> String {
        self.inner().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.inner_mut().name = name.into();
    }

    pub fn state(&self) -> State {
        self.inner().state
    }

    pub fn set_user_data<T: 'static>(&self, data: T) {
        self.inner_mut().user_data = Some(Box::new(data));
    }

    pub fn user_data<T: 'static>(&self) -> Option<&T> {
        self.inner().user_data.as_ref().and_then(|b| b.downcast_ref::<T>())
    }

    /// `New -> Ready`. A no-op in any other state.
    pub fn start(&self) {
        if self.inner().state == State::New {
            trace!("coroutine {} ({}): New -> Ready", self.id(), self.name());
            self.inner_mut().state = State::Ready;
        }
    }

    /// True iff `target` is still live in `self`'s machine. Takes the
    /// querying coroutine rather than being a free function because only the
    /// machine -- reached here through `self` -- can answer this
    /// authoritatively.
    pub fn is_alive(&self, target: &CoroutineHandle) -> bool {
        let machine = self.machine();
        let inner = unsafe { &*machine.get() };
        inner.id_alloc.is_live(target.id())
    }

    /// Suspends `self`, firing its own event first so the scheduler treats
    /// it as immediately runnable next round.
    pub fn yield_now(&self) {
        self.inner().event.fire();
        self.inner_mut().pending_reason = SuspendReason::Yielded;
        self.suspend();
    }

    /// Suspends `self` until `fd` becomes ready for `interest`. Returns the
    /// readiness the scheduler observed (which may include `ERROR`, folding
    /// in both `POLLERR` and `POLLHUP` -- the caller must recheck the
    /// descriptor to tell them apart).
    pub fn wait(&self, fd: RawFd, interest: Interest) -> Readiness {
        {
            let inner = self.inner_mut();
            inner.wait_fd = fd;
            inner.wait_interest = interest;
            inner.pending_reason = SuspendReason::Waiting { fd, interest };
        }
        self.suspend();
        let inner = self.inner_mut();
        inner.wait_fd = -1;
        inner.last_readiness
    }

    /// Unwinds the coroutine immediately; never returns to the caller.
    pub fn exit(&self) -> ! {
        self.inner_mut().pending_reason = SuspendReason::Dead;
        self.suspend();
        unreachable!("a dead coroutine was resumed");
    }

    /// Raw byte-copy half of the generator protocol: push `value` into the
    /// calling coroutine's result slot, wake it, then park without firing our
    /// own event.
    ///
    /// # Safety
    /// `value` must point to at least `size` readable bytes, valid for the
    /// duration of this call.
    pub unsafe fn yield_value_raw(&self, value: *const u8, size: usize) {
        if let Some(caller) = self.inner().caller.as_ref().and_then(Weak::upgrade) {
            let caller_inner = unsafe { &mut *caller.get() };
            if !caller_inner.result_ptr.is_null() && caller_inner.result_size > 0 {
                let n = caller_inner.result_size.min(size);
                unsafe { ptr::copy_nonoverlapping(value, caller_inner.result_ptr, n) };
            }
            caller_inner.event.fire();
        }
        self.inner_mut().pending_reason = SuspendReason::Yielded;
        self.suspend();
    }

    /// Typed convenience wrapper over [`Self::yield_value_raw`].
    pub fn yield_value<T>(&self, value: T) {
        unsafe { self.yield_value_raw(&value as *const T as *const u8, std::mem::size_of::<T>()) };
    }

    /// Raw byte-copy half of the generator protocol: mark `callee` as ours to
    /// resume, start or wake it, then park without firing our own event
    /// until it answers.
    ///
    /// # Safety
    /// `result_ptr` must point to at least `result_size` writable bytes,
    /// valid until this call returns.
    pub unsafe fn call_raw(&self, callee: &CoroutineHandle, result_ptr: *mut u8, result_size: usize) {
        {
            let callee_inner = callee.inner_mut();
            callee_inner.caller = Some(Rc::downgrade(&self.0));
            callee_inner.result_ptr = result_ptr;
            callee_inner.result_size = result_size;
        }

        if callee.state() == State::New {
            callee.start();
        } else {
            callee.inner().event.fire();
        }

        self.inner_mut().pending_reason = SuspendReason::Yielded;
        self.suspend();

        let callee_inner = callee.inner_mut();
        callee_inner.caller = None;
        callee_inner.result_ptr = ptr::null_mut();
        callee_inner.result_size = 0;
    }

    /// Typed convenience wrapper over [`Self::call_raw`]. Returns `Some(v)`
    /// if `callee` produced a value via `yield_value` before `self` was
    /// resumed, `None` if `callee` has died instead.
    pub fn call<T: Default>(&self, callee: &CoroutineHandle) -> Option<T> {
        let mut slot = T::default();
        unsafe {
            self.call_raw(
                callee,
                &mut slot as *mut T as *mut u8,
                std::mem::size_of::<T>(),
            );
        }
        if self.is_alive(callee) {
            Some(slot)
        } else {
            None
        }
    }

    /// Pure-rendezvous form of `call`: no value is copied, only a wakeup.
    pub fn call_rendezvous(&self, callee: &CoroutineHandle) {
        unsafe { self.call_raw(callee, ptr::null_mut(), 0) };
    }

    pub(crate) fn event_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.inner().event.as_raw_fd()
    }

    pub(crate) fn fire_event(&self) {
        self.inner().event.fire();
    }

    pub(crate) fn clear_event(&self) {
        self.inner().event.clear();
    }

    /// The raw stack-switch: hands control back to whatever resumed `self`,
    /// and returns once `self` is resumed again.
    fn suspend(&self) {
        let ret_ctx = self
            .inner_mut()
            .return_point
            .take()
            .expect("suspend called while not running");
        let transfer: Transfer = ret_ctx.resume(0);
        self.inner_mut().return_point = Some(transfer.context);
    }
}

/// The first (and only) function ever called directly by a context switch.
/// Everything after the user body returns is epilogue: mark `Dead`, drop our
/// own strong reference to the coroutine record (so the machine's copy is
/// the last one once it removes this coroutine from membership), then jump
/// back to the scheduler one final time. The scheduler must never resume a
/// `Dead` coroutine, so control never returns here.
extern "C" fn trampoline(t: Transfer) -> ! {
    let package = unsafe { Box::from_raw(t.data as *mut EntryPackage) };
    let EntryPackage { handle, body } = *package;

    handle.inner_mut().return_point = Some(t.context);

    let body_handle = handle.clone();
    body(body_handle);

    let inner_ptr = handle.0.get();
    drop(handle);

    let inner = unsafe { &mut *inner_ptr };
    inner.pending_reason = SuspendReason::Dead;
    let ret_ctx = inner
        .return_point
        .take()
        .expect("coroutine body returned without a return point");
    let _ = ret_ctx.resume(0);
    unreachable!("the scheduler resumed a dead coroutine");
}

impl std::fmt::Debug for CoroutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
