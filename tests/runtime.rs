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

//! End-to-end scenarios exercising the runtime's external interface.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use corofd::{Interest, Machine, State};
use pretty_assertions::assert_eq;
use serial_test::serial;

/// Opens a pipe with `O_NONBLOCK` on both ends, as the pipe-pair scenario
/// needs: `wait` only makes sense for descriptors that can report
/// `WouldBlock` instead of actually blocking the OS thread.
fn nonblocking_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "pipe() failed");
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    }
    (fds[0], fds[1])
}

fn fd_write(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn fd_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn fd_close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[test]
#[serial]
fn single_yield_a_hundred_times_then_dies() {
    let machine = Machine::new().expect("machine");
    let ticks = Rc::new(RefCell::new(0));
    let ticks_in = ticks.clone();

    let co = machine
        .spawn(move |me| {
            for _ in 0..100 {
                *ticks_in.borrow_mut() += 1;
                me.yield_now();
            }
        })
        .expect("spawn");
    assert_eq!(co.state(), State::New);
    co.start();

    machine.run();

    assert_eq!(*ticks.borrow(), 100);
    assert_eq!(co.state(), State::Dead);
    assert_eq!(machine.len(), 0);
}

#[test]
#[serial]
fn generator_caller_rendezvous() {
    let machine = Machine::new().expect("machine");

    let producer = machine
        .spawn(|me| {
            for v in 1..=4 {
                me.yield_value(v);
            }
        })
        .expect("spawn producer");

    let collected = Rc::new(RefCell::new(Vec::new()));
    let collected_in = collected.clone();
    let calls = Rc::new(RefCell::new(0));
    let calls_in = calls.clone();
    machine
        .spawn(move |me| {
            while me.is_alive(&producer) {
                *calls_in.borrow_mut() += 1;
                if let Some(v) = me.call::<i32>(&producer) {
                    collected_in.borrow_mut().push(v);
                }
            }
        })
        .expect("spawn consumer")
        .start();

    machine.run();

    assert_eq!(*collected.borrow(), vec![1, 2, 3, 4]);
    assert_eq!(*calls.borrow(), 5, "producer only dies on the 5th call");
}

#[test]
#[serial]
fn pipe_pair_streams_twenty_lines_then_eof() {
    let (fd_r, fd_w) = nonblocking_pipe();
    let machine = Machine::new().expect("machine");

    machine
        .spawn(move |me| {
            for i in 0..20 {
                let line = format!("FOO {}\n", i);
                let mut sent = 0;
                while sent < line.len() {
                    loop {
                        match fd_write(fd_w, line.as_bytes()[sent..].as_ref()) {
                            Ok(n) if n > 0 => {
                                sent += n;
                                break;
                            }
                            Ok(_) => {
                                me.wait(fd_w, Interest::WRITABLE);
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                me.wait(fd_w, Interest::WRITABLE);
                            }
                            Err(e) => panic!("write failed: {}", e),
                        }
                    }
                }
                me.yield_now();
            }
            fd_close(fd_w);
        })
        .expect("spawn writer")
        .start();

    let output = Rc::new(RefCell::new(String::new()));
    let output_in = output.clone();
    machine
        .spawn(move |me| loop {
            // A closed write end reports as `ERROR` here just as often as it
            // reports `READABLE`; either way the next `read` sees EOF.
            let _ = me.wait(fd_r, Interest::READABLE);
            let mut buf = [0u8; 256];
            match fd_read(fd_r, &mut buf) {
                Ok(0) => {
                    output_in.borrow_mut().push_str("EOF\n");
                    fd_close(fd_r);
                    return;
                }
                Ok(n) => {
                    output_in
                        .borrow_mut()
                        .push_str(&String::from_utf8_lossy(&buf[..n]));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read failed: {}", e),
            }
        })
        .expect("spawn reader")
        .start();

    machine.run();

    let expected: String = (0..20).map(|i| format!("FOO {}\n", i)).collect::<Vec<_>>().join("") + "EOF\n";
    assert_eq!(*output.borrow(), expected);
}

#[test]
#[serial]
fn stop_interrupts_a_blocked_machine() {
    let (fd_r, _fd_w) = nonblocking_pipe();
    let machine = Machine::new().expect("machine");
    let stopper = machine.clone();

    let reached_wait = Rc::new(RefCell::new(false));
    let reached_wait_in = reached_wait.clone();

    machine
        .spawn(move |me| {
            *reached_wait_in.borrow_mut() = true;
            // Nothing will ever write to fd_r; only `stop` can unblock this.
            me.wait(fd_r, Interest::READABLE);
        })
        .expect("spawn waiter")
        .start();

    machine
        .spawn(move |me| {
            me.yield_now(); // let the waiter register first
            stopper.stop();
        })
        .expect("spawn stopper")
        .start();

    machine.run();

    assert!(*reached_wait.borrow());
}
