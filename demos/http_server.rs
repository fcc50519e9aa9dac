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

//! Single-threaded HTTP/1.1 GET server: one coroutine per connection,
//! multiplexed on a `corofd::Machine`. Demonstrates the runtime's external
//! interface; not part of the core library.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

use clap::Parser;
use corofd::{CoroutineHandle, Interest, Machine, Readiness};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "Single-threaded HTTP/1.1 GET server")]
struct Args {
    /// Port to listen on. The protocol the demo was specified against binds
    /// TCP port 80 on INADDR_ANY; this override exists only because port 80
    /// requires privileges this demo should not need to run.
    #[arg(short, long, default_value_t = 80)]
    port: u16,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let listener = TcpListener::bind(("0.0.0.0", args.port)).expect("bind");
    listener.set_nonblocking(true).expect("set_nonblocking");
    info!("listening on 0.0.0.0:{}", args.port);

    let machine = Machine::new().expect("machine");
    let acceptor_machine = machine.clone();
    machine
        .spawn(move |me| accept_loop(me, &acceptor_machine, listener))
        .expect("spawn acceptor")
        .start();

    machine.run();
}

fn accept_loop(me: CoroutineHandle, machine: &Machine, listener: TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("accepted connection from {}", peer);
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("set_nonblocking failed for {}: {}", peer, e);
                    continue;
                }
                machine
                    .spawn(move |me| {
                        if let Err(e) = serve_connection(&me, stream) {
                            warn!("connection error: {}", e);
                        }
                    })
                    .expect("spawn connection")
                    .start();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let readiness = me.wait(listener.as_raw_fd(), Interest::READABLE);
                if readiness.contains(Readiness::ERROR) {
                    warn!("listener descriptor reported an error, stopping acceptor");
                    return;
                }
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                return;
            }
        }
    }
}

struct Request {
    method: String,
    path: String,
    protocol: String,
    #[allow(dead_code)]
    headers: BTreeMap<String, String>,
}

fn serve_connection(me: &CoroutineHandle, mut stream: TcpStream) -> io::Result<()> {
    let request = match read_request(me, &mut stream)? {
        Some(r) => r,
        None => return Ok(()), // peer closed before sending a full request
    };

    if request.method != "GET" {
        let body = format!("{} 400 Invalid request method\r\n\r\n", request.protocol);
        return write_all_nonblocking(me, &mut stream, body.as_bytes());
    }

    match response_header(&request.protocol, &request.path) {
        Ok((header, mut file)) => {
            write_all_nonblocking(me, &mut stream, header.as_bytes())?;
            let mut buf = [0u8; 8192];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                write_all_nonblocking(me, &mut stream, &buf[..n])?;
            }
            Ok(())
        }
        Err(header) => write_all_nonblocking(me, &mut stream, header.as_bytes()),
    }
}

/// Builds the response status line and headers for a `GET` of `path`. On
/// success, returns the header text and the already-opened file to stream as
/// the body; on a missing/unreadable path, returns the 404 header text as
/// `Err` so the caller can write it without a body.
fn response_header(protocol: &str, path: &str) -> Result<(String, File), String> {
    match File::open(path).and_then(|f| f.metadata().map(|m| (f, m))) {
        Ok((file, meta)) => Ok((
            format!(
                "{} 200 OK\r\nContent-type: text/html\r\nContent-length: {}\r\n\r\n",
                protocol,
                meta.len()
            ),
            file,
        )),
        Err(_) => Err(format!("{} 404 Not Found\r\n\r\n", protocol)),
    }
}

/// Reads and parses the request line and headers, blocking (cooperatively)
/// on the connection's readability until the terminating blank line arrives.
/// Returns `Ok(None)` if the peer closed the connection before sending one.
fn read_request(me: &CoroutineHandle, stream: &mut TcpStream) -> io::Result<Option<Request>> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        if let Some(pos) = find_header_end(&raw) {
            let head = String::from_utf8_lossy(&raw[..pos]).into_owned();
            return Ok(Some(parse_request(&head)));
        }

        let n = read_nonblocking(me, stream, &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        raw.extend_from_slice(&buf[..n]);
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request(head: &str) -> Request {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or("/").to_string();
    let protocol = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_uppercase(), value.trim().to_string());
        }
    }

    Request {
        method,
        path,
        protocol,
        headers,
    }
}

fn read_nonblocking(me: &CoroutineHandle, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match stream.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let readiness = me.wait(stream.as_raw_fd(), Interest::READABLE);
                if readiness.contains(Readiness::ERROR) {
                    return Err(io::Error::new(io::ErrorKind::Other, "connection error"));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn write_all_nonblocking(me: &CoroutineHandle, stream: &mut TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write zero")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let readiness = me.wait(stream.as_raw_fd(), Interest::WRITABLE);
                if readiness.contains(Readiness::ERROR) {
                    return Err(io::Error::new(io::ErrorKind::Other, "connection error"));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_get_request_line() {
        let req = parse_request("GET /tmp/x.html HTTP/1.1\r\nHost: local\r\n");
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/tmp/x.html");
        assert_eq!(req.protocol, "HTTP/1.1");
        assert_eq!(req.headers.get("HOST"), Some(&"local".to_string()));
    }

    #[test]
    fn finds_header_end_across_reads() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\n"), Some(14));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn rejects_non_get_methods() {
        let req = parse_request("POST / HTTP/1.1\r\n");
        assert_eq!(req.method, "POST");
    }

    #[test]
    fn responds_200_with_content_length_for_an_existing_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"<h1>hi</h1>").expect("write fixture");
        let path = file.path().to_str().unwrap().to_string();

        let (header, mut body) = response_header("HTTP/1.1", &path).expect("200");
        assert_eq!(
            header,
            "HTTP/1.1 200 OK\r\nContent-type: text/html\r\nContent-length: 11\r\n\r\n"
        );
        let mut read_back = Vec::new();
        body.read_to_end(&mut read_back).expect("read fixture back");
        assert_eq!(read_back, b"<h1>hi</h1>");
    }

    #[test]
    fn responds_404_for_a_missing_file() {
        let header = response_header("HTTP/1.1", "/no/such/path-corofd-test")
            .expect_err("missing path is a 404");
        assert_eq!(header, "HTTP/1.1 404 Not Found\r\n\r\n");
    }
}
