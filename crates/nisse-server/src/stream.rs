//! # Stream adapter
//!
//! `Stream` is the byte-channel interface the HTTP engine is written
//! against: line-oriented reads, an exact-skip, buffered writes with an
//! explicit flush, and a data-availability predicate. `SocketStream`
//! implements it over a non-blocking TCP socket, optionally wrapped in TLS.
//!
//! The interesting part is the would-block contract. Every underlying read
//! or write that reports `WouldBlock` invokes the registered yield hook for
//! that direction; the hook is expected to suspend the enclosing coroutine
//! and, once resumed, return `true` meaning "retry the same call". The
//! stream loops until success, EOF or a hard error, so the engine above it
//! never sees `WouldBlock` at all.
//!
//! A connection reset is not an error here: the peer vanished, the stream
//! flips to closed-no-more-data, and the request loop winds down normally.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use crate::tls::TlsContext;

/// Hook invoked when an I/O call would block. Returns `true` to retry the
/// call after the coroutine is resumed.
pub type WouldBlockHook = Box<dyn FnMut() -> bool + Send>;

/// Byte-channel interface consumed by the HTTP engine.
pub trait Stream {
    /// Next `\r\n`-terminated chunk, terminator included, or whatever
    /// remains at EOF (possibly empty).
    fn next_line(&mut self) -> io::Result<Vec<u8>>;

    /// Discard exactly `n` bytes, reading as required. Stops early at EOF.
    fn ignore(&mut self, n: usize) -> io::Result<()>;

    /// Append bytes to the output buffer. Nothing hits the wire until
    /// [`sync`](Self::sync). Quietly drops data once the stream is closed.
    fn send_message(&mut self, message: &[u8]);

    /// Flush buffered output to the peer.
    fn sync(&mut self) -> io::Result<()>;

    /// Whether more request data may still arrive. Optimistic: only a seen
    /// EOF, a reset or [`close`](Self::close) turn this false.
    fn has_data(&self) -> bool;

    /// Shut the connection down. Buffered input is dropped.
    fn close(&mut self);
}

/// Transport under a `SocketStream`: plain TCP or a TLS session. Both run
/// the socket in non-blocking mode and surface `WouldBlock`.
enum Transport {
    Tcp(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
}

impl Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(sock) => sock.read(buf),
            Transport::Tls(tls) => tls.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(sock) => sock.write(buf),
            Transport::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(sock) => sock.flush(),
            Transport::Tls(tls) => tls.flush(),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(sock) => sock.shutdown(Shutdown::Both),
            Transport::Tls(tls) => {
                tls.conn.send_close_notify();
                tls.sock.shutdown(Shutdown::Both)
            }
        }
    }
}

/// Non-blocking socket stream with buffered reads/writes and would-block
/// yield hooks.
pub struct SocketStream {
    transport: Transport,
    fd: RawFd,
    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
    read_hook: Option<WouldBlockHook>,
    write_hook: Option<WouldBlockHook>,
    eof: bool,
    open: bool,
}

impl SocketStream {
    /// Wrap a plain TCP socket. Switches it to non-blocking mode.
    pub fn plain(sock: TcpStream) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        let fd = sock.as_raw_fd();
        Ok(Self::with_transport(Transport::Tcp(sock), fd))
    }

    /// Wrap a TCP socket in a server-side TLS session. The handshake is
    /// driven lazily by the first read or write.
    pub fn tls(sock: TcpStream, context: &TlsContext) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        let fd = sock.as_raw_fd();
        let session = context.new_session().map_err(io::Error::other)?;
        let tls = rustls::StreamOwned::new(session, sock);
        Ok(Self::with_transport(Transport::Tls(Box::new(tls)), fd))
    }

    fn with_transport(transport: Transport, fd: RawFd) -> Self {
        Self {
            transport,
            fd,
            read_buf: Vec::with_capacity(4096),
            read_pos: 0,
            write_buf: Vec::new(),
            read_hook: None,
            write_hook: None,
            eof: false,
            open: true,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Install the hook invoked when a read would block.
    pub fn set_read_yield<F>(&mut self, hook: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.read_hook = Some(Box::new(hook));
    }

    /// Install the hook invoked when a write would block.
    pub fn set_write_yield<F>(&mut self, hook: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.write_hook = Some(Box::new(hook));
    }

    /// Read one chunk into the buffer. `Ok(0)` means EOF (or a quiet reset).
    fn fill(&mut self) -> io::Result<usize> {
        if self.eof || !self.open {
            return Ok(0);
        }
        let mut chunk = [0u8; 4096];
        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.read_hook.as_mut() {
                        Some(hook) => {
                            if hook() {
                                continue;
                            }
                            return Err(e);
                        }
                        None => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    // Peer vanished: closed, no more data, not an error.
                    self.open = false;
                    self.eof = true;
                    return Ok(0);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn compact(&mut self) {
        if self.read_pos == self.read_buf.len() {
            self.read_buf.clear();
            self.read_pos = 0;
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.read_buf[self.read_pos..]
    }
}

impl Stream for SocketStream {
    fn next_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(offset) = self.buffered().iter().position(|&b| b == b'\n') {
                let end = self.read_pos + offset + 1;
                let line = self.read_buf[self.read_pos..end].to_vec();
                self.read_pos = end;
                self.compact();
                return Ok(line);
            }
            if self.fill()? == 0 {
                let rest = self.buffered().to_vec();
                self.read_pos = self.read_buf.len();
                self.compact();
                return Ok(rest);
            }
        }
    }

    fn ignore(&mut self, n: usize) -> io::Result<()> {
        let mut remaining = n;
        loop {
            let take = remaining.min(self.buffered().len());
            self.read_pos += take;
            remaining -= take;
            self.compact();
            if remaining == 0 {
                return Ok(());
            }
            if self.fill()? == 0 {
                return Ok(());
            }
        }
    }

    fn send_message(&mut self, message: &[u8]) {
        if self.open {
            self.write_buf.extend_from_slice(message);
        }
    }

    fn sync(&mut self) -> io::Result<()> {
        let buf = std::mem::take(&mut self.write_buf);
        let mut offset = 0;
        while offset < buf.len() && self.open {
            match self.transport.write(&buf[offset..]) {
                Ok(0) => {
                    self.open = false;
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.write_hook.as_mut() {
                        Some(hook) => {
                            if hook() {
                                continue;
                            }
                            return Err(e);
                        }
                        None => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionReset
                        || e.kind() == io::ErrorKind::BrokenPipe =>
                {
                    // Reset during write is a silent close.
                    self.open = false;
                    self.eof = true;
                }
                Err(e) => return Err(e),
            }
        }
        while self.open {
            match self.transport.flush() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.write_hook.as_mut() {
                        Some(hook) => {
                            if hook() {
                                continue;
                            }
                            return Err(e);
                        }
                        None => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionReset
                        || e.kind() == io::ErrorKind::BrokenPipe =>
                {
                    self.open = false;
                    self.eof = true;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn has_data(&self) -> bool {
        self.open && !(self.eof && self.read_pos >= self.read_buf.len())
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.transport.shutdown();
        }
        // The fd itself stays allocated until the owning connection entry is
        // dropped, so the fd key cannot be reused while still registered.
        self.open = false;
        self.eof = true;
    }
}

/// In-memory stream for exercising the HTTP engine without sockets.
#[cfg(test)]
pub(crate) mod testing {
    use super::Stream;
    use std::io;

    pub struct MemoryStream {
        input: Vec<u8>,
        pos: usize,
        pub output: Vec<u8>,
        pub synced: usize,
        open: bool,
        closed_by_engine: bool,
    }

    impl MemoryStream {
        pub fn new(input: &[u8]) -> Self {
            Self {
                input: input.to_vec(),
                pos: 0,
                output: Vec::new(),
                synced: 0,
                open: true,
                closed_by_engine: false,
            }
        }

        pub fn was_closed(&self) -> bool {
            self.closed_by_engine
        }

        pub fn output_str(&self) -> String {
            String::from_utf8_lossy(&self.output).into_owned()
        }
    }

    impl Stream for MemoryStream {
        fn next_line(&mut self) -> io::Result<Vec<u8>> {
            let rest = &self.input[self.pos..];
            match rest.iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    let line = rest[..=offset].to_vec();
                    self.pos += offset + 1;
                    Ok(line)
                }
                None => {
                    let line = rest.to_vec();
                    self.pos = self.input.len();
                    Ok(line)
                }
            }
        }

        fn ignore(&mut self, n: usize) -> io::Result<()> {
            self.pos = (self.pos + n).min(self.input.len());
            Ok(())
        }

        fn send_message(&mut self, message: &[u8]) {
            if self.open {
                self.output.extend_from_slice(message);
            }
        }

        fn sync(&mut self) -> io::Result<()> {
            self.synced += 1;
            Ok(())
        }

        fn has_data(&self) -> bool {
            self.open && self.pos < self.input.len()
        }

        fn close(&mut self) {
            self.open = false;
            self.closed_by_engine = true;
        }
    }
}
