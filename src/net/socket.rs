//! Non-blocking TCP plumbing for the connection core. Readiness is not
//! tracked with an event loop; the state machine attempts bounded syscalls
//! and treats would-block as a signal to yield.

use crate::net::result::{Error, Result};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;

/// How a non-blocking connect attempt left the socket.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectStart {
    /// The connect is in flight; `poll_connected` decides when it lands.
    Started,
    /// The socket connected immediately.
    Connected,
}

#[derive(Debug)]
pub enum SendOutcome {
    Sent(usize),
    WouldBlock,
}

#[derive(Debug)]
pub enum RecvOutcome {
    Received(usize),
    WouldBlock,
    /// The peer closed the connection.
    Closed,
}

/// One non-blocking TCP socket, possibly mid-connect.
pub struct NonBlockingSocket {
    stream: Option<TcpStream>,
}

impl NonBlockingSocket {
    #[inline]
    pub fn new() -> NonBlockingSocket {
        NonBlockingSocket { stream: None }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Resolves `host:port` and starts a non-blocking connect on the first
    /// workable candidate. Candidates that fail outright are skipped; an
    /// exhausted list is an error.
    pub fn start_connect(&mut self, host: &str, port: u16) -> Result<ConnectStart> {
        self.close();

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::io("resolve", e))?;

        let mut last_error: Option<Error> = None;
        for addr in addrs {
            let stream = match TcpStream::connect(addr) {
                Ok(stream) => stream,
                Err(e) => {
                    last_error = Some(Error::io("connect", e));
                    continue;
                }
            };

            self.stream = Some(stream);
            match self.poll_connected() {
                Ok(true) => return Ok(ConnectStart::Connected),
                Ok(false) => return Ok(ConnectStart::Started),
                Err(e) => {
                    self.close();
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::io(
                "connect",
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved"),
            )
        }))
    }

    /// Checks whether an in-flight connect completed. A pending socket
    /// reports false; a failed connect surfaces its SO_ERROR.
    pub fn poll_connected(&mut self) -> Result<bool> {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => return Ok(false),
        };

        if let Some(e) = stream.take_error().map_err(|e| Error::io("connect", e))? {
            return Err(Error::io("connect", e));
        }

        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(ref e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(e) => Err(Error::io("connect", e)),
        }
    }

    /// Attempts one bounded write. Returns the byte count on progress and
    /// `WouldBlock` when the kernel has no room.
    pub fn send_some(&mut self, buf: &[u8]) -> Result<SendOutcome> {
        let mut stream = match &self.stream {
            Some(stream) => stream,
            None => return Ok(SendOutcome::Sent(0)),
        };
        if buf.is_empty() {
            return Ok(SendOutcome::Sent(0));
        }

        match stream.write(buf) {
            Ok(n) => Ok(SendOutcome::Sent(n)),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(SendOutcome::WouldBlock)
            }
            Err(e) => Err(Error::io("send", e)),
        }
    }

    /// Attempts one bounded read. A zero-length read without would-block
    /// means the peer closed.
    pub fn recv_some(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        let mut stream = match &self.stream {
            Some(stream) => stream,
            None => return Ok(RecvOutcome::WouldBlock),
        };
        if buf.is_empty() {
            return Ok(RecvOutcome::WouldBlock);
        }

        match stream.read(buf) {
            Ok(0) => Ok(RecvOutcome::Closed),
            Ok(n) => Ok(RecvOutcome::Received(n)),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(RecvOutcome::WouldBlock)
            }
            Err(e) => Err(Error::io("recv", e)),
        }
    }
}
