//! TCP connection owned by a sub-reactor.
//!
//! Writes go straight to the socket when it has room; whatever does not
//! fit is queued and flushed by the sub-reactor on the next writable event.

use crate::conn::{Conn, ConnKind, Direction, NewConn};
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub(crate) struct ConnIo {
    pub(crate) stream: TcpStream,
    /// Output the socket has not accepted yet.
    pending: BytesMut,
    closed: bool,
}

pub struct TcpConn {
    info: NewConn,
    io: Mutex<ConnIo>,
    last_active: Mutex<Instant>,
}

impl TcpConn {
    pub(crate) fn new(stream: TcpStream, info: NewConn) -> Self {
        Self {
            info,
            io: Mutex::new(ConnIo {
                stream,
                pending: BytesMut::new(),
                closed: false,
            }),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Read once into `buf`.
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.lock_io().stream.read(buf)?;
        self.touch();
        Ok(n)
    }

    /// Write queued output until done or the socket is full.
    pub(crate) fn flush(&self) -> io::Result<()> {
        let mut io = self.lock_io();
        let ConnIo {
            stream, pending, ..
        } = &mut *io;

        while !pending.is_empty() {
            match stream.write(&pending[..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        drop(io);
        self.touch();
        Ok(())
    }

    /// Bytes waiting for the socket.
    pub fn pending(&self) -> usize {
        self.lock_io().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_io().closed
    }

    /// Time since the last read or write.
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Lock the socket state. Used by the sub-reactor to deregister.
    pub(crate) fn lock_io(&self) -> MutexGuard<'_, ConnIo> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

impl ConnIo {
    /// Mark closed and shut the socket down in both directions.
    pub(crate) fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        // NotConnected when the peer already went away.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Conn for TcpConn {
    fn fd(&self) -> RawFd {
        self.info.fd
    }

    fn kind(&self) -> ConnKind {
        self.info.kind
    }

    fn direction(&self) -> Direction {
        self.info.direction
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.info.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.info.peer_addr
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut io = self.lock_io();
        if io.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }

        // Keep ordering behind anything already queued.
        if !io.pending.is_empty() {
            io.pending.extend_from_slice(data);
            return Ok(data.len());
        }

        let mut written = 0;
        while written < data.len() {
            match io.stream.write(&data[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    io.pending.extend_from_slice(&data[written..]);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        drop(io);
        self.touch();
        Ok(data.len())
    }

    /// Shut the socket down; its sub-reactor sees the hangup and tears the
    /// connection down. Queued output is discarded.
    fn close(&self) -> io::Result<()> {
        self.lock_io().shutdown();
        Ok(())
    }
}

impl std::fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConn")
            .field("fd", &self.info.fd)
            .field("kind", &self.info.kind)
            .field("direction", &self.info.direction)
            .field("peer", &self.info.peer_addr)
            .finish()
    }
}
