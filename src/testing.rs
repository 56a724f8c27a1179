//! Test doubles for the connection and reactor seams.

use crate::conn::{Conn, ConnKind};
use crate::reactor::Reactor;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory connection that records what is written to it.
#[derive(Debug)]
pub struct StubConn {
    fd: RawFd,
    pub written: Mutex<Vec<u8>>,
}

impl StubConn {
    pub fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(Self {
            fd,
            written: Mutex::new(Vec::new()),
        })
    }
}

impl Conn for StubConn {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Reactor that counts lifecycle calls and never does I/O.
#[derive(Default)]
pub struct StubReactor {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub connects: AtomicUsize,
    fail_start: Option<io::ErrorKind>,
}

impl StubReactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(kind: io::ErrorKind) -> Arc<Self> {
        Arc::new(Self {
            fail_start: Some(kind),
            ..Self::default()
        })
    }
}

impl Reactor for StubReactor {
    fn start(&self) -> io::Result<()> {
        if let Some(kind) = self.fail_start {
            return Err(io::Error::new(kind, "stub bind failure"));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> io::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn framed_listen_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn connect(&self, _addr: SocketAddr, _kind: ConnKind) -> io::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
