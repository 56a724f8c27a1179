//! Connection abstraction shared by the engine and the reactor.
//!
//! The engine only relies on a connection's descriptor; everything else
//! here is used by the reactor and by application hooks.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Which listener (or dial) a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    /// Plain byte stream.
    Stream,
    /// Framed-message stream. Bytes are still delivered raw; the data hook
    /// owns the framing.
    Framed,
}

/// Whether the engine accepted or initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A live connection tracked by the engine.
///
/// `fd` must stay stable for as long as the connection is registered; it is
/// the registry key.
pub trait Conn: Send + Sync + fmt::Debug {
    /// Descriptor used as the registry slot.
    fn fd(&self) -> RawFd;

    fn kind(&self) -> ConnKind {
        ConnKind::Stream
    }

    fn direction(&self) -> Direction {
        Direction::Inbound
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Queue `data` for sending. Returns the number of bytes accepted.
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Ask the owner of the connection to tear it down.
    fn close(&self) -> io::Result<()>;
}

/// Details of a freshly accepted or dialed socket, handed to the
/// new-connection hooks before the connection is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewConn {
    pub fd: RawFd,
    pub kind: ConnKind,
    pub direction: Direction,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}
