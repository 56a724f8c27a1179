//! Listening sockets and the acceptor thread.
//!
//! The acceptor owns the raw-stream listener and, when configured, the
//! framed-message listener. Accepted streams are handed round-robin to the
//! sub-reactors; the acceptor never touches connection I/O.

use crate::conn::{ConnKind, Direction};
use crate::options::EngineOptions;
use crate::reactor::sub::{Dispatcher, SubMsg};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Handle to a running acceptor thread.
pub(crate) struct AcceptorHandle {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl AcceptorHandle {
    /// Stop accepting, close the listeners and wait for the thread.
    pub(crate) fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor");
        }
        let _ = self.handle.join();
    }
}

struct Acceptor {
    poll: Poll,
    listeners: Vec<(TcpListener, ConnKind)>,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<AtomicBool>,
}

/// Spawn the acceptor thread over already-bound listeners.
pub(crate) fn spawn(
    mut listeners: Vec<(TcpListener, ConnKind)>,
    dispatcher: Arc<Dispatcher>,
) -> io::Result<AcceptorHandle> {
    let poll = Poll::new()?;
    for (idx, (listener, _)) in listeners.iter_mut().enumerate() {
        poll.registry()
            .register(listener, Token(idx), Interest::READABLE)?;
    }
    let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
    let shutdown = Arc::new(AtomicBool::new(false));

    let acceptor = Acceptor {
        poll,
        listeners,
        dispatcher,
        shutdown: Arc::clone(&shutdown),
    };

    let handle = thread::Builder::new()
        .name("acceptor".to_string())
        .spawn(move || {
            if let Err(e) = acceptor.run() {
                error!(error = %e, "Acceptor failed");
            }
        })?;

    Ok(AcceptorHandle {
        waker,
        shutdown,
        handle,
    })
}

impl Acceptor {
    fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(64);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {
                        if self.shutdown.load(Ordering::Acquire) {
                            debug!("Acceptor shutting down");
                            return Ok(());
                        }
                    }
                    Token(idx) => self.accept_connections(idx),
                }
            }
        }
    }

    fn accept_connections(&self, idx: usize) {
        let Some((listener, kind)) = self.listeners.get(idx) else {
            return;
        };

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, kind = ?kind, "Accepted connection");
                    let msg = SubMsg::Adopt {
                        stream,
                        kind: *kind,
                        direction: Direction::Inbound,
                    };
                    if let Err(e) = self.dispatcher.dispatch(msg) {
                        warn!(error = %e, "No sub-reactor to take connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }
}

/// Bind a non-blocking TCP listener configured from `options`.
pub(crate) fn bind_listener(addr: SocketAddr, options: &EngineOptions) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(options.listen_backlog)?;

    let listener = TcpListener::from_std(socket.into());
    info!(addr = %listener.local_addr()?, "Listening");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_any_port_reports_real_addr() {
        let options = EngineOptions::default();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &options).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_bind_in_use_fails() {
        let options = EngineOptions::default();
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), &options).unwrap();
        let taken = first.local_addr().unwrap();

        let err = bind_listener(taken, &options).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
