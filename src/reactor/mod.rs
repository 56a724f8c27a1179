//! Reactor: the I/O side of the engine.
//!
//! The engine talks to its reactor only through the `Reactor` trait, so
//! the registry and lifecycle can be exercised against a stub. The bundled
//! implementation, `ReactorMain`, is readiness-based on mio (epoll on
//! Linux, kqueue on macOS):
//! - `acceptor`: listening sockets and the accept thread
//! - `sub`: per-thread event loops that own connections
//! - `tcp_conn`: the `Conn` implementation for TCP streams

mod acceptor;
mod sub;
mod tcp_conn;

pub use tcp_conn::TcpConn;

use crate::conn::{ConnKind, Direction};
use crate::engine::Engine;
use acceptor::AcceptorHandle;
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use sub::{SubMsg, SubReactors};
use tracing::{debug, info};

/// The event-loop subsystem driven by an `Engine`.
pub trait Reactor: Send + Sync {
    /// Bind the listeners and begin polling.
    fn start(&self) -> io::Result<()>;

    /// Close the listeners and tear down every connection, unregistering
    /// each one from the engine.
    fn stop(&self) -> io::Result<()>;

    /// Real address of the raw-stream listener.
    fn listen_addr(&self) -> Option<SocketAddr>;

    /// Real address of the framed-message listener.
    fn framed_listen_addr(&self) -> Option<SocketAddr>;

    /// Dial `addr` and adopt the stream as an outbound connection.
    fn connect(&self, addr: SocketAddr, kind: ConnKind) -> io::Result<()> {
        let _ = (addr, kind);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "reactor does not support outbound connections",
        ))
    }
}

impl<R: Reactor + ?Sized> Reactor for Arc<R> {
    fn start(&self) -> io::Result<()> {
        (**self).start()
    }

    fn stop(&self) -> io::Result<()> {
        (**self).stop()
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        (**self).listen_addr()
    }

    fn framed_listen_addr(&self) -> Option<SocketAddr> {
        (**self).framed_listen_addr()
    }

    fn connect(&self, addr: SocketAddr, kind: ConnKind) -> io::Result<()> {
        (**self).connect(addr, kind)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ListenAddrs {
    stream: Option<SocketAddr>,
    framed: Option<SocketAddr>,
}

struct Running {
    acceptor: AcceptorHandle,
    subs: SubReactors,
}

/// mio-backed reactor: one acceptor thread plus `sub_reactors` workers.
pub struct ReactorMain {
    engine: Weak<Engine>,
    running: Mutex<Option<Running>>,
    addrs: Mutex<ListenAddrs>,
}

impl ReactorMain {
    pub fn new(engine: Weak<Engine>) -> Self {
        Self {
            engine,
            running: Mutex::new(None),
            addrs: Mutex::new(ListenAddrs::default()),
        }
    }

    fn engine(&self) -> io::Result<Arc<Engine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "engine dropped"))
    }
}

impl Reactor for ReactorMain {
    fn start(&self) -> io::Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }

        let engine = self.engine()?;
        let options = Arc::clone(engine.options());

        // Bind first so address problems surface before any thread exists.
        let mut listeners = vec![(
            acceptor::bind_listener(options.addr, &options)?,
            ConnKind::Stream,
        )];
        if let Some(framed_addr) = options.framed_addr {
            listeners.push((
                acceptor::bind_listener(framed_addr, &options)?,
                ConnKind::Framed,
            ));
        }

        let mut addrs = ListenAddrs::default();
        for (listener, kind) in &listeners {
            let addr = listener.local_addr()?;
            match kind {
                ConnKind::Stream => addrs.stream = Some(addr),
                ConnKind::Framed => addrs.framed = Some(addr),
            }
        }

        let subs = SubReactors::spawn(options.sub_reactors, &engine)?;
        let acceptor = match acceptor::spawn(listeners, Arc::clone(subs.dispatcher())) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                subs.shutdown();
                return Err(e);
            }
        };

        *lock(&self.addrs) = addrs;
        *running = Some(Running { acceptor, subs });

        info!(
            sub_reactors = options.sub_reactors,
            max_open_files = options.max_open_files,
            "Reactor started"
        );
        Ok(())
    }

    fn stop(&self) -> io::Result<()> {
        let Some(running) = lock(&self.running).take() else {
            debug!("Reactor not running, nothing to stop");
            return Ok(());
        };

        // Listeners close with the acceptor; then the subs drain.
        running.acceptor.shutdown();
        running.subs.shutdown();

        info!("Reactor stopped");
        Ok(())
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        lock(&self.addrs).stream
    }

    fn framed_listen_addr(&self) -> Option<SocketAddr> {
        lock(&self.addrs).framed
    }

    fn connect(&self, addr: SocketAddr, kind: ConnKind) -> io::Result<()> {
        let dispatcher = match lock(&self.running).as_ref() {
            Some(running) => Arc::clone(running.subs.dispatcher()),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "reactor not running",
                ))
            }
        };
        let timeout = self.engine()?.options().connect_timeout;

        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        debug!(peer = %addr, ?kind, "Outbound connection established");

        dispatcher.dispatch(SubMsg::Adopt {
            stream: TcpStream::from_std(stream),
            kind,
            direction: Direction::Outbound,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
