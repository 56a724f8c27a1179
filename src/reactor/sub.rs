//! Sub-reactor event loop.
//!
//! Each sub-reactor is one thread with its own `Poll`. It adopts streams
//! handed over by the acceptor (or by an outbound connect), registers them
//! with the engine, and dispatches data and close events to the hooks.
//! Readiness is edge-triggered: reads drain the socket until `WouldBlock`.

use crate::conn::{Conn, ConnKind, Direction, NewConn};
use crate::engine::Engine;
use crate::reactor::tcp_conn::TcpConn;
use crate::timer::TimingWheel;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Messages delivered to a sub-reactor through its channel.
pub(crate) enum SubMsg {
    /// Take ownership of a connected stream.
    Adopt {
        stream: TcpStream,
        kind: ConnKind,
        direction: Direction,
    },
    /// Tear down every connection and exit.
    Shutdown,
}

struct SubLink {
    tx: Sender<SubMsg>,
    waker: Arc<Waker>,
}

impl SubLink {
    fn send(&self, msg: SubMsg) -> io::Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sub-reactor gone"))?;
        self.waker.wake()
    }
}

/// Round-robin hand-off to the sub-reactors.
pub(crate) struct Dispatcher {
    links: Vec<SubLink>,
    next: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn dispatch(&self, msg: SubMsg) -> io::Result<()> {
        if self.links.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no sub-reactors",
            ));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.links.len();
        self.links[idx].send(msg)
    }
}

/// Running sub-reactor threads.
pub(crate) struct SubReactors {
    dispatcher: Arc<Dispatcher>,
    handles: Vec<JoinHandle<()>>,
}

impl SubReactors {
    /// Spawn `count` sub-reactors serving `engine`.
    pub(crate) fn spawn(count: usize, engine: &Arc<Engine>) -> io::Result<Self> {
        let mut subs = SubReactors {
            dispatcher: Arc::new(Dispatcher {
                links: Vec::with_capacity(count),
                next: AtomicUsize::new(0),
            }),
            handles: Vec::with_capacity(count),
        };
        let mut links = Vec::with_capacity(count);

        for id in 0..count {
            let spawned = SubReactor::new(id, Arc::clone(engine)).and_then(|(sub, link)| {
                let handle = thread::Builder::new()
                    .name(format!("sub-reactor-{id}"))
                    .spawn(move || sub.run())?;
                Ok((handle, link))
            });

            match spawned {
                Ok((handle, link)) => {
                    subs.handles.push(handle);
                    links.push(link);
                }
                Err(e) => {
                    // Unwind the ones already running.
                    subs.dispatcher = Arc::new(Dispatcher {
                        links,
                        next: AtomicUsize::new(0),
                    });
                    subs.shutdown();
                    return Err(e);
                }
            }
        }

        subs.dispatcher = Arc::new(Dispatcher {
            links,
            next: AtomicUsize::new(0),
        });
        Ok(subs)
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Tell every sub-reactor to tear down its connections, then join them.
    ///
    /// When called from a hook running on a sub-reactor, that thread is not
    /// joined; it tears down its own connections once the hook returns.
    pub(crate) fn shutdown(self) {
        for link in &self.dispatcher.links {
            if let Err(e) = link.send(SubMsg::Shutdown) {
                warn!(error = %e, "Failed to signal sub-reactor");
            }
        }
        let current = thread::current().id();
        for handle in self.handles {
            if handle.thread().id() == current {
                debug!("Shutdown requested from a sub-reactor, not joining it");
                continue;
            }
            let _ = handle.join();
        }
    }
}

struct Entry {
    conn: Arc<TcpConn>,
}

struct SubReactor {
    id: usize,
    poll: Poll,
    rx: Receiver<SubMsg>,
    engine: Arc<Engine>,
    conns: Slab<Entry>,
    buf: Vec<u8>,
}

impl SubReactor {
    fn new(id: usize, engine: Arc<Engine>) -> io::Result<(Self, SubLink)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = mpsc::channel();
        let buf = vec![0u8; engine.options().read_buffer_size];

        let sub = SubReactor {
            id,
            poll,
            rx,
            engine,
            conns: Slab::new(),
            buf,
        };
        Ok((sub, SubLink { tx, waker }))
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        debug!(sub = self.id, "Sub-reactor started");

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(sub = self.id, error = %e, "Poll failed");
                break;
            }

            let mut shutdown = false;
            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => shutdown |= self.drain_messages(),
                    Token(key) => {
                        if let Err(e) = self.handle_event(key, event) {
                            debug!(sub = self.id, key, error = %e, "Connection error");
                            self.close_connection(key);
                        }
                    }
                }
            }

            if shutdown {
                break;
            }
        }

        self.close_all();
        debug!(sub = self.id, "Sub-reactor stopped");
    }

    /// Process queued messages. Returns true on shutdown.
    fn drain_messages(&mut self) -> bool {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                SubMsg::Adopt {
                    stream,
                    kind,
                    direction,
                } => self.adopt(stream, kind, direction),
                SubMsg::Shutdown => return true,
            }
        }
        false
    }

    fn adopt(&mut self, mut stream: TcpStream, kind: ConnKind, direction: Direction) {
        let info = NewConn {
            fd: stream.as_raw_fd(),
            kind,
            direction,
            local_addr: stream.local_addr().ok(),
            peer_addr: stream.peer_addr().ok(),
        };

        let hooks = self.engine.hooks();
        if let Some(hook) = hooks.new_conn() {
            hook(&info);
        }
        let specialized = match direction {
            Direction::Inbound => hooks.new_inbound_conn(),
            Direction::Outbound => hooks.new_outbound_conn(),
        };
        if let Some(hook) = specialized {
            hook(&info);
        }

        let capacity = self.engine.options().max_open_files;
        if usize::try_from(info.fd).map_or(true, |fd| fd >= capacity) {
            warn!(fd = info.fd, capacity, "Descriptor beyond max_open_files, rejecting");
            return;
        }

        let entry = self.conns.vacant_entry();
        let key = entry.key();
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!(fd = info.fd, error = %e, "Failed to register connection");
            return;
        }

        let conn = Arc::new(TcpConn::new(stream, info));
        let dyn_conn: Arc<dyn Conn> = conn.clone();
        if let Err(e) = self.engine.add_conn(Arc::clone(&dyn_conn)) {
            warn!(fd = info.fd, error = %e, "Failed to register connection with engine");
            let mut io = conn.lock_io();
            let _ = self.poll.registry().deregister(&mut io.stream);
            io.shutdown();
            return;
        }
        entry.insert(Entry {
            conn: Arc::clone(&conn),
        });

        trace!(sub = self.id, key, fd = info.fd, ?kind, ?direction, "Connection adopted");

        if let Some(hook) = self.engine.hooks().connect() {
            hook(&dyn_conn);
        }

        if let Some(timeout) = self.engine.options().idle_timeout {
            schedule_idle_check(
                Arc::downgrade(self.engine.timing_wheel()),
                Arc::downgrade(&conn),
                timeout,
            );
        }
    }

    fn handle_event(&mut self, key: usize, event: &mio::event::Event) -> io::Result<()> {
        let Some(entry) = self.conns.get(key) else {
            return Ok(());
        };
        let conn = Arc::clone(&entry.conn);

        if event.is_error() {
            let err = conn
                .lock_io()
                .stream
                .take_error()?
                .unwrap_or_else(|| io::Error::other("socket error"));
            return Err(err);
        }

        if event.is_readable() || event.is_read_closed() {
            self.handle_readable(&conn)?;
        }

        if event.is_writable() {
            conn.flush()?;
        }

        Ok(())
    }

    fn handle_readable(&mut self, conn: &Arc<TcpConn>) -> io::Result<()> {
        let dyn_conn: Arc<dyn Conn> = conn.clone();

        loop {
            match conn.read(&mut self.buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"));
                }
                Ok(n) => {
                    if let Some(hook) = self.engine.hooks().data() {
                        hook(&dyn_conn, &self.buf[..n]);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close_connection(&mut self, key: usize) {
        let Some(entry) = self.conns.try_remove(key) else {
            return;
        };
        let conn = entry.conn;

        {
            let mut io = conn.lock_io();
            let _ = self.poll.registry().deregister(&mut io.stream);
            io.shutdown();
        }

        if let Err(e) = self.engine.remove_conn(&*conn) {
            warn!(fd = conn.fd(), error = %e, "Failed to unregister connection");
        }

        let dyn_conn: Arc<dyn Conn> = conn;
        if let Some(hook) = self.engine.hooks().close() {
            hook(&dyn_conn);
        }

        debug!(sub = self.id, key, fd = dyn_conn.fd(), "Connection closed");
    }

    fn close_all(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_connection(key);
        }
    }
}

/// Close `conn` once it has been idle for `timeout`.
///
/// The check re-arms itself for the remaining time while the connection is
/// active, and stops once the connection is closed or dropped.
fn schedule_idle_check(wheel: Weak<TimingWheel>, conn: Weak<TcpConn>, timeout: Duration) {
    schedule_idle_check_in(wheel, conn, timeout, timeout);
}

fn schedule_idle_check_in(
    wheel: Weak<TimingWheel>,
    conn: Weak<TcpConn>,
    timeout: Duration,
    delay: Duration,
) {
    let Some(timer) = wheel.upgrade() else {
        return;
    };

    timer.schedule(delay, move || {
        let Some(live) = conn.upgrade() else {
            return;
        };
        if live.is_closed() {
            return;
        }

        let idle = live.idle_for();
        if idle >= timeout {
            debug!(fd = live.fd(), idle_ms = idle.as_millis() as u64, "Closing idle connection");
            let _ = live.close();
        } else {
            schedule_idle_check_in(wheel, conn, timeout, timeout - idle);
        }
    });
}
