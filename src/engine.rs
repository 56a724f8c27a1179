//! The engine: connection registry, hook table, options and lifecycle.
//!
//! The engine does no I/O itself. `start`/`stop` are forwarded to the
//! reactor, which calls back into `add_conn`/`remove_conn` and fires the
//! hooks as connections come and go.

use crate::conn::{Conn, ConnKind, NewConn};
use crate::error::{EngineError, RegistryError};
use crate::hooks::EventHooks;
use crate::options::{EngineOptions, Opt};
use crate::reactor::{Reactor, ReactorMain};
use crate::registry::ConnectionRegistry;
use crate::timer::TimingWheel;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Registry allocated and empty, no I/O active.
    Created,
    Running,
    /// `stop` is tearing the reactor down.
    Stopping,
    /// Terminal; restarting is not supported.
    Stopped,
}

/// A network engine instance.
///
/// Engines are independent: each owns its own registry, hooks and
/// reactor, so several can coexist in one process.
pub struct Engine {
    registry: ConnectionRegistry,
    hooks: EventHooks,
    options: Arc<EngineOptions>,
    timing_wheel: Arc<TimingWheel>,
    reactor: Box<dyn Reactor>,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Build an engine backed by the mio reactor.
    pub fn new<I>(opts: I) -> Result<Arc<Self>, EngineError>
    where
        I: IntoIterator<Item = Opt>,
    {
        Self::with_reactor(opts, |engine| Box::new(ReactorMain::new(engine)))
    }

    /// Build an engine around a custom reactor.
    ///
    /// `make_reactor` receives a weak handle to the engine under
    /// construction; upgrade it once the reactor starts.
    pub fn with_reactor<I, F>(opts: I, make_reactor: F) -> Result<Arc<Self>, EngineError>
    where
        I: IntoIterator<Item = Opt>,
        F: FnOnce(Weak<Engine>) -> Box<dyn Reactor>,
    {
        let options = EngineOptions::build(opts)?;
        let timing_wheel = Arc::new(TimingWheel::new(
            options.timing_wheel_tick,
            options.timing_wheel_size,
        )?);

        debug!(
            max_open_files = options.max_open_files,
            sub_reactors = options.sub_reactors,
            "Engine created"
        );

        Ok(Arc::new_cyclic(|weak| Engine {
            registry: ConnectionRegistry::new(options.max_open_files),
            hooks: EventHooks::new(),
            options: Arc::new(options),
            timing_wheel,
            reactor: make_reactor(weak.clone()),
            state: Mutex::new(EngineState::Created),
        }))
    }

    /// Start the timing wheel and the reactor.
    ///
    /// Only valid from `Created`. If the reactor fails to start, the error
    /// is returned as-is and the engine stays `Created`.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut state = self.lock_state();
        if *state != EngineState::Created {
            return Err(EngineError::InvalidState {
                op: "start",
                state: *state,
            });
        }

        self.timing_wheel.start()?;
        if let Err(e) = self.reactor.start() {
            warn!(error = %e, "Reactor failed to start");
            self.timing_wheel.stop();
            return Err(EngineError::Reactor(e));
        }

        *state = EngineState::Running;
        info!(
            addr = ?self.listen_addr(),
            framed_addr = ?self.framed_listen_addr(),
            "Engine started"
        );
        Ok(())
    }

    /// Stop the reactor.
    ///
    /// Always forwarded to the reactor, which must unregister every
    /// connection it tears down. A running engine passes through `Stopping`,
    /// which refuses `start`, and ends `Stopped`.
    pub fn stop(&self) -> Result<(), EngineError> {
        // Not held across the reactor call: hooks fired during teardown may
        // query the engine.
        {
            let mut state = self.lock_state();
            if *state == EngineState::Running {
                *state = EngineState::Stopping;
            }
        }

        if let Err(e) = self.reactor.stop() {
            let mut state = self.lock_state();
            if *state == EngineState::Stopping {
                *state = EngineState::Running;
            }
            return Err(e.into());
        }

        // A start that slipped in before the reactor call was torn down
        // with it, so anything past Created ends Stopped.
        let stopped = {
            let mut state = self.lock_state();
            match *state {
                EngineState::Running | EngineState::Stopping => {
                    *state = EngineState::Stopped;
                    true
                }
                EngineState::Created | EngineState::Stopped => false,
            }
        };

        if stopped {
            self.timing_wheel.stop();
            info!(remaining = self.conn_count(), "Engine stopped");
        }
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        *self.lock_state()
    }

    /// Dial `addr` through the reactor. The connection is registered and
    /// the outbound hooks fire once the reactor adopts it.
    pub fn connect(&self, addr: SocketAddr, kind: ConnKind) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Running {
            return Err(EngineError::InvalidState {
                op: "connect",
                state,
            });
        }
        self.reactor.connect(addr, kind)?;
        Ok(())
    }

    /// Register a connection under its descriptor.
    pub fn add_conn(&self, conn: Arc<dyn Conn>) -> Result<(), RegistryError> {
        self.registry.add(conn)
    }

    /// Clear the slot of `conn`'s descriptor.
    pub fn remove_conn(&self, conn: &dyn Conn) -> Result<Option<Arc<dyn Conn>>, RegistryError> {
        self.registry.remove(conn)
    }

    /// Look up a connection. An empty slot is `Ok(None)`.
    pub fn get_conn(&self, fd: RawFd) -> Result<Option<Arc<dyn Conn>>, RegistryError> {
        self.registry.get(fd)
    }

    /// Snapshot of all live connections, ordered by descriptor.
    pub fn get_all_conn(&self) -> Vec<Arc<dyn Conn>> {
        self.registry.get_all()
    }

    pub fn conn_count(&self) -> usize {
        self.registry.count()
    }

    /// Real address of the raw-stream listener, once bound.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.reactor.listen_addr()
    }

    /// Real address of the framed-message listener, once bound.
    pub fn framed_listen_addr(&self) -> Option<SocketAddr> {
        self.reactor.framed_listen_addr()
    }

    pub fn options(&self) -> &Arc<EngineOptions> {
        &self.options
    }

    pub fn timing_wheel(&self) -> &Arc<TimingWheel> {
        &self.timing_wheel
    }

    /// Hook table, read by the reactor when dispatching.
    pub fn hooks(&self) -> &EventHooks {
        &self.hooks
    }

    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn Conn>) + Send + Sync + 'static,
    {
        self.hooks.set_connect(Arc::new(hook));
    }

    pub fn on_data<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn Conn>, &[u8]) + Send + Sync + 'static,
    {
        self.hooks.set_data(Arc::new(hook));
    }

    pub fn on_close<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn Conn>) + Send + Sync + 'static,
    {
        self.hooks.set_close(Arc::new(hook));
    }

    /// Fired for every accepted or dialed socket, before registration.
    pub fn on_new_conn<F>(&self, hook: F)
    where
        F: Fn(&NewConn) + Send + Sync + 'static,
    {
        self.hooks.set_new_conn(Arc::new(hook));
    }

    pub fn on_new_inbound_conn<F>(&self, hook: F)
    where
        F: Fn(&NewConn) + Send + Sync + 'static,
    {
        self.hooks.set_new_inbound_conn(Arc::new(hook));
    }

    pub fn on_new_outbound_conn<F>(&self, hook: F)
    where
        F: Fn(&NewConn) + Send + Sync + 'static,
    {
        self.hooks.set_new_outbound_conn(Arc::new(hook));
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
