//! reactor-engine: connection lifecycle orchestration for a reactor-based
//! network engine.
//!
//! The core is small:
//! - `ConnectionRegistry`: fixed-capacity table of live connections keyed
//!   by descriptor
//! - `EventHooks`: one callback slot per connection event
//! - `EngineOptions`: frozen configuration built from functional options
//! - `Engine`: lifecycle (`start`/`stop`) and the query API
//!
//! The I/O loop lives behind the `Reactor` trait. `ReactorMain` is a mio
//! implementation with a raw-stream listener, an optional framed-message
//! listener, and a pool of sub-reactor threads. `TimingWheel` schedules the
//! reactor's delayed work such as idle timeouts.

pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod options;
pub mod reactor;
pub mod registry;
pub mod timer;

#[cfg(test)]
pub(crate) mod testing;

pub use conn::{Conn, ConnKind, Direction, NewConn};
pub use engine::{Engine, EngineState};
pub use error::{EngineError, OptionsError, RegistryError};
pub use hooks::EventHooks;
pub use options::{EngineOptions, Opt};
pub use reactor::{Reactor, ReactorMain, TcpConn};
pub use registry::ConnectionRegistry;
pub use timer::{TimerId, TimingWheel};
