//! Error types for the engine core.
//!
//! Configuration problems fail at construction, registry contract
//! violations fail loudly at the call site, and reactor failures are
//! passed through to the caller untouched.

use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

use crate::engine::EngineState;

/// Invalid option value detected while building `EngineOptions`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// Registry capacity must be positive.
    #[error("max_open_files must be positive")]
    ZeroMaxOpenFiles,

    /// At least one sub-reactor is needed to serve connections.
    #[error("sub_reactors must be positive")]
    ZeroSubReactors,

    #[error("read_buffer_size must be positive")]
    ZeroReadBuffer,

    /// Timing wheel tick must be a non-zero duration.
    #[error("timing wheel tick must be non-zero")]
    ZeroTick,

    #[error("timing wheel size must be positive")]
    ZeroWheelSize,

    /// An idle timeout of zero would close every connection immediately.
    #[error("idle timeout must be non-zero when set")]
    ZeroIdleTimeout,

    #[error("listen backlog must be positive")]
    ZeroBacklog,
}

/// Contract violations on the connection registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Descriptor is negative or not below the configured capacity.
    #[error("descriptor {fd} out of bounds (capacity {capacity})")]
    OutOfBounds { fd: RawFd, capacity: usize },

    /// A different connection already occupies the slot.
    #[error("descriptor {0} is already registered to another connection")]
    Occupied(RawFd),
}

/// Errors surfaced by the public `Engine` API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine options: {0}")]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Lifecycle call made from a state that does not support it.
    #[error("cannot {op} engine in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: EngineState,
    },

    /// Failure reported by the reactor (bind, listen, thread spawn, ...).
    #[error("reactor error: {0}")]
    Reactor(#[from] io::Error),
}
