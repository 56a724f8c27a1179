//! Engine options built with functional options.
//!
//! `EngineOptions::build` starts from the defaults, applies each `Opt` in
//! order, then validates the result. The engine holds the frozen record
//! behind an `Arc` and never mutates it again.

use crate::error::OptionsError;
use std::net::SocketAddr;
use std::time::Duration;

/// A single configuration step applied to the defaults.
pub type Opt = Box<dyn FnOnce(&mut EngineOptions) + Send>;

/// Registry capacity used when the open-file limit cannot be read.
pub const DEFAULT_MAX_OPEN_FILES: usize = 1024;

/// Upper bound on the default capacity. The registry is allocated up
/// front, and some containers report an open-file limit near 2^30.
pub const MAX_DEFAULT_OPEN_FILES: usize = 1 << 20;

/// Immutable engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Registry capacity; descriptors must be below this.
    pub max_open_files: usize,
    /// Raw-stream listen address.
    pub addr: SocketAddr,
    /// Framed-message listen address. No framed listener when unset.
    pub framed_addr: Option<SocketAddr>,
    /// Number of sub-reactor worker threads.
    pub sub_reactors: usize,
    /// Bytes read per `read` call on a connection.
    pub read_buffer_size: usize,
    /// Close connections with no I/O for this long.
    pub idle_timeout: Option<Duration>,
    /// Timing wheel granularity.
    pub timing_wheel_tick: Duration,
    /// Number of slots in the timing wheel.
    pub timing_wheel_size: usize,
    pub listen_backlog: i32,
    /// Set SO_REUSEPORT on the listeners.
    pub reuse_port: bool,
    /// Timeout for outbound connects.
    pub connect_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_open_files: default_max_open_files(open_file_limit()),
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            framed_addr: None,
            sub_reactors: num_cpus(),
            read_buffer_size: 16 * 1024,
            idle_timeout: None,
            timing_wheel_tick: Duration::from_millis(500),
            timing_wheel_size: 10_000,
            listen_backlog: 1024,
            reuse_port: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineOptions {
    /// Apply `opts` to the defaults in order and validate the result.
    pub fn build<I>(opts: I) -> Result<Self, OptionsError>
    where
        I: IntoIterator<Item = Opt>,
    {
        let mut options = Self::default();
        for opt in opts {
            opt(&mut options);
        }
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<(), OptionsError> {
        if self.max_open_files == 0 {
            return Err(OptionsError::ZeroMaxOpenFiles);
        }
        if self.sub_reactors == 0 {
            return Err(OptionsError::ZeroSubReactors);
        }
        if self.read_buffer_size == 0 {
            return Err(OptionsError::ZeroReadBuffer);
        }
        if self.timing_wheel_tick.is_zero() {
            return Err(OptionsError::ZeroTick);
        }
        if self.timing_wheel_size == 0 {
            return Err(OptionsError::ZeroWheelSize);
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(OptionsError::ZeroIdleTimeout);
        }
        if self.listen_backlog <= 0 {
            return Err(OptionsError::ZeroBacklog);
        }
        Ok(())
    }
}

pub fn with_max_open_files(max_open_files: usize) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.max_open_files = max_open_files)
}

pub fn with_addr(addr: SocketAddr) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.addr = addr)
}

pub fn with_framed_addr(addr: SocketAddr) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.framed_addr = Some(addr))
}

pub fn with_sub_reactors(count: usize) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.sub_reactors = count)
}

pub fn with_read_buffer_size(size: usize) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.read_buffer_size = size)
}

pub fn with_idle_timeout(timeout: Duration) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.idle_timeout = Some(timeout))
}

/// Configure the timing wheel's granularity and slot count.
pub fn with_timing_wheel(tick: Duration, size: usize) -> Opt {
    Box::new(move |o: &mut EngineOptions| {
        o.timing_wheel_tick = tick;
        o.timing_wheel_size = size;
    })
}

pub fn with_listen_backlog(backlog: i32) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.listen_backlog = backlog)
}

pub fn with_reuse_port(enabled: bool) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.reuse_port = enabled)
}

pub fn with_connect_timeout(timeout: Duration) -> Opt {
    Box::new(move |o: &mut EngineOptions| o.connect_timeout = timeout)
}

fn default_max_open_files(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_MAX_OPEN_FILES)
        .min(MAX_DEFAULT_OPEN_FILES)
}

/// Soft RLIMIT_NOFILE of the current process.
fn open_file_limit() -> Option<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        return None;
    }
    usize::try_from(limit.rlim_cur).ok().filter(|&n| n > 0)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = EngineOptions::build(Vec::<Opt>::new()).unwrap();
        assert!(options.max_open_files > 0);
        assert!(options.sub_reactors > 0);
        assert_eq!(options.timing_wheel_tick, Duration::from_millis(500));
        assert_eq!(options.timing_wheel_size, 10_000);
        assert!(options.framed_addr.is_none());
        assert!(options.idle_timeout.is_none());
    }

    #[test]
    fn test_options_apply_in_order() {
        let options = EngineOptions::build(vec![
            with_max_open_files(16),
            with_sub_reactors(2),
            with_max_open_files(32),
        ])
        .unwrap();
        assert_eq!(options.max_open_files, 32);
        assert_eq!(options.sub_reactors, 2);
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        let cases: Vec<(Opt, OptionsError)> = vec![
            (with_max_open_files(0), OptionsError::ZeroMaxOpenFiles),
            (with_sub_reactors(0), OptionsError::ZeroSubReactors),
            (with_read_buffer_size(0), OptionsError::ZeroReadBuffer),
            (
                with_timing_wheel(Duration::ZERO, 10),
                OptionsError::ZeroTick,
            ),
            (
                with_timing_wheel(Duration::from_millis(10), 0),
                OptionsError::ZeroWheelSize,
            ),
            (
                with_idle_timeout(Duration::ZERO),
                OptionsError::ZeroIdleTimeout,
            ),
            (with_listen_backlog(0), OptionsError::ZeroBacklog),
        ];

        for (opt, expected) in cases {
            assert_eq!(EngineOptions::build(vec![opt]), Err(expected));
        }
    }

    #[test]
    fn test_default_capacity_is_bounded() {
        assert_eq!(default_max_open_files(Some(4096)), 4096);
        assert_eq!(default_max_open_files(None), DEFAULT_MAX_OPEN_FILES);
        assert_eq!(
            default_max_open_files(Some(1 << 30)),
            MAX_DEFAULT_OPEN_FILES
        );

        let options = EngineOptions::build(Vec::<Opt>::new()).unwrap();
        assert!(options.max_open_files <= MAX_DEFAULT_OPEN_FILES);
    }

    #[test]
    fn test_addresses() {
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let framed: SocketAddr = "0.0.0.0:9001".parse().unwrap();
        let options = EngineOptions::build(vec![with_addr(addr), with_framed_addr(framed)]).unwrap();
        assert_eq!(options.addr, addr);
        assert_eq!(options.framed_addr, Some(framed));
    }
}
