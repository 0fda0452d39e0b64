use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::Duration;
use log::{debug, info};
use crate::clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::raw::Raw;

#[cfg(target_os = "linux")]
pub mod connector;
#[cfg(target_os = "linux")]
pub mod ebpf;
pub mod replay;

pub use replay::{Feeder, Replay};

// One kernel mechanism for observing process lifecycle notifications.
pub trait Backend {
    fn name(&self) -> &'static str;

    // Never blocks: returns what is available now, at most `max` items.
    fn read_batch(&mut self, max: usize) -> Result<Vec<Raw>>;

    // Readable when `read_batch` has something to return.
    fn fd(&self) -> RawFd;

    // Notifications already read from the kernel but held back by `max`.
    // The descriptor does not signal these.
    fn has_pending(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    Auto,
    Ebpf,
    Connector,
}

impl Default for Kind {
    fn default() -> Self {
        Self::Auto
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match arg {
            "auto"      => Ok(Self::Auto),
            "ebpf"      => Ok(Self::Ebpf),
            "connector" => Ok(Self::Connector),
            _           => Err(Error::Config(format!("unknown backend '{}'", arg))),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto      => "auto",
            Self::Ebpf      => "ebpf",
            Self::Connector => "connector",
        })
    }
}

// Opens the configured backend, or with `auto` the first one this host
// supports, preferring the probe backend when bytecode is available.
pub fn open(config: &Config) -> Result<Box<dyn Backend>> {
    match config.backend {
        Kind::Ebpf      => ebpf(config),
        Kind::Connector => connector(config),
        Kind::Auto      => {
            let mut failures = Vec::new();

            if config.bytecode.is_some() {
                match ebpf(config) {
                    Ok(backend) => return Ok(backend),
                    Err(e)      => failures.push(e),
                }
            }

            match connector(config) {
                Ok(backend) => return Ok(backend),
                Err(e)      => failures.push(e),
            }

            for e in &failures {
                debug!("backend probe failed: {}", e);
            }

            Err(unavailable(failures))
        }
    }
}

// Waits until `fd` is readable or `timeout` passes. Returns whether it
// became readable; an interrupted wait counts as a timeout.
pub fn wait(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd:      fd,
        events:  libc::POLLIN,
        revents: 0,
    };

    let ms = match timeout.as_millis() {
        0 if timeout > Duration::ZERO => 1,
        ms                            => ms.min(libc::c_int::MAX as u128) as libc::c_int,
    };

    match unsafe { libc::poll(&mut pfd, 1, ms) } {
        -1 => match io::Error::last_os_error() {
            e if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            e                                           => Err(e),
        },
        0 => Ok(false),
        _ => Ok(pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0),
    }
}

// Gap marker for notifications the kernel dropped; zero means the count is
// unknown.
pub(crate) fn overflow(count: u64) -> Raw {
    Raw::lost(count).at(clock::monotonic_ns())
}

// Moves everything past `max` into `pending`, to lead the next batch.
pub(crate) fn carry(batch: &mut Vec<Raw>, pending: &mut VecDeque<Raw>, max: usize) {
    if batch.len() > max {
        pending.extend(batch.drain(max..));
    }
}

// Whether an attach failure came from missing privileges.
pub(crate) fn denied(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| match cause.downcast_ref::<io::Error>() {
        Some(e) => e.kind() == io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(libc::EPERM),
        None    => false,
    })
}

pub(crate) fn failed(backend: &'static str, e: anyhow::Error) -> Error {
    match denied(&e) {
        true  => Error::PermissionDenied { backend, message: format!("{:#}", e) },
        false => Error::BackendUnavailable(format!("{}: {:#}", backend, e)),
    }
}

fn unavailable(failures: Vec<Error>) -> Error {
    let mut reasons = Vec::new();

    for e in failures {
        match e {
            Error::PermissionDenied { .. } => return e,
            e                              => reasons.push(e.to_string()),
        }
    }

    Error::BackendUnavailable(reasons.join("; "))
}

#[cfg(target_os = "linux")]
fn ebpf(config: &Config) -> Result<Box<dyn Backend>> {
    let backend = ebpf::Ebpf::open(config)?;
    info!("attached ebpf backend");
    Ok(Box::new(backend))
}

#[cfg(target_os = "linux")]
fn connector(config: &Config) -> Result<Box<dyn Backend>> {
    let backend = connector::Connector::open(config)?;
    info!("attached connector backend");
    Ok(Box::new(backend))
}

#[cfg(not(target_os = "linux"))]
fn ebpf(_config: &Config) -> Result<Box<dyn Backend>> {
    Err(Error::BackendUnavailable("ebpf: requires linux".into()))
}

#[cfg(not(target_os = "linux"))]
fn connector(_config: &Config) -> Result<Box<dyn Backend>> {
    Err(Error::BackendUnavailable("connector: requires linux".into()))
}
