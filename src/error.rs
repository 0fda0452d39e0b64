use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no supported backend: {0}")]
    BackendUnavailable(String),

    #[error("permission denied attaching {backend} backend: {message}")]
    PermissionDenied {
        backend: &'static str,
        message: String,
    },

    #[error("backend I/O error: {0}")]
    BackendIo(#[from] io::Error),

    #[error("queue is closed")]
    InvalidState,

    #[error("{0} allocation failed")]
    Exhausted(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    // Whether the handle stays usable after the call that returned this.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendIo(_) | Self::Exhausted(_))
    }
}
