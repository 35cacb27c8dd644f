use std::io;

use thiserror::Error;

/// Errors surfaced by the dial-out transport.
///
/// Each variant maps to one failure class of the protocol: configuration
/// problems are fatal at construction, authentication and transport
/// failures affect exactly one session, and `Closed`/`Shutdown` cover the
/// teardown path.
#[derive(Debug, Error)]
pub enum DialoutError {
    /// Invalid or missing TLS material, or a security-mode field
    /// combination that is internally inconsistent. No server or client
    /// object is returned when this is raised.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Credential mismatch or absence when the peer requires credentials.
    /// Rejects only the offending session.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// I/O, TLS, or decode failure mid-stream. Terminates only the
    /// affected session.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// Operation attempted after the owning server or client was closed.
    #[error("endpoint is closed")]
    Closed,

    /// Operation invalid for the endpoint's current state, such as
    /// starting a second accept loop while one is already running.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Secondary error encountered while forcing termination during close.
    #[error("shutdown: {0}")]
    Shutdown(String),
}

impl DialoutError {
    /// Whether this error is an ordinary peer disconnect rather than a
    /// fault worth reporting at error level.
    pub fn is_disconnect(&self) -> bool {
        match self {
            DialoutError::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<rustls::Error> for DialoutError {
    fn from(e: rustls::Error) -> Self {
        DialoutError::Transport(io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

pub type Result<T> = std::result::Result<T, DialoutError>;
