//! Transport-level errors

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Which socket operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Bind,
    Accept,
    Connect,
    Send,
    Receive,
    Resolve,
    /// Operation not allowed in the socket's current state
    InvalidState,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkErrorKind::Bind => "bind failed",
            NetworkErrorKind::Accept => "accept failed",
            NetworkErrorKind::Connect => "connect failed",
            NetworkErrorKind::Send => "send failed",
            NetworkErrorKind::Receive => "receive failed",
            NetworkErrorKind::Resolve => "resolve failed",
            NetworkErrorKind::InvalidState => "invalid socket state",
        };
        f.write_str(name)
    }
}

/// A failure raised by a socket wrapper.
///
/// Carries the OS error that caused it, if any. Cloneable so it can travel
/// inside events.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Arc<io::Error>>,
}

impl NetworkError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn io(kind: NetworkErrorKind, message: impl Into<String>, cause: io::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(NetworkErrorKind::InvalidState, message)
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
