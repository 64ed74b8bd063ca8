//! Failure taxonomy shared by every retry decision in the crate.

use std::fmt;

/// What a failure means for the managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A single request failed; the instance is presumed healthy.
    Transient,
    /// The instance is presumed unreachable.
    Connectivity,
    /// The zone cannot satisfy the requested shape.
    ResourceExhausted,
    /// The resource no longer exists provider-side.
    NotFound,
    /// Anything else. Never retried.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Connectivity => write!(f, "connectivity"),
            Self::ResourceExhausted => write!(f, "resource_exhausted"),
            Self::NotFound => write!(f, "not_found"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Maps an error onto [`ErrorKind`].
pub trait Classify {
    /// The kind of failure this error represents.
    fn kind(&self) -> ErrorKind;
}

impl Classify for reqwest::Error {
    fn kind(&self) -> ErrorKind {
        // Connect timeouts report both `is_timeout` and `is_connect`; a slow
        // handshake is treated like a slow response.
        if self.is_timeout() {
            ErrorKind::Transient
        } else if self.is_connect()
            || self.is_request()
            || self.is_status()
            || self.is_body()
            || self.is_decode()
        {
            ErrorKind::Connectivity
        } else {
            ErrorKind::Fatal
        }
    }
}

impl<T: Classify + ?Sized> Classify for Box<T> {
    fn kind(&self) -> ErrorKind {
        (**self).kind()
    }
}
