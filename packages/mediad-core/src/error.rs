//! Centralized error types for the mediad core library.
//!
//! All handler errors cross the wire as a negated POSIX errno in the `ret`
//! field of the reply parcel, so every variant has a stable errno mapping
//! and can be reconstructed on the client side.

use thiserror::Error;

/// Application-wide error type for the media control plane.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Malformed parcel, unknown command, bad stream name, out-of-range value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No such handle, criterion, node, or focus client id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Focus stack full, connection table full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Command not implemented for this module.
    #[error("unsupported command: {0}")]
    Unsupported(String),

    /// Reverse listener already created, reconnect no longer possible.
    #[error("busy")]
    Busy,

    /// Socket read/write failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Pending write dropped because of disconnect.
    #[error("cancelled")]
    Cancelled,

    /// Operation attempted after the disconnect flag was set.
    #[error("permission denied")]
    PermissionDenied,

    /// Peer closed the stream mid-frame.
    #[error("connection closed")]
    Closed,
}

impl MediaError {
    /// Negated errno carried in the reply `ret` field.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -libc::EINVAL,
            Self::NotFound(_) => -libc::ENOENT,
            Self::ResourceExhausted("connections") => -libc::EMFILE,
            Self::ResourceExhausted(_) => -libc::ENOSPC,
            Self::Unsupported(_) => -libc::ENOSYS,
            Self::Busy => -libc::EPERM,
            Self::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            Self::Cancelled => -libc::ECANCELED,
            Self::PermissionDenied => -libc::EPERM,
            Self::Closed => -libc::EPIPE,
        }
    }

    /// Reconstructs an error from a negative wire `ret`.
    ///
    /// Lossy by design: `EPERM` decodes to [`MediaError::Busy`] and i/o
    /// errnos collapse into [`MediaError::Io`].
    pub fn from_errno(ret: i32) -> Self {
        match -ret {
            libc::EINVAL => Self::InvalidArgument("remote".into()),
            libc::ENOENT => Self::NotFound("remote".into()),
            libc::ENOSPC => Self::ResourceExhausted("remote"),
            libc::EMFILE => Self::ResourceExhausted("connections"),
            libc::ENOSYS => Self::Unsupported("remote".into()),
            libc::EPERM => Self::Busy,
            libc::ECANCELED => Self::Cancelled,
            libc::EPIPE => Self::Closed,
            errno => Self::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }
}

/// Convenient Result alias for control-plane operations.
pub type MediaResult<T> = Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_the_wire_contract() {
        assert_eq!(MediaError::InvalidArgument("x".into()).errno(), -22);
        assert_eq!(MediaError::NotFound("x".into()).errno(), -2);
        assert_eq!(MediaError::ResourceExhausted("focus stack").errno(), -28);
        assert_eq!(MediaError::ResourceExhausted("connections").errno(), -24);
        assert_eq!(MediaError::Unsupported("x".into()).errno(), -38);
        assert_eq!(MediaError::Cancelled.errno(), -125);
        assert_eq!(MediaError::Closed.errno(), -32);
    }

    #[test]
    fn round_trip_through_errno() {
        for err in [
            MediaError::InvalidArgument("a".into()),
            MediaError::NotFound("b".into()),
            MediaError::ResourceExhausted("connections"),
            MediaError::Unsupported("c".into()),
            MediaError::Cancelled,
            MediaError::Closed,
        ] {
            let errno = err.errno();
            assert_eq!(MediaError::from_errno(errno).errno(), errno);
        }
    }

    #[test]
    fn io_errno_is_preserved() {
        let err = MediaError::Io(std::io::Error::from_raw_os_error(libc::ECONNRESET));
        assert_eq!(err.errno(), -libc::ECONNRESET);
    }
}
