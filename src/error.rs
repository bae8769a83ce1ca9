//! Server error types.
//!
//! Only listener-level failures live here. Anything that goes wrong on a
//! single client connection stays inside its handler and ends up as a
//! [`CloseReason`](crate::handler::CloseReason).

use std::io;

/// Fatal server errors. Each one stops the process with a non-zero status.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket could not be created, resolved or bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// `accept` failed in a way the listener cannot recover from.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The async runtime could not be started.
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// How the accept loop reacts to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// Per-connection or resource-pressure failure; back off and retry.
    Transient,
    /// The listening socket itself is broken.
    Fatal,
}

impl AcceptErrorKind {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => return AcceptErrorKind::Transient,
            _ => {}
        }

        // Descriptor or buffer exhaustion clears up once connections close.
        match err.raw_os_error() {
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => {
                AcceptErrorKind::Transient
            }
            _ => AcceptErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
        ] {
            let err = io::Error::new(kind, "test");
            assert_eq!(AcceptErrorKind::classify(&err), AcceptErrorKind::Transient);
        }
    }

    #[test]
    fn test_descriptor_exhaustion_is_transient() {
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(AcceptErrorKind::classify(&err), AcceptErrorKind::Transient);

        let err = io::Error::from_raw_os_error(libc::ENFILE);
        assert_eq!(AcceptErrorKind::classify(&err), AcceptErrorKind::Transient);
    }

    #[test]
    fn test_fatal_kinds() {
        let err = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(AcceptErrorKind::classify(&err), AcceptErrorKind::Fatal);

        let err = io::Error::new(io::ErrorKind::InvalidInput, "bad socket");
        assert_eq!(AcceptErrorKind::classify(&err), AcceptErrorKind::Fatal);
    }

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:7379".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(
            err.to_string(),
            "failed to bind 0.0.0.0:7379: address in use"
        );
    }
}
