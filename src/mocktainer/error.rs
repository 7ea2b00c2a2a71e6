//! Error types for the container lifecycle library.

use std::io;

/// Result type alias for mocktainer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing a container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation
    // =========================================================================
    /// The OCI spec or derived configuration is malformed.
    #[error("{0}")]
    Config(String),

    /// The container id is not usable as a directory name.
    #[error("invalid container id {id:?}: {reason}")]
    InvalidId { id: String, reason: &'static str },

    // =========================================================================
    // Container lifecycle
    // =========================================================================
    /// A container with this id already has state on disk.
    #[error("container with id {0} already exists")]
    AlreadyExists(String),

    /// No state exists for this id.
    #[error("container {0} does not exist")]
    NotExist(String),

    /// The operation is illegal in the container's current status.
    #[error("{0}")]
    InvalidState(String),

    /// The container's init process is not running.
    #[error("container not running")]
    NotRunning,

    /// Delivering a signal to the init process failed.
    #[error("unable to signal init: {0}")]
    Signal(#[source] nix::Error),

    // =========================================================================
    // Init process protocol
    // =========================================================================
    /// The init process reported an error or never became ready.
    #[error("unable to start container process: {0}")]
    Init(String),

    /// A malformed or out-of-order message on the init socket.
    #[error("synchronisation with init failed: {0}")]
    Sync(String),

    /// Malformed bootstrap data.
    #[error("bootstrap data: {0}")]
    Bootstrap(String),

    // =========================================================================
    // Hooks
    // =========================================================================
    /// A lifecycle hook failed or timed out.
    #[error("error running {name} hook #{index}: {reason}")]
    Hook {
        name: String,
        index: usize,
        reason: String,
    },

    // =========================================================================
    // Wrapped system errors
    // =========================================================================
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Nix {
        context: String,
        #[source]
        source: nix::Error,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn nix(context: impl Into<String>, source: nix::Error) -> Self {
        Error::Nix {
            context: context.into(),
            source,
        }
    }

    /// Whether the error means a path did not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotExist(_) => true,
            Error::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            Error::Nix { source, .. } => *source == nix::Error::ENOENT,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = Error::io(
            "reading state",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "reading state: gone");
        assert!(err.is_not_found());

        let err = Error::Hook {
            name: "poststart".to_string(),
            index: 1,
            reason: "exit status 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "error running poststart hook #1: exit status 1"
        );
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_signal_error() {
        let err = Error::Signal(nix::Error::ESRCH);
        assert!(err.to_string().starts_with("unable to signal init"));
        assert_eq!(Error::NotRunning.to_string(), "container not running");
    }
}
