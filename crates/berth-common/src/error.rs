//! Unified error types for the berth workspace.
//!
//! Higher-level crates wrap [`BerthError`] in their own domain enums when they
//! need extra variants (the HTTP layer adds transport and protocol errors).

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("No such {kind}: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The operation conflicts with the current state of a resource.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// A caller-supplied value is malformed.
    #[error("Bad parameter: {message}")]
    InvalidParameter {
        /// Description of the malformed input.
        message: String,
    },

    /// The process supervisor failed to act on a container process.
    #[error("process error: {message}")]
    Process {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BerthError {
    /// Builds a [`BerthError::NotFound`] for a container reference.
    #[must_use]
    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "container",
            id: id.into(),
        }
    }

    /// Builds a [`BerthError::NotFound`] for an image reference.
    #[must_use]
    pub fn image_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "image",
            id: id.into(),
        }
    }

    /// Builds a [`BerthError::Conflict`].
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Builds a [`BerthError::InvalidParameter`].
    #[must_use]
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Builds a [`BerthError::Process`].
    #[must_use]
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    /// Wraps an I/O error with the path it occurred at.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind_and_id() {
        let err = BerthError::container_not_found("abc123");
        assert_eq!(err.to_string(), "No such container: abc123");
    }

    #[test]
    fn conflict_message_is_prefixed() {
        let err = BerthError::conflict("container is running");
        assert_eq!(err.to_string(), "Conflict: container is running");
    }
}
