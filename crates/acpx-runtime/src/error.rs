//! Error taxonomy for the acpx runtime adapter.
//!
//! Resolver failures ([`crate::spawn::SpawnError`]) and config failures
//! ([`crate::config::ConfigError`]) are folded into [`AcpRuntimeError`] at
//! the adapter boundary so callers only ever branch on an [`AcpErrorCode`].

use std::fmt;

use crate::spawn::SpawnError;

/// Stable machine-readable error codes surfaced to the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcpErrorCode {
    /// A session could not be created or its working directory is missing.
    SessionInitFailed,
    /// A turn or control verb failed after the backend was reached.
    TurnFailed,
    /// The acpx binary is absent or unusable.
    BackendUnavailable,
    /// A caller-supplied option (mode, config key) was rejected locally.
    InvalidRuntimeOption,
}

impl AcpErrorCode {
    /// The wire form of the code, e.g. `ACP_SESSION_INIT_FAILED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionInitFailed => "ACP_SESSION_INIT_FAILED",
            Self::TurnFailed => "ACP_TURN_FAILED",
            Self::BackendUnavailable => "ACP_BACKEND_UNAVAILABLE",
            Self::InvalidRuntimeOption => "ACP_INVALID_RUNTIME_OPTION",
        }
    }
}

impl fmt::Display for AcpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by one of the adapter's single-shot operations.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AcpRuntimeError {
    /// Classification of the failure.
    pub code: AcpErrorCode,
    /// Human-readable description; names the missing command or directory
    /// when relevant.
    pub message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AcpRuntimeError {
    pub fn new(code: AcpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause (kept for `{:#}` / `source()` chains).
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn session_init(message: impl Into<String>) -> Self {
        Self::new(AcpErrorCode::SessionInitFailed, message)
    }

    pub fn turn_failed(message: impl Into<String>) -> Self {
        Self::new(AcpErrorCode::TurnFailed, message)
    }

    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::new(AcpErrorCode::BackendUnavailable, message)
    }

    pub fn invalid_option(message: impl Into<String>) -> Self {
        Self::new(AcpErrorCode::InvalidRuntimeOption, message)
    }

    /// Re-tag a resolver policy failure with the caller's fallback code.
    pub(crate) fn from_spawn(code: AcpErrorCode, err: SpawnError) -> Self {
        Self::new(code, err.to_string()).with_source(err)
    }
}

/// Shorthand used throughout the adapter.
pub type Result<T, E = AcpRuntimeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_wire_names() {
        assert_eq!(
            AcpErrorCode::SessionInitFailed.to_string(),
            "ACP_SESSION_INIT_FAILED"
        );
        assert_eq!(AcpErrorCode::TurnFailed.as_str(), "ACP_TURN_FAILED");
        assert_eq!(
            AcpErrorCode::BackendUnavailable.as_str(),
            "ACP_BACKEND_UNAVAILABLE"
        );
        assert_eq!(
            AcpErrorCode::InvalidRuntimeOption.as_str(),
            "ACP_INVALID_RUNTIME_OPTION"
        );
    }

    #[test]
    fn display_is_the_message() {
        let err = AcpRuntimeError::session_init("working directory does not exist: /nope");
        assert_eq!(err.to_string(), "working directory does not exist: /nope");
        assert_eq!(err.code, AcpErrorCode::SessionInitFailed);
    }

    #[test]
    fn source_is_preserved() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = AcpRuntimeError::backend_unavailable("acpx command not found: acpx")
            .with_source(io);
        let source = err.source().expect("source should be attached");
        assert_eq!(source.to_string(), "no such file");
    }
}
