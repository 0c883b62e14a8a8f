// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for the Repetier link.

use thiserror::Error;

/// Top-level error type for all Repetier link operations.
#[derive(Debug, Error)]
pub enum RepetierError {
    // -- Transport errors --
    #[error("request timed out")]
    Timeout,

    #[error("instance unreachable: {0}")]
    Unreachable(String),

    #[error("server returned HTTP {status} {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    #[error("transport error: {0}")]
    Transport(String),

    // -- Discovery / registry --
    #[error("instance discovery failed: {0}")]
    Discovery(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("invalid instance descriptor: {0}")]
    InvalidDescriptor(String),

    // -- Session --
    #[error("an upload is already in progress")]
    UploadInProgress,

    #[error("no active session")]
    NoActiveSession,

    #[error("API key pairing failed: {0}")]
    Pairing(String),

    #[error("operation cancelled")]
    Cancelled,

    // -- Storage / persistence --
    #[error("preference storage error: {0}")]
    Preferences(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepetierError {
    /// Whether the error is the kind the session recovers from on its own
    /// (silence, dropped connection) rather than one the user must act on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unreachable(_))
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RepetierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_unreachable_are_transient() {
        assert!(RepetierError::Timeout.is_transient());
        assert!(RepetierError::Unreachable("no route".into()).is_transient());
        assert!(
            !RepetierError::HttpStatus {
                status: 401,
                reason: "Unauthorized".into()
            }
            .is_transient()
        );
        assert!(!RepetierError::MalformedBody("eof".into()).is_transient());
    }

    #[test]
    fn http_status_display_includes_code() {
        let err = RepetierError::HttpStatus {
            status: 409,
            reason: "Conflict".into(),
        };
        assert_eq!(err.to_string(), "server returned HTTP 409 Conflict");
    }
}
