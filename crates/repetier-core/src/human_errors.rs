// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable error messages for the host UI.
//
// Every technical error is mapped to a short message and a suggestion. The
// four severity levels drive how the host presents it.

use crate::error::RepetierError;

/// Severity of an error from the user's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Silence or a dropped connection; the session recovers on its own.
    Transient,
    /// The user must fix something (API key, printer state, file name).
    ActionRequired,
    /// Retrying will not help.
    Permanent,
    /// Local setup problem (preferences, disk).
    Environment,
}

/// A human-readable error with a message and an actionable suggestion.
#[derive(Debug, Clone)]
pub struct HumanError {
    pub message: String,
    pub suggestion: String,
    /// Whether the session keeps retrying by itself.
    pub retriable: bool,
    pub severity: Severity,
}

/// Convert a `RepetierError` into a `HumanError`.
pub fn humanize_error(err: &RepetierError) -> HumanError {
    match err {
        RepetierError::Timeout => HumanError {
            message: "Repetier did not respond in time.".into(),
            suggestion: "Check that the server is running. The connection is retried automatically.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        RepetierError::Unreachable(detail) => HumanError {
            message: "Repetier cannot be reached.".into(),
            suggestion: format!("Make sure this computer and the server share a network. ({detail})"),
            retriable: true,
            severity: Severity::Transient,
        },

        RepetierError::HttpStatus { status, reason } => humanize_status(*status, reason),

        RepetierError::MalformedBody(_) => HumanError {
            message: "Repetier sent a response we could not read.".into(),
            suggestion: "The server version may be unsupported. Updating Repetier-Server usually fixes this.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        RepetierError::Transport(detail) => HumanError {
            message: "The network connection could not be set up.".into(),
            suggestion: format!("Try again. ({detail})"),
            retriable: true,
            severity: Severity::Transient,
        },

        RepetierError::Discovery(_) => HumanError {
            message: "We can't search for Repetier servers right now.".into(),
            suggestion: "Check the network connection, or add the server manually by address.".into(),
            retriable: true,
            severity: Severity::Transient,
        },

        RepetierError::UnknownInstance(id) => HumanError {
            message: "That Repetier server is no longer available.".into(),
            suggestion: format!("Select another server or add '{id}' again."),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RepetierError::InvalidDescriptor(detail) => HumanError {
            message: "The server address doesn't look right.".into(),
            suggestion: format!("Check the address, port and path. ({detail})"),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RepetierError::UploadInProgress => HumanError {
            message: "A print job is still being sent.".into(),
            suggestion: "Wait for it to finish or cancel it first.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RepetierError::NoActiveSession => HumanError {
            message: "No Repetier printer is connected.".into(),
            suggestion: "Select a printer that is linked to a Repetier server.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RepetierError::Pairing(detail) => HumanError {
            message: "Repetier did not hand out an API key.".into(),
            suggestion: format!("Confirm the request in the Repetier web interface, or enter the key manually. ({detail})"),
            retriable: false,
            severity: Severity::ActionRequired,
        },

        RepetierError::Cancelled => HumanError {
            message: "The operation was cancelled.".into(),
            suggestion: "Start it again when you are ready.".into(),
            retriable: false,
            severity: Severity::Permanent,
        },

        RepetierError::Preferences(_) | RepetierError::Serialization(_) => HumanError {
            message: "Stored Repetier settings could not be read or written.".into(),
            suggestion: "Re-enter the server settings. If this keeps happening, reset the plugin settings.".into(),
            retriable: false,
            severity: Severity::Environment,
        },

        RepetierError::Io(_) => HumanError {
            message: "There was a problem reading or writing a file.".into(),
            suggestion: "Check free disk space and permissions of the configuration folder.".into(),
            retriable: false,
            severity: Severity::Environment,
        },
    }
}

fn humanize_status(status: u16, reason: &str) -> HumanError {
    match status {
        401 | 403 => HumanError {
            message: "Repetier does not allow access with this API key.".into(),
            suggestion: "Enter the API key shown in the Repetier web interface under Global Settings.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },
        409 => HumanError {
            message: "The printer connected to Repetier is not operational.".into(),
            suggestion: "Check that the printer is switched on and connected to the server.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        },
        404 => HumanError {
            message: "Repetier does not know this printer.".into(),
            suggestion: "The printer may have been renamed. Select it again in the connection settings.".into(),
            retriable: false,
            severity: Severity::ActionRequired,
        },
        500..=599 => HumanError {
            message: "Repetier reported an internal error.".into(),
            suggestion: format!("Restart Repetier-Server and try again. ({status} {reason})"),
            retriable: true,
            severity: Severity::Transient,
        },
        _ => HumanError {
            message: "Repetier returned an unexpected answer.".into(),
            suggestion: format!("Try again. ({status} {reason})"),
            retriable: false,
            severity: Severity::Permanent,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        let human = humanize_error(&RepetierError::Timeout);
        assert_eq!(human.severity, Severity::Transient);
        assert!(human.retriable);
    }

    #[test]
    fn unauthorized_needs_a_new_key() {
        let human = humanize_error(&RepetierError::HttpStatus {
            status: 401,
            reason: "Unauthorized".into(),
        });
        assert_eq!(human.severity, Severity::ActionRequired);
        assert!(!human.retriable);
        assert!(human.message.contains("API key"));
    }

    #[test]
    fn conflict_reports_not_operational() {
        let human = humanize_error(&RepetierError::HttpStatus {
            status: 409,
            reason: "Conflict".into(),
        });
        assert!(human.message.contains("not operational"));
    }

    #[test]
    fn server_errors_are_retriable() {
        let human = humanize_error(&RepetierError::HttpStatus {
            status: 503,
            reason: "Service Unavailable".into(),
        });
        assert_eq!(human.severity, Severity::Transient);
    }

    #[test]
    fn duplicate_upload_is_action_required() {
        let human = humanize_error(&RepetierError::UploadInProgress);
        assert_eq!(human.severity, Severity::ActionRequired);
    }
}
