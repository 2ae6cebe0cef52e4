// src/error.rs
//! Error taxonomy shared by the pollers, the batch stages and the collaborators.

use std::fmt;

/// Subsystem tag attached to errors that escape a [`crate::retry::RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Browser,
    DataProcessing,
    Classification,
    Notification,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Browser => "browser",
            ErrorKind::DataProcessing => "data-processing",
            ErrorKind::Classification => "classification",
            ErrorKind::Notification => "notification",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Network or automation-session hiccup; retried by the policy.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Malformed record or request. Dropped and counted, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Classifier/notifier returned non-2xx or an unparseable body.
    #[error("{service} failed: {message}")]
    ExternalService { service: &'static str, message: String },

    /// Lock acquisition failure or stale state; fatal to the current batch only.
    #[error("coordination error: {0}")]
    Coordination(String),

    /// Every attempt failed; carries the last observed error.
    #[error("{kind} operation failed after {attempts} attempt(s): {source}")]
    Exhausted {
        kind: ErrorKind,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

impl HarvestError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            HarvestError::Exhausted { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_coordination(&self) -> bool {
        matches!(self, HarvestError::Coordination(_))
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_message_names_the_subsystem() {
        let err = HarvestError::Exhausted {
            kind: ErrorKind::Classification,
            attempts: 3,
            source: anyhow::anyhow!("HTTP 502"),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("classification operation failed after 3"));
        assert!(msg.contains("HTTP 502"));
        assert_eq!(err.kind(), Some(ErrorKind::Classification));
    }
}
