use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the harness itself, as opposed to errors coming out of
/// user run logic (those are propagated untouched).
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("missing required value for parameter '{0}'")]
    MissingValue(String),
    #[error("invalid value for parameter '{name}': {reason}")]
    InvalidValue { name: String, reason: String },
    #[error("no argument called '{0}'")]
    UnknownArgument(String),
    #[error("duplicate parameter name '{0}'")]
    DuplicateName(String),
    #[error("'{0}' is ambiguous, it names both an input and an output")]
    Ambiguous(String),
    #[error("no input or output named '{0}'")]
    NotFound(String),
    #[error("parameter '{name}' is not of type {expected}")]
    TypeMismatch { name: String, expected: &'static str },
    #[error("metadata key '{key}' contributed twice (second time by '{owner}')")]
    DuplicateMetadataKey { key: String, owner: String },
    #[error("deferred input '{name}' could not be resolved: {reason}")]
    UnresolvedDeferred { name: String, reason: String },
    #[error("cannot reattach to '{identifier}': {reason}")]
    Reattach { identifier: String, reason: String },
    #[error("expected exactly one run of {title}, found {}: {:?}", matches.len(), matches)]
    NotUnique { title: String, matches: Vec<PathBuf> },
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl HarnessError {
    pub fn invalid_value(name: &str, reason: impl Into<String>) -> Self {
        HarnessError::InvalidValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn reattach(identifier: &str, reason: impl Into<String>) -> Self {
        HarnessError::Reattach {
            identifier: identifier.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable code used by the `--json` output of the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            HarnessError::MissingValue(_)
            | HarnessError::InvalidValue { .. }
            | HarnessError::UnknownArgument(_)
            | HarnessError::DuplicateName(_)
            | HarnessError::Ambiguous(_)
            | HarnessError::NotFound(_)
            | HarnessError::TypeMismatch { .. } => "configuration_error",
            HarnessError::DuplicateMetadataKey { .. } | HarnessError::UnresolvedDeferred { .. } => {
                "identity_error"
            }
            HarnessError::Reattach { .. } => "reattach_error",
            HarnessError::NotUnique { .. } => "discovery_error",
            HarnessError::InvalidState(_) => "state_error",
        }
    }
}
