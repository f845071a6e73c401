//! Redefinition status codes and the failure sink
//!
//! Every component reports failures as an [`ErrorCode`] plus a message.
//! [`FailureRecorder`] is the single sink a batch funnels them through: it
//! prefixes the message with the class descriptor and keeps the first
//! failure only.

use std::fmt;
use thiserror::Error;

/// Status of a failed redefinition request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The agent environment was disposed
    InvalidEnvironment,
    /// Malformed request
    IllegalArgument,
    /// A required handle or buffer is missing
    NullPointer,
    /// The handle does not name a usable class
    InvalidClass,
    /// The replacement bytes are not a single well-formed class
    InvalidClassFormat,
    /// The replacement defines a different class
    NamesDontMatch,
    /// Superclass or interfaces changed
    UnsupportedHierarchyChanged,
    /// Class modifiers changed
    UnsupportedClassModifiersChanged,
    /// A method was added
    UnsupportedMethodAdded,
    /// A method was removed
    UnsupportedMethodDeleted,
    /// Method modifiers changed
    UnsupportedMethodModifiersChanged,
    /// Fields were added, removed or changed
    UnsupportedSchemaChanged,
    /// The replacement does not verify
    FailsVerification,
    /// An allocation failed
    OutOfMemory,
    /// The environment lacks the capability for this request
    MustPossessCapability,
    /// The class can never be redefined
    UnmodifiableClass,
    /// The request cannot be carried out in the current runtime state
    Internal,
}

impl ErrorCode {
    /// Canonical name of the code
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InvalidEnvironment => "INVALID_ENVIRONMENT",
            ErrorCode::IllegalArgument => "ILLEGAL_ARGUMENT",
            ErrorCode::NullPointer => "NULL_POINTER",
            ErrorCode::InvalidClass => "INVALID_CLASS",
            ErrorCode::InvalidClassFormat => "INVALID_CLASS_FORMAT",
            ErrorCode::NamesDontMatch => "NAMES_DONT_MATCH",
            ErrorCode::UnsupportedHierarchyChanged => "UNSUPPORTED_REDEFINITION_HIERARCHY_CHANGED",
            ErrorCode::UnsupportedClassModifiersChanged => {
                "UNSUPPORTED_REDEFINITION_CLASS_MODIFIERS_CHANGED"
            }
            ErrorCode::UnsupportedMethodAdded => "UNSUPPORTED_REDEFINITION_METHOD_ADDED",
            ErrorCode::UnsupportedMethodDeleted => "UNSUPPORTED_REDEFINITION_METHOD_DELETED",
            ErrorCode::UnsupportedMethodModifiersChanged => {
                "UNSUPPORTED_REDEFINITION_METHOD_MODIFIERS_CHANGED"
            }
            ErrorCode::UnsupportedSchemaChanged => "UNSUPPORTED_REDEFINITION_SCHEMA_CHANGED",
            ErrorCode::FailsVerification => "FAILS_VERIFICATION",
            ErrorCode::OutOfMemory => "OUT_OF_MEMORY",
            ErrorCode::MustPossessCapability => "MUST_POSSESS_CAPABILITY",
            ErrorCode::UnmodifiableClass => "UNMODIFIABLE_CLASS",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed redefinition request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RedefineError {
    /// Status code
    pub code: ErrorCode,
    /// Diagnostic message
    pub message: String,
}

impl RedefineError {
    /// Create an error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failure of one step for one class, before the descriptor is attached
pub(crate) type StepResult<T> = Result<T, (ErrorCode, String)>;

/// Collects the first failure of a batch
#[derive(Debug, Default)]
pub struct FailureRecorder {
    first: Option<RedefineError>,
}

impl FailureRecorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure of the class named `descriptor`
    ///
    /// Later failures are logged and dropped.
    pub fn record(&mut self, code: ErrorCode, descriptor: &str, reason: &str) {
        let message = format!("Unable to perform redefinition of '{descriptor}': {reason}");
        log::debug!("{code}: {message}");
        if self.first.is_none() {
            self.first = Some(RedefineError { code, message });
        }
    }

    /// Whether a failure has been recorded
    pub fn has_failed(&self) -> bool {
        self.first.is_some()
    }

    /// The first recorded failure
    pub fn first(&self) -> Option<&RedefineError> {
        self.first.as_ref()
    }

    /// `Ok` if nothing failed, else the first failure
    pub fn into_result(self) -> Result<(), RedefineError> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
