use std::fmt;
use std::time::Duration;

use crate::worker::InvokeError;

/// Whether a failed call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Failure of a capability call as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    Timeout {
        capability: String,
        method: String,
        after: Duration,
    },
    WorkerCrashed {
        capability: String,
        reason: String,
    },
    Remote {
        capability: String,
        kind: String,
        message: String,
        retryable: bool,
    },
    UnknownCapability(String),
    LaunchFailed {
        capability: String,
        reason: String,
    },
    CircuitOpen {
        capability: String,
        retry_in: Duration,
    },
    /// The worker answered, but not with the shape the caller needs.
    Malformed {
        capability: String,
        reason: String,
    },
}

impl CallError {
    pub fn from_invoke(capability: &str, method: &str, error: InvokeError) -> Self {
        match error {
            InvokeError::Timeout(after) => CallError::Timeout {
                capability: capability.to_string(),
                method: method.to_string(),
                after,
            },
            InvokeError::WorkerCrashed(reason) => CallError::WorkerCrashed {
                capability: capability.to_string(),
                reason,
            },
            InvokeError::Remote(body) => CallError::Remote {
                capability: capability.to_string(),
                kind: body.kind,
                message: body.message,
                retryable: body.retryable,
            },
        }
    }

    pub fn malformed(capability: &str, reason: impl Into<String>) -> Self {
        CallError::Malformed {
            capability: capability.to_string(),
            reason: reason.into(),
        }
    }

    /// Pure function of the error value.
    pub fn class(&self) -> ErrorClass {
        match self {
            CallError::Timeout { .. }
            | CallError::WorkerCrashed { .. }
            | CallError::LaunchFailed { .. } => ErrorClass::Transient,
            CallError::Remote { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            CallError::UnknownCapability(_)
            | CallError::CircuitOpen { .. }
            | CallError::Malformed { .. } => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short machine-readable tag used in logs and annotations.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::Timeout { .. } => "timeout",
            CallError::WorkerCrashed { .. } => "worker_crashed",
            CallError::Remote { .. } => "remote_error",
            CallError::UnknownCapability(_) => "unknown_capability",
            CallError::LaunchFailed { .. } => "launch_failed",
            CallError::CircuitOpen { .. } => "circuit_open",
            CallError::Malformed { .. } => "malformed",
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Timeout {
                capability,
                method,
                after,
            } => write!(f, "{}.{} timed out after {:?}", capability, method, after),
            CallError::WorkerCrashed { capability, reason } => {
                write!(f, "worker for '{}' crashed: {}", capability, reason)
            }
            CallError::Remote {
                capability,
                kind,
                message,
                ..
            } => write!(f, "'{}' returned {}: {}", capability, kind, message),
            CallError::UnknownCapability(capability) => {
                write!(f, "unknown capability '{}'", capability)
            }
            CallError::LaunchFailed { capability, reason } => {
                write!(f, "failed to launch '{}': {}", capability, reason)
            }
            CallError::CircuitOpen {
                capability,
                retry_in,
            } => write!(
                f,
                "circuit open for '{}', retry in {:?}",
                capability, retry_in
            ),
            CallError::Malformed { capability, reason } => {
                write!(f, "malformed result from '{}': {}", capability, reason)
            }
        }
    }
}

impl std::error::Error for CallError {}
