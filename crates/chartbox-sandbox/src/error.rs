//! Error types for the chartbox sandbox.

use thiserror::Error;

use crate::pool::ContextId;

/// Errors that can occur while screening, compiling or invoking callbacks.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Source failed a structural screening check.
    #[error("callback validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Source exceeds the configured maximum size.
    #[error("callback source exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned code pattern was detected during screening.
    #[error("banned pattern detected: `{pattern}`; callbacks may only compute values from their arguments")]
    BannedPattern {
        /// The deny-list entry that matched.
        pattern: String,
    },

    /// Execution exceeded its wall-clock budget and was terminated.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap limit was reached while running sandboxed code.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// A JavaScript exception was thrown, or the source did not compile.
    #[error("javascript error: {message}")]
    JsError {
        /// The error message from V8.
        message: String,
    },

    /// The callback source compiled but did not evaluate to a function.
    #[error("callback source evaluated to {found}, not a function")]
    NotAFunction {
        /// The JS type that was produced instead.
        found: String,
    },

    /// The context is not (or no longer) registered.
    #[error("context not found: {id}")]
    ContextNotFound {
        /// The id that was looked up.
        id: ContextId,
    },

    /// The isolate could not allocate a new context.
    #[error("context creation failed: {reason}")]
    ContextCreation {
        /// Why the context could not be created.
        reason: String,
    },

    /// Too many live contexts.
    #[error("context limit reached (max {max} live contexts)")]
    CapacityExceeded {
        /// Maximum allowed live contexts.
        max: usize,
    },

    /// The pool has been disposed and its isolate torn down.
    #[error("context pool has been disposed")]
    Disposed,

    /// The isolate thread could not be started.
    #[error("failed to start isolate: {0}")]
    IsolateStartup(String),
}

impl SandboxError {
    /// Short machine-readable kind, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation",
            Self::CodeTooLarge { .. } => "code_too_large",
            Self::BannedPattern { .. } => "banned_pattern",
            Self::Timeout { .. } => "timeout",
            Self::HeapLimitExceeded => "heap_limit",
            Self::JsError { .. } => "js_error",
            Self::NotAFunction { .. } => "not_a_function",
            Self::ContextNotFound { .. } => "context_not_found",
            Self::ContextCreation { .. } => "context_creation",
            Self::CapacityExceeded { .. } => "capacity",
            Self::Disposed => "disposed",
            Self::IsolateStartup(_) => "isolate_startup",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_details() {
        let err = SandboxError::CodeTooLarge { max: 10, actual: 20 };
        assert_eq!(
            err.to_string(),
            "callback source exceeds maximum size of 10 bytes (got 20)"
        );

        let err = SandboxError::BannedPattern {
            pattern: "eval(".into(),
        };
        assert!(err.to_string().contains("`eval(`"));

        let err = SandboxError::Timeout { timeout_ms: 1000 };
        assert_eq!(err.to_string(), "execution timed out after 1000ms");
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(SandboxError::Disposed.kind(), "disposed");
        assert_eq!(SandboxError::HeapLimitExceeded.kind(), "heap_limit");
        assert_eq!(
            SandboxError::CapacityExceeded { max: 1 }.kind(),
            "capacity"
        );
        assert_eq!(
            SandboxError::IsolateStartup("no thread".into()).kind(),
            "isolate_startup"
        );
    }
}
