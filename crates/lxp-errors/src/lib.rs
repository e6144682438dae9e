//! Canonical failure taxonomy for the job-execution substrate.
//!
//! Every failure that crosses an aggregate boundary is carried by a
//! [`CoreError`] tagged with one of seven [`Code`]s. The worker and the
//! retry machinery branch on the code, never on error text:
//!
//! | Code                  | Retried? | Meaning                                   |
//! |-----------------------|----------|-------------------------------------------|
//! | `validation`          | no       | caller input rejected                     |
//! | `not_found`           | no       | referenced row missing                    |
//! | `conflict`            | no       | optimistic CAS lost; a peer succeeded     |
//! | `invariant_violation` | no       | aggregate invariant broken                |
//! | `precondition_failed` | no       | upstream precondition unmet               |
//! | `retryable`           | yes      | transient (deadlock, timeout, cancel)     |
//! | `internal`            | no       | unclassified                              |
//!
//! Classification happens exactly once, at the aggregate boundary, via
//! [`map_err_code`]. Repository code stays on `anyhow` with `.context(...)`
//! and lets the raw database error bubble up to the mapper.

use thiserror::Error;

/// Result alias used by aggregate-facing APIs.
pub type CoreResult<T> = Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Code
// ---------------------------------------------------------------------------

/// The fixed set of failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Validation,
    NotFound,
    Conflict,
    InvariantViolation,
    PreconditionFailed,
    Retryable,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Validation => "validation",
            Code::NotFound => "not_found",
            Code::Conflict => "conflict",
            Code::InvariantViolation => "invariant_violation",
            Code::PreconditionFailed => "precondition_failed",
            Code::Retryable => "retryable",
            Code::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(Code::Validation),
            "not_found" => Some(Code::NotFound),
            "conflict" => Some(Code::Conflict),
            "invariant_violation" => Some(Code::InvariantViolation),
            "precondition_failed" => Some(Code::PreconditionFailed),
            "retryable" => Some(Code::Retryable),
            "internal" => Some(Code::Internal),
            _ => None,
        }
    }

    /// Only `retryable` failures re-enter the claim loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Code::Retryable)
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// A typed failure with an operation label and an optional underlying cause.
#[derive(Debug, Error)]
#[error("{op}: {message}")]
pub struct CoreError {
    code: Code,
    op: String,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(code: Code, op: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            op: op.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause. The cause stays reachable through the
    /// standard `Error::source` chain for logging and downcasting.
    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(cause.into());
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Annotate an arbitrary error with a code and operation label.
///
/// The original error becomes the cause; its text becomes the message so
/// user-facing surfaces do not need to walk the chain.
pub fn wrap(code: Code, op: impl Into<String>, err: anyhow::Error) -> CoreError {
    let message = err.to_string();
    CoreError {
        code,
        op: op.into(),
        message,
        source: Some(err.into()),
    }
}

/// The most specific code carried by `err` or any wrapped cause.
///
/// The outermost [`CoreError`] in the chain wins; a bare error yields `None`.
pub fn code_of(err: &anyhow::Error) -> Option<Code> {
    err.chain()
        .find_map(|e| e.downcast_ref::<CoreError>())
        .map(|ce| ce.code)
}

/// True when `err` (or any wrapped cause) carries `code`.
pub fn is_code(err: &anyhow::Error, code: Code) -> bool {
    code_of(err) == Some(code)
}

// ---------------------------------------------------------------------------
// map_err_code — the single classification point
// ---------------------------------------------------------------------------

/// Classify an arbitrary error at the aggregate boundary.
///
/// - Already-typed errors pass through identically (same code, op, cause).
/// - Cancellation / deadline expiry → `retryable`.
/// - Unique-key violation → `conflict`; foreign-key violation →
///   `precondition_failed`; serialization / deadlock / lock-timeout →
///   `retryable`; row-not-found → `not_found`.
/// - Anything else → `internal`.
pub fn map_err_code(op: &str, err: anyhow::Error) -> CoreError {
    // Typed already: return it untouched.
    let err = match err.downcast::<CoreError>() {
        Ok(core) => return core,
        Err(other) => other,
    };

    // A CoreError buried under context layers keeps its code.
    if let Some(code) = code_of(&err) {
        return wrap(code, op, err);
    }

    if let Some(code) = classify_chain(&err) {
        return wrap(code, op, err);
    }

    wrap(Code::Internal, op, err)
}

fn classify_chain(err: &anyhow::Error) -> Option<Code> {
    for cause in err.chain() {
        if let Some(sql) = cause.downcast_ref::<sqlx::Error>() {
            return Some(classify_sqlx(sql));
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Some(Code::Retryable);
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ) {
                return Some(Code::Retryable);
            }
        }
    }
    None
}

fn classify_sqlx(err: &sqlx::Error) -> Code {
    match err {
        sqlx::Error::RowNotFound => Code::NotFound,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            Code::Retryable
        }
        sqlx::Error::Io(_) => Code::Retryable,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // unique_violation
            Some("23505") => Code::Conflict,
            // foreign_key_violation
            Some("23503") => Code::PreconditionFailed,
            // serialization_failure, deadlock_detected, lock_not_available
            Some("40001") | Some("40P01") | Some("55P03") => Code::Retryable,
            _ => Code::Internal,
        },
        _ => Code::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_error_passes_through_identically() {
        let original = CoreError::new(Code::Conflict, "saga.transition", "optimistic cas lost");
        let mapped = map_err_code("outer.op", anyhow::Error::new(original));
        assert_eq!(mapped.code(), Code::Conflict);
        assert_eq!(mapped.op(), "saga.transition");
        assert_eq!(mapped.message(), "optimistic cas lost");
    }

    #[test]
    fn buried_typed_error_keeps_its_code() {
        let inner = CoreError::new(Code::NotFound, "thread.load", "thread missing");
        let chained = anyhow::Error::new(inner).context("while marking turn failed");
        let mapped = map_err_code("thread.mark_turn_failed", chained);
        assert_eq!(mapped.code(), Code::NotFound);
        assert_eq!(mapped.op(), "thread.mark_turn_failed");
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = anyhow::Error::new(sqlx::Error::RowNotFound).context("fetch turn");
        assert_eq!(map_err_code("op", err).code(), Code::NotFound);
    }

    #[test]
    fn io_timeout_maps_to_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded");
        assert_eq!(
            map_err_code("op", anyhow::Error::new(io)).code(),
            Code::Retryable
        );
    }

    #[test]
    fn unknown_error_maps_to_internal() {
        let mapped = map_err_code("op", anyhow::anyhow!("something odd"));
        assert_eq!(mapped.code(), Code::Internal);
        assert_eq!(mapped.message(), "something odd");
    }

    #[test]
    fn is_code_walks_the_chain() {
        let err = anyhow::Error::new(CoreError::new(Code::Validation, "enqueue", "bad payload"))
            .context("outer");
        assert!(is_code(&err, Code::Validation));
        assert!(!is_code(&err, Code::Conflict));
        assert_eq!(code_of(&err), Some(Code::Validation));
    }

    #[test]
    fn code_round_trips_strings() {
        for code in [
            Code::Validation,
            Code::NotFound,
            Code::Conflict,
            Code::InvariantViolation,
            Code::PreconditionFailed,
            Code::Retryable,
            Code::Internal,
        ] {
            assert_eq!(Code::parse(code.as_str()), Some(code));
        }
        assert_eq!(Code::parse("nope"), None);
    }

    #[test]
    fn code_serializes_snake_case() {
        let s = serde_json::to_string(&Code::InvariantViolation).unwrap();
        assert_eq!(s, r#""invariant_violation""#);
    }
}
