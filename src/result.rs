//! Result and error types for code generation.
//!
//! Malformed input IR is a frontend bug and is handled by assertions that
//! carry enough context to diagnose (function name, block id, value id).
//! Only resource-style failures surface as errors: the compilation of a unit
//! either produces a complete object file or nothing.

use thiserror::Error;

/// An error produced while generating code.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// The object writer failed to serialize the compiled unit.
    #[error("object serialization failed: {0}")]
    Object(#[from] object::write::Error),

    /// An IR invariant did not hold.
    ///
    /// Produced by the verifier when it is run explicitly; internal passes
    /// panic instead, since a broken invariant is unrecoverable.
    #[error("verifier: {0}")]
    Verifier(String),

    /// The requested target is not supported by this backend.
    #[error("unsupported target: {0}")]
    Unsupported(String),
}

/// A convenient alias for a `Result` that uses `CodegenError`.
pub type CodegenResult<T> = Result<T, CodegenError>;
