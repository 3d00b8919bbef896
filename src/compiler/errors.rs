//! # Compiler Errors

use thiserror::Error;

/// Result type for compile passes
pub type CompileResult<T> = Result<T, CompileError>;

/// Compile pass failures
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Compilation failed with {errors} error(s)")]
    Failed { errors: usize },

    #[error("Compiler engine error: {0}")]
    Engine(String),
}

/// Failure to construct a handler from a compiled module
#[derive(Debug, Clone, Error)]
pub enum InstantiationError {
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Can't instantiate {module}: {reason}")]
    Construction { module: String, reason: String },
}
