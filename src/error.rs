//! Error types for compilation and evaluation

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::dtype::Dtype;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Result type for evaluation calls
pub type EvalResult<T> = Result<T, EvalError>;

/// 1-based source position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
}

impl Pos {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Compilation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Syntax error at {pos}: {message}")]
    Syntax { pos: Pos, message: String },

    #[error("Type error at {pos}: {message}")]
    Type { pos: Pos, message: String },

    #[error("Undefined name at {pos}: {name}")]
    Undefined { pos: Pos, name: String },

    #[error("Reduction error at {pos}: {message}")]
    Reduction { pos: Pos, message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
}

/// Result code classes reported to embedders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    Syntax,
    Type,
    InvalidArgument,
}

impl CompileError {
    pub fn syntax(pos: Pos, msg: impl Into<String>) -> Self {
        CompileError::Syntax { pos, message: msg.into() }
    }

    pub fn type_error(pos: Pos, msg: impl Into<String>) -> Self {
        CompileError::Type { pos, message: msg.into() }
    }

    pub fn undefined(pos: Pos, name: impl Into<String>) -> Self {
        CompileError::Undefined { pos, name: name.into() }
    }

    pub fn reduction(pos: Pos, msg: impl Into<String>) -> Self {
        CompileError::Reduction { pos, message: msg.into() }
    }

    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        CompileError::InvalidArgument { message: msg.into() }
    }

    pub fn kind(&self) -> CompileErrorKind {
        match self {
            CompileError::Syntax { .. } => CompileErrorKind::Syntax,
            CompileError::Type { .. }
            | CompileError::Undefined { .. }
            | CompileError::Reduction { .. } => CompileErrorKind::Type,
            CompileError::InvalidArgument { .. } => CompileErrorKind::InvalidArgument,
        }
    }

    pub fn pos(&self) -> Option<Pos> {
        match self {
            CompileError::Syntax { pos, .. }
            | CompileError::Type { pos, .. }
            | CompileError::Undefined { pos, .. }
            | CompileError::Reduction { pos, .. } => Some(*pos),
            CompileError::InvalidArgument { .. } => None,
        }
    }
}

/// Evaluation errors. Every variant belongs to the invalid-argument class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("range() step must not be zero")]
    ZeroStep,

    #[error("while loop exceeded the limit of {limit} iterations")]
    IterationLimit { limit: u64 },

    #[error("kernel finished without reaching a return statement")]
    MissingReturn,

    #[error("local `{name}` used before assignment")]
    Unassigned { name: String },

    #[error("chunk index {index} out of range ({count} chunks)")]
    ChunkOutOfRange { index: u64, count: u64 },

    #[error("block index {index} out of range ({count} blocks per chunk)")]
    BlockOutOfRange { index: u64, count: u64 },

    #[error("expected {expected} input buffers, got {got}")]
    InputCount { expected: usize, got: usize },

    #[error("input `{name}` has dtype {got}, expected {expected}")]
    InputDtype { name: String, expected: Dtype, got: Dtype },

    #[error("string input `{name}` has itemsize {got}, expected {expected}")]
    InputItemsize { name: String, expected: usize, got: usize },

    #[error("output buffer has dtype {got}, expected {expected}")]
    OutputDtype { expected: Dtype, got: Dtype },

    #[error("{what} holds {got} elements, need {needed}")]
    BufferTooSmall { what: String, needed: usize, got: usize },

    #[error("expression was compiled without ND geometry")]
    NotNd,
}

impl EvalError {
    pub fn buffer_too_small(what: impl Into<String>, needed: usize, got: usize) -> Self {
        EvalError::BufferTooSmall { what: what.into(), needed, got }
    }

    /// Input-dependent conditions raised while running the program itself
    /// (as opposed to rejected call arguments)
    pub fn is_runtime_trap(&self) -> bool {
        matches!(
            self,
            EvalError::ZeroStep
                | EvalError::IterationLimit { .. }
                | EvalError::MissingReturn
                | EvalError::Unassigned { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kinds_and_positions() {
        let err = CompileError::syntax(Pos::new(2, 5), "unexpected token");
        assert_eq!(err.kind(), CompileErrorKind::Syntax);
        assert_eq!(err.pos(), Some(Pos::new(2, 5)));
        assert_eq!(err.to_string(), "Syntax error at 2:5: unexpected token");

        let err = CompileError::reduction(Pos::new(1, 5), "nested");
        assert_eq!(err.kind(), CompileErrorKind::Type);
        assert_eq!(CompileError::invalid_arg("x").pos(), None);
    }

    #[test]
    fn test_runtime_traps() {
        assert!(EvalError::ZeroStep.is_runtime_trap());
        assert!(!EvalError::NotNd.is_runtime_trap());
        assert_eq!(
            EvalError::buffer_too_small("output", 8, 4).to_string(),
            "output holds 4 elements, need 8"
        );
    }
}
