//! Core error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from the execution core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Fatal(#[from] FatalInterpreterFault),

    #[error("checkpoint for '{instance_id}' was taken with model {expected}, current model is {actual}")]
    ModelVersionMismatch {
        instance_id: String,
        expected: String,
        actual: String,
    },

    #[error("invalid checkpoint for '{instance_id}': {reason}")]
    InvalidCheckpoint { instance_id: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns an error code suitable for status reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Evaluation(_) => "EVALUATION_ERROR",
            CoreError::Fatal(_) => "FATAL_INTERPRETER_FAULT",
            CoreError::ModelVersionMismatch { .. } => "MODEL_VERSION_MISMATCH",
            CoreError::InvalidCheckpoint { .. } => "INVALID_CHECKPOINT",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}

/// Category of a model violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Malformed,
    DuplicateState,
    MissingInitial,
    MultipleInitial,
    InvalidPseudostate,
    InvalidNesting,
    InvalidFinalState,
    UnreachableState,
    UnresolvedTarget,
    AmbiguousTarget,
    InvalidTarget,
    UndeclaredVariable,
    InvalidExpression,
    TypeMismatch,
    AmbiguousTransition,
    ConflictingWrite,
    UnknownReference,
    InvalidInitialValue,
}

/// A single problem found while building a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Where the problem is, e.g. a state path or a transition label.
    pub location: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// A model failed to build. Carries every violation found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    pub model: String,
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Returns true if any violation mentions the given text in its location or message.
    pub fn mentions(&self, text: &str) -> bool {
        self.violations
            .iter()
            .any(|v| v.location.contains(text) || v.message.contains(text))
    }

    /// Returns the violations of the given kind.
    pub fn of_kind(&self, kind: ViolationKind) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.kind == kind)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model '{}' is invalid ({} violation{})",
            self.model,
            self.violations.len(),
            if self.violations.len() == 1 { "" } else { "s" }
        )?;
        for v in &self.violations {
            write!(f, "; {}", v)?;
        }
        Ok(())
    }
}

/// A guard or action expression failed at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvaluationError {
    #[error("undefined variable '{name}' in '{expression}'")]
    UndefinedVariable { expression: String, name: String },

    #[error("type mismatch in '{expression}': {message}")]
    TypeMismatch { expression: String, message: String },

    #[error("arithmetic fault in '{expression}': {message}")]
    Arithmetic { expression: String, message: String },
}

impl EvaluationError {
    /// Returns the source text of the failing expression.
    pub fn expression(&self) -> &str {
        match self {
            EvaluationError::UndefinedVariable { expression, .. }
            | EvaluationError::TypeMismatch { expression, .. }
            | EvaluationError::Arithmetic { expression, .. } => expression,
        }
    }
}

/// Invariant violation in configuration or transition bookkeeping.
///
/// Terminates the instance. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fatal interpreter fault in '{instance_id}': {reason}")]
pub struct FatalInterpreterFault {
    pub instance_id: String,
    pub reason: String,
}
