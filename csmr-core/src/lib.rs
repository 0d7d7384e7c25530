//! # csmr-core
//!
//! Execution core for csmr.
//!
//! This crate provides:
//! - Guard and action expression evaluation
//! - Machine description parsing and model validation
//! - The per-instance interpreter (run-to-completion macro-steps)
//! - Graphviz export of models
//! - Checkpoint records for restart recovery

mod builder;
pub mod checkpoint;
pub mod description;
pub mod dot;
pub mod error;
pub mod event;
pub mod expr;
pub mod interpreter;
pub mod model;
mod parser;
pub mod value;

pub use checkpoint::{Checkpoint, Watermarks};
pub use description::{MachineDescription, StateKind};
pub use dot::to_dot;
pub use error::{CoreError, EvaluationError, FatalInterpreterFault, ValidationError, Violation, ViolationKind};
pub use event::{Channel, Event};
pub use expr::{Expression, ExpressionLanguage, NativeLanguage, Scope};
pub use interpreter::{Effect, Fault, FiredTransition, InvocationRequest, Interpreter, Status, StepReport, TimerRequest};
pub use model::{Configuration, Model, StateId};
pub use value::{Context, ValueType, VariableSchema};
