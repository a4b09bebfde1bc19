//! # Weft core
//!
//! Domain types for the workflow execution substrate: workflow and run
//! documents, the `{{ ... }}` expression language, template interpolation,
//! the per-run variable context, and the failure taxonomy.
//!
//! This crate performs no I/O; everything here is deterministic and
//! testable in isolation.

pub mod context;
pub mod error;
pub mod expr;
pub mod interpolate;
pub mod model;

pub use context::{CredentialMap, RunContext};
pub use error::{ErrorKind, ModuleError, RunError};
pub use expr::{evaluate, ExprError, ExprValue};
pub use interpolate::{evaluate_expression_or_template, interpolate_string, interpolate_value};
pub use model::{
    CredentialKind, CredentialSummary, LoopSpec, OutputDisplay, Run, RunStatus, Step, StepResult,
    StepStatus, Trigger, TriggeredBy, Workflow, WorkflowConfig, WorkflowMetadata, WorkflowStatus,
    DEFAULT_RUN_TIMEOUT_MS,
};
