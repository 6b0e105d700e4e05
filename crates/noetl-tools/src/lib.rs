//! NoETL Tool Registry
//!
//! The orchestration core never talks to tool plugins directly. Workers resolve
//! a tool by its `kind` through a [`ToolRegistry`] that is built by the host
//! process and passed in, and every invocation comes back as an [`Outcome`].
//!
//! ## Modules
//!
//! - [`context`]: Per-invocation execution context handed to tools
//! - [`error`]: Tool error type and its mapping onto outcome error descriptors
//! - [`outcome`]: The `ok`/`error` result shape consumed by retry policies
//! - [`registry`]: The `Tool` trait and the capability map
//! - [`tools`]: Built-in tools

pub mod context;
pub mod error;
pub mod outcome;
pub mod registry;
pub mod tools;

pub use context::ExecutionContext;
pub use error::ToolError;
pub use outcome::{ErrorInfo, ErrorKind, HttpInfo, Outcome, OutcomeMeta, OutcomeStatus};
pub use registry::{Tool, ToolConfig, ToolRegistry};
