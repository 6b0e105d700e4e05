//! Database models for the NoETL orchestrator.
//!
//! Domain types plus the SQLx row structs they are loaded from.

pub mod event;
pub mod execution;
pub mod queue;

pub use event::*;
pub use execution::*;
pub use queue::*;
