//! Database queries for the NoETL orchestrator.
//!
//! Query functions organized by table. Each takes a connection or
//! transaction so callers decide the atomic boundary.

pub mod event;
pub mod queue;
