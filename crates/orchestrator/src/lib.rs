//! NoETL Orchestrator Library
//!
//! Event-sourced execution core for NoETL playbooks:
//!
//! - **Event log**: append-only, per-execution ordered events with
//!   idempotency keys; the only source of execution state
//! - **Queue**: lease-based work queue with heartbeats, reclaim of expired
//!   leases and delayed redelivery for retries
//! - **Engine**: step normalization, retry policies, iterator fan-out and
//!   routing, folded into a pure event-to-commands reaction
//! - **Workers**: lease items, run tools and report outcomes as events
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: PostgreSQL connectivity, schema, models and queries
//! - [`engine`]: Orchestration decisions
//! - [`error`]: Engine error type and its stable kinds
//! - [`playbook`]: Playbook parsing and step normalization
//! - [`services`]: Event log, queue, catalog and execution driver
//! - [`worker`]: Queue consumer executing tools
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use noetl_orchestrator::services::{ExecutionService, InMemoryCatalog, InMemoryStore};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let catalog = Arc::new(InMemoryCatalog::new());
//! let reference = catalog.register_yaml(yaml).await?;
//! let service = ExecutionService::new(store.clone(), store.clone(), catalog);
//! let execution_id = service.submit(&reference, serde_json::json!({})).await?;
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod playbook;
pub mod result_ext;
pub mod services;
pub mod template;
pub mod worker;


pub use error::{EngineError, EngineResult};
pub use result_ext::ResultExt;
