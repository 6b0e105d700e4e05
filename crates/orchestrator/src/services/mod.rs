//! Service layer for the NoETL orchestrator.
//!
//! The event log and the queue are traits with a Postgres and an in-memory
//! backend; the execution service drives the orchestrator over them.

pub mod catalog;
pub mod event;
pub mod execution;
pub mod memory;
pub mod queue;
pub mod store;

pub use catalog::{DirectoryCatalog, InMemoryCatalog, PlaybookCatalog};
pub use event::{Appended, EventLog};
pub use execution::ExecutionService;
pub use memory::{Clock, InMemoryStore, ManualClock, SystemClock};
pub use queue::QueueManager;
pub use store::PgStore;
