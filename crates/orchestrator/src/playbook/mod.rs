//! NoETL Playbook DSL.
//!
//! - Document types and canonical step types
//! - YAML parsing
//! - Step normalization

pub mod normalize;
pub mod parser;
pub mod types;

pub use normalize::{normalize, normalize_playbook};
pub use parser::{parse_playbook, validate_playbook};
pub use types::{
    Backoff, CaseBranch, IterationMode, IteratorSpec, Metadata, NextTarget, NormalizedPlaybook,
    Playbook, PolicyAction, PolicyRule, PolicyThen, StepDefinition, StepKind, StepType, TaskSpec,
    ToolSpec, END_STEP, MAX_RETRY_DELAY_SECS, PLAYBOOK_TOOL, START_STEP,
};
