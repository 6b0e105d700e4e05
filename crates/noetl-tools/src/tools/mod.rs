//! Built-in tool implementations.
//!
//! Real tool plugins (http, postgres, duckdb, ...) live outside the core and
//! are registered by the host process. The only built-in is:
//! - `noop` - Echo its configuration back as the result

mod noop;

pub use self::noop::NoopTool;

use crate::registry::ToolRegistry;

/// Create a tool registry with all built-in tools registered.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(NoopTool::new());

    registry
}
