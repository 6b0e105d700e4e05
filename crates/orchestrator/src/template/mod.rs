//! Template rendering module.
//!
//! Jinja2-style rendering of step arguments, tool configuration, iterator
//! collections, and routing/policy guards. Rendering is a pure function of
//! template and context.

pub mod jinja;

pub use jinja::{contains_template_syntax, context_from_value, RenderContext, TemplateRenderer};
