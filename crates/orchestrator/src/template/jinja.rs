//! Jinja2-style template rendering using minijinja.
//!
//! Two environments share one filter set:
//! - the *value* environment uses strict undefined handling, so rendering step
//!   arguments, tool configuration, or iterator collections fails on any
//!   unresolved reference;
//! - the *condition* environment uses chainable undefined handling, so a
//!   guard such as `outcome.error.http.status == 429` is simply false for an
//!   outcome that carries no error.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

/// Template context: top-level variable name to JSON value.
pub type RenderContext = HashMap<String, serde_json::Value>;

/// Template renderer with custom filters.
pub struct TemplateRenderer {
    values: Environment<'static>,
    conditions: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer").finish_non_exhaustive()
    }
}

fn build_environment(undefined: UndefinedBehavior) -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(undefined);

    env.add_filter("b64encode", filter_b64encode);
    env.add_filter("b64decode", filter_b64decode);
    env.add_filter("tojson", filter_tojson);
    env.add_filter("fromjson", filter_fromjson);

    env
}

impl TemplateRenderer {
    /// Create a new template renderer with custom filters.
    pub fn new() -> Self {
        Self {
            values: build_environment(UndefinedBehavior::Strict),
            conditions: build_environment(UndefinedBehavior::Chainable),
        }
    }

    /// Render a template string with the given context.
    pub fn render(&self, template: &str, context: &RenderContext) -> EngineResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }

        let tmpl = self
            .values
            .template_from_str(template)
            .map_err(|e| EngineError::Template(format!("Template parse error: {}", e)))?;

        tmpl.render(Value::from_serialize(context))
            .map_err(|e| EngineError::Template(format!("Template render error: {}", e)))
    }

    /// Render a template and return the result as a JSON value.
    ///
    /// A template that is exactly one `{{ expression }}` evaluates to the
    /// expression's value (lists stay lists, numbers stay numbers). Anything
    /// else renders to a string.
    pub fn render_to_value(
        &self,
        template: &str,
        context: &RenderContext,
    ) -> EngineResult<serde_json::Value> {
        if let Some(expr) = single_expression(template) {
            let value = self
                .values
                .compile_expression(expr)
                .map_err(|e| EngineError::Template(format!("Expression parse error: {}", e)))?
                .eval(Value::from_serialize(context))
                .map_err(|e| EngineError::Template(format!("Expression error: {}", e)))?;

            if value.is_undefined() {
                return Err(EngineError::Template(format!(
                    "Unresolved reference in '{}'",
                    expr
                )));
            }
            return Ok(serde_json::to_value(&value)?);
        }

        self.render(template, context).map(serde_json::Value::String)
    }

    /// Render a nested structure (dict or list) recursively.
    pub fn render_value(
        &self,
        value: &serde_json::Value,
        context: &RenderContext,
    ) -> EngineResult<serde_json::Value> {
        match value {
            serde_json::Value::String(s) => self.render_to_value(s, context),
            serde_json::Value::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    let rendered_key = self.render(k, context)?;
                    let rendered_value = self.render_value(v, context)?;
                    result.insert(rendered_key, rendered_value);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> =
                    arr.iter().map(|v| self.render_value(v, context)).collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Evaluate a condition expression.
    ///
    /// Accepts a bare expression (`outcome.status == 'error'`), a single
    /// wrapped expression (`{{ outcome.status == 'error' }}`), or a mixed
    /// template whose rendered text is `true`/`1`/`yes`.
    pub fn evaluate_condition(&self, condition: &str, context: &RenderContext) -> EngineResult<bool> {
        let trimmed = condition.trim();
        if trimmed.is_empty() {
            return Ok(false);
        }

        let expr = match single_expression(trimmed) {
            Some(expr) => expr,
            None if contains_template_syntax(trimmed) => {
                let rendered = self
                    .conditions
                    .render_str(trimmed, Value::from_serialize(context))
                    .map_err(|e| EngineError::Template(format!("Condition error: {}", e)))?;
                let rendered = rendered.trim().to_lowercase();
                return Ok(matches!(rendered.as_str(), "true" | "1" | "yes"));
            }
            None => trimmed,
        };

        let value = self
            .conditions
            .compile_expression(expr)
            .map_err(|e| EngineError::Template(format!("Condition parse error: {}", e)))?
            .eval(Value::from_serialize(context))
            .map_err(|e| EngineError::Template(format!("Condition error: {}", e)))?;

        Ok(value.is_true())
    }
}

/// Check if a string contains Jinja2 template syntax.
pub fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// Return the inner expression when the whole template is one `{{ ... }}`.
fn single_expression(template: &str) -> Option<&str> {
    let inner = template.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") || inner.contains("{%") {
        return None;
    }
    Some(inner.trim())
}

/// Build a render context from a JSON object. Non-objects yield an empty context.
pub fn context_from_value(value: &serde_json::Value) -> RenderContext {
    match value {
        serde_json::Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => HashMap::new(),
    }
}

fn value_as_text(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

/// Base64 encode filter.
fn filter_b64encode(value: &Value) -> Result<String, Error> {
    Ok(BASE64.encode(value_as_text(value).as_bytes()))
}

/// Base64 decode filter.
fn filter_b64decode(value: &Value) -> Result<String, Error> {
    let decoded = BASE64.decode(value_as_text(value).as_bytes()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64decode error: {}", e),
        )
    })?;
    String::from_utf8(decoded)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("utf8 error: {}", e)))
}

/// JSON encode filter.
fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

/// JSON decode filter.
fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let json_val: serde_json::Value = serde_json::from_str(&value_as_text(value)).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("fromjson error: {}", e),
        )
    })?;
    Ok(Value::from_serialize(&json_val))
}
