//! Iterator expansion.
//!
//! An iterator step fans its nested task out over a resolved collection, one
//! iteration node per element. Node ids are derived from the step name and
//! the element index, so expanding the same collection twice yields the same
//! ids and the queue's duplicate-enqueue guard absorbs the repeat.

use serde_json::{Map, Value};

use crate::error::{EngineError, EngineResult};
use crate::playbook::{PolicyRule, StepDefinition, TaskSpec};
use crate::template::{contains_template_syntax, RenderContext, TemplateRenderer};

/// Node id of iteration `index` of `step`.
pub fn child_node_id(step: &str, index: usize) -> String {
    format!("{}[{}]", step, index)
}

/// Most iterations a single iterator step may fan out to.
pub const MAX_ITERATIONS: usize = 100_000;

/// One iteration of an iterator step.
#[derive(Debug, Clone, PartialEq)]
pub struct Iteration {
    pub node_id: String,
    pub index: usize,
    /// Name the element is bound to.
    pub element_name: String,
    pub element: Value,
    pub task: TaskSpec,
    pub policy: Vec<PolicyRule>,
}

impl Iteration {
    /// Context binding for the element.
    pub fn bindings(&self) -> Map<String, Value> {
        let mut bindings = Map::new();
        bindings.insert(self.element_name.clone(), self.element.clone());
        bindings.insert("_index".to_string(), Value::from(self.index));
        bindings
    }
}

/// Expand an iterator step over a resolved collection.
///
/// Yields exactly one iteration per element, in collection order.
pub fn expand(step: &StepDefinition, items: &[Value]) -> EngineResult<Vec<Iteration>> {
    let spec = step.iterator().ok_or_else(|| {
        EngineError::Validation(format!("Step '{}' is not an iterator", step.name))
    })?;
    let policy = step.child_policy().to_vec();

    Ok(items
        .iter()
        .enumerate()
        .map(|(index, element)| Iteration {
            node_id: child_node_id(&step.name, index),
            index,
            element_name: spec.element.clone(),
            element: element.clone(),
            task: spec.task.clone(),
            policy: policy.clone(),
        })
        .collect())
}

/// Evaluate an iterator's `collection` into a list of elements.
///
/// Templates are rendered strictly. A bare string is tried as a JSON array
/// and otherwise evaluated as an expression (`items` means `{{ items }}`).
pub fn resolve_collection(
    renderer: &TemplateRenderer,
    collection: &Value,
    context: &RenderContext,
) -> EngineResult<Vec<Value>> {
    let resolved = match collection {
        Value::String(s) if contains_template_syntax(s) => renderer.render_to_value(s, context)?,
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Array(_)) => parsed,
            _ => renderer.render_to_value(&format!("{{{{ {} }}}}", s.trim()), context)?,
        },
        other => renderer.render_value(other, context)?,
    };
    to_items(resolved)
}

/// Coerce a resolved value into collection elements.
///
/// Collections longer than [`MAX_ITERATIONS`] are rejected.
pub fn to_items(value: Value) -> EngineResult<Vec<Value>> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| serde_json::json!({"key": key, "value": value}))
            .collect(),
        Value::Number(n) => {
            let count = n
                .as_u64()
                .and_then(|c| usize::try_from(c).ok())
                .ok_or_else(|| {
                    EngineError::Validation(format!(
                        "Iterator collection must be a non-negative integer, got {}",
                        n
                    ))
                })?;
            check_count(count)?;
            (0..count).map(Value::from).collect()
        }
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Array(items)) => items,
            _ => {
                return Err(EngineError::Validation(format!(
                    "Iterator collection resolved to a string that is not a JSON list: {}",
                    s
                )))
            }
        },
        other => {
            return Err(EngineError::Validation(format!(
                "Iterator collection must resolve to a list, got {}",
                other
            )))
        }
    };
    check_count(items.len())?;
    Ok(items)
}

fn check_count(count: usize) -> EngineResult<()> {
    if count > MAX_ITERATIONS {
        return Err(EngineError::Validation(format!(
            "Iterator collection has {} elements, at most {} are allowed",
            count, MAX_ITERATIONS
        )));
    }
    Ok(())
}
