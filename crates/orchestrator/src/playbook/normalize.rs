//! Step normalizer.
//!
//! Turns an authored step (raw YAML/JSON mapping) into a [`StepDefinition`].
//! Legacy spellings accepted here:
//! - `with` / `params` merged into `args` (explicit `args` keys win)
//! - `loop: {in, iterator, task, save, mode}` rewritten to an iterator step
//! - `save` as an alias of `sink`
//! - `policy: {rules: [...]}` and `{else: {then: ...}}` rules
//! - `case[].then` as a step name or a `[{next: ...}]` list
//!
//! Normalizing the canonical form of a step ([`StepDefinition::to_value`])
//! returns the same step.

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::playbook::types::*;

/// Key reserved for step results.
const RESERVED_DATA_KEY: &str = "data";

/// Default element binding for iterators that do not name one.
const DEFAULT_ELEMENT: &str = "item";

/// Normalize one authored step.
pub fn normalize(raw: &Value) -> EngineResult<StepDefinition> {
    let obj = raw
        .as_object()
        .ok_or_else(|| EngineError::Validation("step must be a mapping".to_string()))?;

    let name = obj
        .get("step")
        .or_else(|| obj.get("name"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| EngineError::Validation("step is missing a name".to_string()))?
        .to_string();

    let invalid = |msg: String| EngineError::Validation(format!("Step '{}': {}", name, msg));

    if name.contains(['[', ']']) {
        return Err(invalid("brackets are reserved for iteration node ids".to_string()));
    }

    if obj.contains_key(RESERVED_DATA_KEY) {
        return Err(invalid(
            "'data' is reserved for step results; use 'args' for inputs".to_string(),
        ));
    }

    let args = merge_args(obj, true).map_err(invalid)?;
    let policy = parse_policy(obj.get("policy")).map_err(invalid)?;
    let next = parse_next(obj.get("next")).map_err(invalid)?;
    let case = parse_case(obj.get("case")).map_err(invalid)?;
    let loop_block = match obj.get("loop") {
        None | Some(Value::Null) => None,
        Some(Value::Object(block)) => Some(block),
        Some(_) => return Err(invalid("'loop' must be a mapping".to_string())),
    };

    let mut sink = obj
        .get("sink")
        .or_else(|| obj.get("save"))
        .filter(|v| !v.is_null())
        .cloned();
    if sink.is_none() {
        sink = loop_block
            .and_then(|l| l.get("save").or_else(|| l.get("sink")))
            .filter(|v| !v.is_null())
            .cloned();
    }

    let step_type = match obj.get("type") {
        Some(Value::String(t)) => match t.trim().to_lowercase().as_str() {
            "task" => StepType::Task,
            "iterator" | "loop" => StepType::Iterator,
            "switch" => StepType::Switch,
            "end" => StepType::End,
            other => return Err(invalid(format!("unknown step type '{}'", other))),
        },
        Some(Value::Null) | None => infer_type(&name, obj, loop_block.is_some()),
        Some(_) => return Err(invalid("'type' must be a string".to_string())),
    };

    let kind = match step_type {
        StepType::Task => {
            let tool = obj
                .get("tool")
                .ok_or_else(|| invalid("task step requires a 'tool'".to_string()))?;
            StepKind::Task(parse_tool(tool).map_err(invalid)?)
        }
        StepType::Iterator => StepKind::Iterator(parse_iterator(obj, loop_block).map_err(invalid)?),
        StepType::Switch => StepKind::Switch,
        StepType::End => StepKind::End,
    };

    Ok(StepDefinition {
        name,
        desc: obj
            .get("desc")
            .or_else(|| obj.get("description"))
            .and_then(Value::as_str)
            .map(str::to_string),
        args,
        policy,
        next,
        case,
        sink,
        kind,
    })
}

/// Normalize every step of a playbook and cross-check the step graph.
pub fn normalize_playbook(playbook: &Playbook) -> EngineResult<NormalizedPlaybook> {
    if playbook.workflow.is_empty() {
        return Err(EngineError::Validation(format!(
            "Playbook '{}' has an empty workflow",
            playbook.name()
        )));
    }

    let steps = playbook
        .workflow
        .iter()
        .map(normalize)
        .collect::<EngineResult<Vec<_>>>()?;

    let mut names = HashSet::new();
    for step in &steps {
        if !names.insert(step.name.as_str()) {
            return Err(EngineError::Validation(format!(
                "Duplicate step name: {}",
                step.name
            )));
        }
    }

    for step in &steps {
        if let Some(target) = step
            .successors()
            .find(|t| *t != END_STEP && !names.contains(t))
        {
            return Err(EngineError::Validation(format!(
                "Step '{}' routes to unknown step '{}'",
                step.name, target
            )));
        }
    }

    let workload = playbook
        .workload
        .clone()
        .unwrap_or_else(|| Value::Object(Map::new()));

    Ok(NormalizedPlaybook::new(
        playbook.metadata.clone(),
        workload,
        steps,
    ))
}

fn infer_type(name: &str, obj: &Map<String, Value>, has_loop: bool) -> StepType {
    if has_loop || obj.contains_key("collection") {
        StepType::Iterator
    } else if obj.contains_key("tool") {
        StepType::Task
    } else if name == END_STEP {
        StepType::End
    } else {
        StepType::Switch
    }
}

/// Merge `params`, then `with`, then `args`, later sources winning.
fn merge_args(obj: &Map<String, Value>, reject_data: bool) -> Result<Map<String, Value>, String> {
    let mut merged = Map::new();
    for key in ["params", "with", "args"] {
        match obj.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                if reject_data && map.contains_key(RESERVED_DATA_KEY) {
                    return Err(format!(
                        "'{}.data' is not allowed; 'data' is reserved for step results",
                        key
                    ));
                }
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Some(_) => return Err(format!("'{}' must be a mapping", key)),
        }
    }
    Ok(merged)
}

fn parse_tool(value: &Value) -> Result<ToolSpec, String> {
    match value {
        Value::String(kind) if !kind.trim().is_empty() => Ok(ToolSpec::new(kind.trim())),
        Value::Object(map) => {
            let kind = map
                .get("kind")
                .and_then(Value::as_str)
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| "tool is missing 'kind'".to_string())?;
            let config = map
                .iter()
                .filter(|(k, _)| k.as_str() != "kind")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(ToolSpec {
                kind: kind.trim().to_string(),
                config,
            })
        }
        _ => Err("tool must be a kind string or a mapping with 'kind'".to_string()),
    }
}

fn parse_task(value: &Value) -> Result<TaskSpec, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "iterator task must be a mapping".to_string())?;
    let tool = obj
        .get("tool")
        .ok_or_else(|| "iterator task requires a 'tool'".to_string())?;
    Ok(TaskSpec {
        tool: parse_tool(tool)?,
        args: merge_args(obj, false)?,
        policy: parse_policy(obj.get("policy"))?,
    })
}

fn parse_mode(value: Option<&Value>) -> Result<Option<IterationMode>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(mode)) => match mode.trim().to_lowercase().as_str() {
            "sequential" => Ok(Some(IterationMode::Sequential)),
            "async" | "parallel" => Ok(Some(IterationMode::Async)),
            other => Err(format!("unknown iteration mode '{}'", other)),
        },
        Some(_) => Err("'mode' must be a string".to_string()),
    }
}

fn parse_iterator(
    obj: &Map<String, Value>,
    loop_block: Option<&Map<String, Value>>,
) -> Result<IteratorSpec, String> {
    let from_loop = |key: &str| loop_block.and_then(|l| l.get(key)).filter(|v| !v.is_null());

    let collection = obj
        .get("collection")
        .filter(|v| !v.is_null())
        .or_else(|| from_loop("in"))
        .or_else(|| from_loop("collection"))
        .cloned()
        .ok_or_else(|| "iterator requires a 'collection' (or 'loop.in')".to_string())?;

    let element = obj
        .get("element")
        .or_else(|| from_loop("iterator"))
        .or_else(|| from_loop("element"))
        .map(|v| {
            v.as_str()
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_string())
                .ok_or_else(|| "'element' must be a non-empty string".to_string())
        })
        .transpose()?
        .unwrap_or_else(|| DEFAULT_ELEMENT.to_string());

    let mode = match parse_mode(obj.get("mode"))? {
        Some(mode) => mode,
        None => {
            let nested = from_loop("spec").and_then(|s| s.get("mode"));
            parse_mode(from_loop("mode").or(nested))?.unwrap_or_default()
        }
    };

    let task = match obj.get("task").filter(|v| !v.is_null()).or_else(|| from_loop("task")) {
        Some(task) => parse_task(task)?,
        None => match obj.get("tool") {
            Some(tool) => TaskSpec {
                tool: parse_tool(tool)?,
                args: Map::new(),
                policy: Vec::new(),
            },
            None => return Err("iterator requires a 'task' or a 'tool'".to_string()),
        },
    };

    Ok(IteratorSpec {
        collection,
        element,
        mode,
        task,
    })
}

fn parse_policy(value: Option<&Value>) -> Result<Vec<PolicyRule>, String> {
    let rules = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(rules)) => rules,
        Some(Value::Object(map)) => match map.get("rules") {
            Some(Value::Array(rules)) => rules,
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(_) => return Err("'policy.rules' must be a list".to_string()),
        },
        Some(_) => return Err("'policy' must be a list of rules".to_string()),
    };

    rules
        .iter()
        .enumerate()
        .map(|(idx, rule)| parse_rule(rule).map_err(|e| format!("policy rule {}: {}", idx, e)))
        .collect()
}

fn parse_rule(value: &Value) -> Result<PolicyRule, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "rule must be a mapping".to_string())?;

    if let Some(fallback) = obj.get("else") {
        let fallback = fallback
            .as_object()
            .ok_or_else(|| "'else' must be a mapping".to_string())?;
        let then = match fallback.get("then") {
            Some(then) => then,
            None => value.get("else").unwrap_or(&Value::Null),
        };
        return Ok(PolicyRule {
            when: None,
            then: parse_then(then)?,
        });
    }

    let when = match obj.get("when") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(_) => return Err("'when' must be a string".to_string()),
    };
    let then = obj
        .get("then")
        .ok_or_else(|| "rule requires 'then'".to_string())?;

    Ok(PolicyRule {
        when,
        then: parse_then(then)?,
    })
}

fn parse_then(value: &Value) -> Result<PolicyThen, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "'then' must be a mapping".to_string())?;
    let action = obj
        .get("do")
        .and_then(Value::as_str)
        .ok_or_else(|| "'then.do' is required".to_string())?;
    let action =
        PolicyAction::parse(action).ok_or_else(|| format!("unknown policy action '{}'", action))?;

    match action {
        PolicyAction::Fail => Ok(PolicyThen::fail()),
        PolicyAction::Continue => Ok(PolicyThen::continue_()),
        PolicyAction::Retry => {
            let attempts = match obj.get("attempts") {
                None | Some(Value::Null) => DEFAULT_RETRY_ATTEMPTS,
                Some(v) => v
                    .as_u64()
                    .filter(|n| *n >= 1 && *n <= u32::MAX as u64)
                    .ok_or_else(|| "'attempts' must be an integer >= 1".to_string())?
                    as u32,
            };
            let backoff = match obj.get("backoff") {
                None | Some(Value::Null) => Backoff::None,
                Some(Value::String(s)) => {
                    Backoff::parse(s).ok_or_else(|| format!("unknown backoff '{}'", s))?
                }
                Some(_) => return Err("'backoff' must be a string".to_string()),
            };
            let delay = match obj.get("delay") {
                None | Some(Value::Null) => DEFAULT_RETRY_DELAY_SECS,
                Some(v) => v
                    .as_f64()
                    .filter(|d| (0.0..=MAX_RETRY_DELAY_SECS).contains(d))
                    .ok_or_else(|| {
                        format!(
                            "'delay' must be a number between 0 and {} seconds",
                            MAX_RETRY_DELAY_SECS
                        )
                    })?,
            };
            Ok(PolicyThen {
                action,
                attempts: Some(attempts),
                backoff,
                delay,
            })
        }
    }
}

fn parse_target(value: &Value) -> Result<NextTarget, String> {
    match value {
        Value::String(step) if !step.trim().is_empty() => Ok(NextTarget::new(step.trim())),
        Value::Object(map) => {
            let step = map
                .get("step")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| "next target requires 'step'".to_string())?;
            let when = match map.get("when") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Bool(b)) => Some(b.to_string()),
                Some(_) => return Err("next 'when' must be a string".to_string()),
            };
            let args = match map.get("args").or_else(|| map.get("with")) {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(args)) => args.clone(),
                Some(_) => return Err("next 'args' must be a mapping".to_string()),
            };
            Ok(NextTarget {
                step: step.trim().to_string(),
                when,
                args,
            })
        }
        _ => Err("next target must be a step name or a mapping".to_string()),
    }
}

fn parse_next(value: Option<&Value>) -> Result<Vec<NextTarget>, String> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(targets)) => targets.iter().map(parse_target).collect(),
        Some(single) => Ok(vec![parse_target(single)?]),
    }
}

fn parse_case_then(value: &Value) -> Result<NextTarget, String> {
    let target = match value {
        Value::Array(items) => {
            let next = items
                .iter()
                .find_map(|item| item.get("next"))
                .ok_or_else(|| "case 'then' list has no 'next' entry".to_string())?;
            parse_next(Some(next))?
                .into_iter()
                .next()
                .ok_or_else(|| "case 'then' has an empty 'next'".to_string())?
        }
        Value::Object(map) if !map.contains_key("step") && map.contains_key("next") => {
            parse_next(map.get("next"))?
                .into_iter()
                .next()
                .ok_or_else(|| "case 'then' has an empty 'next'".to_string())?
        }
        other => parse_target(other)?,
    };
    Ok(NextTarget {
        when: None,
        ..target
    })
}

fn parse_case(value: Option<&Value>) -> Result<Vec<CaseBranch>, String> {
    let branches = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(branches)) => branches,
        Some(_) => return Err("'case' must be a list".to_string()),
    };

    branches
        .iter()
        .enumerate()
        .map(|(idx, branch)| {
            let when = match branch.get("when") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => return Err(format!("case {} requires a 'when' string", idx)),
            };
            let then = branch
                .get("then")
                .ok_or_else(|| format!("case {} requires 'then'", idx))?;
            Ok(CaseBranch {
                when,
                then: parse_case_then(then).map_err(|e| format!("case {}: {}", idx, e))?,
            })
        })
        .collect()
}
