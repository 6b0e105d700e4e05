//! Execution scope.
//!
//! A [`Scope`] names the unit currently executing, from the job (execution)
//! down to the action (tool call), e.g.
//! `job:12/step:fetch/task:fetch[1]/action:http`. It is carried in event
//! context as a trace id and never stored on its own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Scope level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Job,
    Step,
    Task,
    Action,
}

impl ScopeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Step => "step",
            Self::Task => "task",
            Self::Action => "action",
        }
    }
}

impl FromStr for ScopeLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(Self::Job),
            "step" => Ok(Self::Step),
            "task" => Ok(Self::Task),
            "action" => Ok(Self::Action),
            other => Err(EngineError::Parse(format!("unknown scope level '{}'", other))),
        }
    }
}

/// One level of a scope path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSegment {
    pub level: ScopeLevel,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl fmt::Display for ScopeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level.as_str(), self.name)?;
        if let Some(index) = self.index {
            write!(f, "[{}]", index)?;
        }
        Ok(())
    }
}

/// Hierarchical identity of an executing unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    segments: Vec<ScopeSegment>,
}

impl Scope {
    /// Root scope for an execution.
    pub fn job(execution_id: i64) -> Self {
        Self {
            segments: vec![ScopeSegment {
                level: ScopeLevel::Job,
                name: execution_id.to_string(),
                index: None,
            }],
        }
    }

    fn push(mut self, level: ScopeLevel, name: &str, index: Option<usize>) -> Self {
        self.segments.retain(|s| s.level < level);
        self.segments.push(ScopeSegment {
            level,
            name: name.to_string(),
            index,
        });
        self
    }

    pub fn step(self, name: &str) -> Self {
        self.push(ScopeLevel::Step, name, None)
    }

    pub fn task(self, name: &str, index: Option<usize>) -> Self {
        self.push(ScopeLevel::Task, name, index)
    }

    pub fn action(self, kind: &str) -> Self {
        self.push(ScopeLevel::Action, kind, None)
    }

    pub fn segments(&self) -> &[ScopeSegment] {
        &self.segments
    }

    /// Innermost segment.
    pub fn leaf(&self) -> Option<&ScopeSegment> {
        self.segments.last()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Scope {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        for part in s.split('/').filter(|p| !p.is_empty()) {
            let (level, rest) = part
                .split_once(':')
                .ok_or_else(|| EngineError::Parse(format!("invalid scope segment '{}'", part)))?;
            let (name, index) = match rest.strip_suffix(']').and_then(|r| r.rsplit_once('[')) {
                Some((name, index)) => {
                    let index = index.parse::<usize>().map_err(|_| {
                        EngineError::Parse(format!("invalid scope index in '{}'", part))
                    })?;
                    (name, Some(index))
                }
                None => (rest, None),
            };
            segments.push(ScopeSegment {
                level: level.parse()?,
                name: name.to_string(),
                index,
            });
        }
        Ok(Self { segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_display() {
        let scope = Scope::job(12).step("fetch").task("fetch", Some(1)).action("http");
        assert_eq!(scope.to_string(), "job:12/step:fetch/task:fetch[1]/action:http");
        assert_eq!(scope.leaf().unwrap().level, ScopeLevel::Action);
    }

    #[test]
    fn test_scope_parse() {
        let scope: Scope = "job:12/step:fetch/task:fetch[1]/action:http".parse().unwrap();
        assert_eq!(scope.segments().len(), 4);
        assert_eq!(scope.segments()[2].index, Some(1));
        assert_eq!(scope, Scope::job(12).step("fetch").task("fetch", Some(1)).action("http"));
        assert!("job".parse::<Scope>().is_err());
        assert!("stage:x".parse::<Scope>().is_err());
    }

    #[test]
    fn test_pushing_replaces_deeper_levels() {
        let scope = Scope::job(1).step("a").action("noop").step("b");
        assert_eq!(scope.to_string(), "job:1/step:b");
    }
}
