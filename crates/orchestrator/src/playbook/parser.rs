//! Playbook YAML parser.
//!
//! Parses YAML playbook documents into [`Playbook`] and checks the
//! document-level shape. Step-level validation belongs to the normalizer.

use std::collections::HashSet;

use crate::error::{EngineError, EngineResult};
use crate::playbook::types::Playbook;

const SUPPORTED_API_VERSIONS: [&str; 2] = ["noetl.io/v1", "noetl.io/v2"];

/// Parse a YAML string into a Playbook.
pub fn parse_playbook(yaml_content: &str) -> EngineResult<Playbook> {
    let playbook: Playbook = serde_yaml::from_str(yaml_content)?;

    validate_playbook(&playbook)?;

    Ok(playbook)
}

/// Validate a parsed playbook.
pub fn validate_playbook(playbook: &Playbook) -> EngineResult<()> {
    if let Some(ref version) = playbook.api_version {
        if !SUPPORTED_API_VERSIONS.contains(&version.as_str()) {
            return Err(EngineError::Validation(format!(
                "Unsupported API version: {}. Expected one of {:?}",
                version, SUPPORTED_API_VERSIONS
            )));
        }
    }

    if let Some(ref kind) = playbook.kind {
        if kind != "Playbook" {
            return Err(EngineError::Validation(format!(
                "Invalid kind: {}. Expected Playbook",
                kind
            )));
        }
    }

    if playbook.metadata.name.trim().is_empty() {
        return Err(EngineError::Validation(
            "metadata.name must not be empty".to_string(),
        ));
    }

    if playbook.workflow.is_empty() {
        return Err(EngineError::Validation(
            "Workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_steps = HashSet::new();
    for (idx, step) in playbook.workflow.iter().enumerate() {
        let name = step
            .get("step")
            .or_else(|| step.get("name"))
            .and_then(|s| s.as_str())
            .ok_or_else(|| {
                EngineError::Validation(format!("workflow[{}] is missing a step name", idx))
            })?;

        if !seen_steps.insert(name) {
            return Err(EngineError::Validation(format!(
                "Duplicate step name: {}",
                name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_playbook() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: test_playbook
  path: test/playbook
workload:
  items: [a, b]
workflow:
  - step: start
    tool:
      kind: noop
    next:
      - step: end
  - step: end
"#;

        let playbook = parse_playbook(yaml).unwrap();
        assert_eq!(playbook.name(), "test_playbook");
        assert_eq!(playbook.reference(), "test/playbook");
        assert_eq!(playbook.workflow.len(), 2);
        assert_eq!(playbook.workload.unwrap()["items"][1], "b");
    }

    #[test]
    fn test_header_is_optional() {
        let yaml = r#"
metadata:
  name: bare
workflow:
  - step: only
    tool: noop
"#;
        let playbook = parse_playbook(yaml).unwrap();
        assert_eq!(playbook.reference(), "bare");
        assert!(playbook.api_version.is_none());
    }

    #[test]
    fn test_invalid_api_version() {
        let yaml = r#"
apiVersion: noetl.io/v9
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
"#;
        let result = parse_playbook(yaml);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_invalid_kind() {
        let yaml = r#"
kind: Workbook
metadata:
  name: test
workflow:
  - step: start
"#;
        assert!(parse_playbook(yaml).is_err());
    }

    #[test]
    fn test_duplicate_and_unnamed_steps() {
        let yaml = r#"
metadata:
  name: test
workflow:
  - step: a
  - step: a
"#;
        assert!(parse_playbook(yaml).is_err());

        let yaml = r#"
metadata:
  name: test
workflow:
  - tool: noop
"#;
        assert!(parse_playbook(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let result = parse_playbook("metadata: [unclosed");
        assert!(matches!(result, Err(EngineError::Parse(_))));
    }
}
