//! Transition routing.
//!
//! Resolves the successors of a finished step:
//! - `case` branches are first-match; with no match the step falls back to
//!   its `next` targets, or to the implicit `end` when it has none
//! - `next` targets are all taken, except those whose `when` guard is false
//! - `end` steps have no successors
//!
//! Guards that fail to evaluate count as false and are logged.

use std::sync::Arc;

use crate::playbook::{NextTarget, StepDefinition, StepKind, END_STEP};
use crate::template::{RenderContext, TemplateRenderer};

/// Resolves next-step transitions.
#[derive(Debug, Clone)]
pub struct Router {
    renderer: Arc<TemplateRenderer>,
}

impl Router {
    pub fn new(renderer: Arc<TemplateRenderer>) -> Self {
        Self { renderer }
    }

    /// Successors of a completed step, in declaration order.
    pub fn next(&self, step: &StepDefinition, context: &RenderContext) -> Vec<NextTarget> {
        if matches!(step.kind, StepKind::End) {
            return Vec::new();
        }

        if !step.case.is_empty() {
            if let Some(target) = self.first_case_match(step, context) {
                return vec![target];
            }
            if step.next.is_empty() {
                tracing::debug!(step = %step.name, "No case matched, falling through to end");
                return vec![NextTarget::new(END_STEP)];
            }
        }

        step.next
            .iter()
            .filter(|target| match &target.when {
                None => true,
                Some(when) => self.guard(&step.name, when, context),
            })
            .cloned()
            .collect()
    }

    /// Successor of a failed step: only an explicit `case` match routes
    /// away from a failure.
    pub fn on_failure(&self, step: &StepDefinition, context: &RenderContext) -> Option<NextTarget> {
        self.first_case_match(step, context)
    }

    fn first_case_match(&self, step: &StepDefinition, context: &RenderContext) -> Option<NextTarget> {
        step.case
            .iter()
            .find(|branch| self.guard(&step.name, &branch.when, context))
            .map(|branch| branch.then.clone())
    }

    fn guard(&self, step: &str, when: &str, context: &RenderContext) -> bool {
        match self.renderer.evaluate_condition(when, context) {
            Ok(matched) => matched,
            Err(e) => {
                tracing::warn!(step = %step, when = %when, error = %e, "Routing guard failed to evaluate");
                false
            }
        }
    }
}

/// Whether a target names the implicit terminal step rather than a real one.
pub fn is_virtual_end(target: &str, has_end_step: bool) -> bool {
    target == END_STEP && !has_end_step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::normalize;
    use crate::template::context_from_value;
    use serde_json::json;

    fn router() -> Router {
        Router::new(Arc::new(TemplateRenderer::new()))
    }

    fn steps(targets: &[NextTarget]) -> Vec<&str> {
        targets.iter().map(|t| t.step.as_str()).collect()
    }

    #[test]
    fn test_unconditional_next_verbatim() {
        let step = normalize(&json!({"step": "a", "tool": "noop", "next": ["b", "c"]})).unwrap();
        let targets = router().next(&step, &RenderContext::new());
        assert_eq!(steps(&targets), vec!["b", "c"]);
    }

    #[test]
    fn test_no_successors_terminates() {
        let step = normalize(&json!({"step": "a", "tool": "noop"})).unwrap();
        assert!(router().next(&step, &RenderContext::new()).is_empty());

        let end = normalize(&json!({"step": "end", "next": "a"})).unwrap();
        assert!(router().next(&end, &RenderContext::new()).is_empty());
    }

    #[test]
    fn test_case_first_match_wins() {
        let step = normalize(&json!({
            "step": "route",
            "case": [
                {"when": "{{ result.count > 10 }}", "then": {"step": "big", "args": {"n": 1}}},
                {"when": "{{ result.count > 0 }}", "then": "small"}
            ],
            "next": "fallback"
        }))
        .unwrap();

        let ctx = context_from_value(&json!({"result": {"count": 50}}));
        let targets = router().next(&step, &ctx);
        assert_eq!(steps(&targets), vec!["big"]);
        assert_eq!(targets[0].args.get("n"), Some(&json!(1)));

        let ctx = context_from_value(&json!({"result": {"count": 5}}));
        assert_eq!(steps(&router().next(&step, &ctx)), vec!["small"]);
    }

    #[test]
    fn test_case_fallback_to_next_default() {
        let step = normalize(&json!({
            "step": "route",
            "case": [{"when": "{{ result.count > 0 }}", "then": "small"}],
            "next": "fallback"
        }))
        .unwrap();
        let ctx = context_from_value(&json!({"result": {"count": 0}}));
        assert_eq!(steps(&router().next(&step, &ctx)), vec!["fallback"]);
    }

    #[test]
    fn test_case_fallthrough_to_end_when_no_default() {
        let step = normalize(&json!({
            "step": "route",
            "case": [
                {"when": "{{ result.count > 0 }}", "then": "small"},
                {"when": "{{ result.missing.deep }}", "then": "other"}
            ]
        }))
        .unwrap();
        let ctx = context_from_value(&json!({"result": {"count": 0}}));
        assert_eq!(steps(&router().next(&step, &ctx)), vec![END_STEP]);
    }

    #[test]
    fn test_next_guards_are_inclusive() {
        let step = normalize(&json!({
            "step": "split",
            "next": [
                {"step": "a", "when": "{{ workload.a }}"},
                {"step": "b", "when": "{{ workload.b }}"},
                {"step": "c"}
            ]
        }))
        .unwrap();
        let ctx = context_from_value(&json!({"workload": {"a": true, "b": false}}));
        assert_eq!(steps(&router().next(&step, &ctx)), vec!["a", "c"]);
    }

    #[test]
    fn test_broken_guard_is_false() {
        let step = normalize(&json!({
            "step": "route",
            "case": [{"when": "{{ result ==", "then": "x"}],
            "next": "y"
        }))
        .unwrap();
        assert_eq!(steps(&router().next(&step, &RenderContext::new())), vec!["y"]);
    }

    #[test]
    fn test_on_failure_uses_explicit_case_only() {
        let step = normalize(&json!({
            "step": "fetch",
            "tool": "noop",
            "case": [{"when": "{{ error.kind == 'not_found' }}", "then": "create"}],
            "next": "report"
        }))
        .unwrap();

        let ctx = context_from_value(&json!({"error": {"kind": "not_found"}}));
        assert_eq!(router().on_failure(&step, &ctx).unwrap().step, "create");

        let ctx = context_from_value(&json!({"error": {"kind": "timeout"}}));
        assert!(router().on_failure(&step, &ctx).is_none());
    }

    #[test]
    fn test_virtual_end() {
        assert!(is_virtual_end("end", false));
        assert!(!is_virtual_end("end", true));
        assert!(!is_virtual_end("next", false));
    }
}
