//! Retry policy evaluation.
//!
//! Rules are checked top to bottom against a context exposing `outcome`;
//! the first rule whose `when` holds decides. With no match an `ok` outcome
//! continues and an `error` outcome fails, so retries only happen when a rule
//! asks for them. Decisions are data; evaluation never errors.

use std::sync::Arc;
use std::time::Duration;

use noetl_tools::Outcome;
use serde::{Deserialize, Serialize};

use crate::playbook::{Backoff, PolicyAction, PolicyRule, MAX_RETRY_DELAY_SECS};
use crate::template::{RenderContext, TemplateRenderer};

/// What to do with a task outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: PolicyAction,
    /// Total attempts allowed by the matched retry rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    pub backoff: Backoff,
    /// Base delay in seconds.
    pub delay: f64,
    /// Index of the matched rule, `None` for the default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
}

impl Decision {
    fn default_for(outcome: &Outcome) -> Self {
        Self {
            action: if outcome.is_ok() {
                PolicyAction::Continue
            } else {
                PolicyAction::Fail
            },
            attempts: None,
            backoff: Backoff::None,
            delay: 0.0,
            rule_index: None,
        }
    }

    /// Attempts left after `made` attempts; zero unless the action is retry.
    pub fn attempts_remaining(&self, made: u32) -> u32 {
        match (self.action, self.attempts) {
            (PolicyAction::Retry, Some(ceiling)) => ceiling.saturating_sub(made),
            _ => 0,
        }
    }

    /// Whether another attempt is allowed after `made` attempts.
    pub fn allows_retry(&self, made: u32) -> bool {
        self.attempts_remaining(made) > 0
    }

    /// Wait before retry number `n` (1-based), capped at
    /// [`MAX_RETRY_DELAY_SECS`].
    pub fn delay_for_retry(&self, n: u32) -> Duration {
        let n = n.max(1);
        let secs = match self.backoff {
            Backoff::None => 0.0,
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay * f64::from(n),
            Backoff::Exponential => {
                let exp = i32::try_from(n - 1).unwrap_or(i32::MAX);
                self.delay * 2f64.powi(exp)
            }
        };
        bounded_delay(secs)
    }
}

/// Seconds to a wait in `[0, MAX_RETRY_DELAY_SECS]`; NaN waits nothing.
pub fn bounded_delay(secs: f64) -> Duration {
    let max = Duration::from_secs_f64(MAX_RETRY_DELAY_SECS);
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs.min(MAX_RETRY_DELAY_SECS)).unwrap_or(max)
}

/// Evaluates policy rules against outcomes.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    renderer: Arc<TemplateRenderer>,
}

impl PolicyEvaluator {
    pub fn new(renderer: Arc<TemplateRenderer>) -> Self {
        Self { renderer }
    }

    /// Decide what to do with `outcome`.
    pub fn evaluate(&self, outcome: &Outcome, rules: &[PolicyRule], context: &RenderContext) -> Decision {
        let mut ctx = context.clone();
        ctx.insert(
            "outcome".to_string(),
            serde_json::to_value(outcome).unwrap_or_default(),
        );
        ctx.insert("attempt".to_string(), serde_json::json!(outcome.meta.attempt));

        for (index, rule) in rules.iter().enumerate() {
            let matched = match &rule.when {
                None => true,
                Some(when) => match self.renderer.evaluate_condition(when, &ctx) {
                    Ok(matched) => matched,
                    Err(e) => {
                        tracing::warn!(rule = index, when = %when, error = %e, "Skipping policy rule");
                        false
                    }
                },
            };

            if matched {
                return Decision {
                    action: rule.then.action,
                    attempts: rule.then.attempts,
                    backoff: rule.then.backoff,
                    delay: rule.then.delay,
                    rule_index: Some(index),
                };
            }
        }

        Decision::default_for(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::normalize;
    use noetl_tools::{ErrorInfo, ErrorKind};
    use serde_json::json;

    fn evaluator() -> PolicyEvaluator {
        PolicyEvaluator::new(Arc::new(TemplateRenderer::new()))
    }

    fn rules(policy: serde_json::Value) -> Vec<PolicyRule> {
        normalize(&json!({"step": "s", "tool": "noop", "policy": policy}))
            .unwrap()
            .policy
    }

    fn http_error(status: u16) -> Outcome {
        Outcome::error(ErrorInfo::http(status, format!("HTTP {}", status)))
    }

    fn rate_limit_policy() -> Vec<PolicyRule> {
        rules(json!([
            {
                "when": "outcome.status=='error' and outcome.error.http.status==429",
                "then": {"do": "retry", "attempts": 2}
            },
            {"when": "outcome.status=='error'", "then": {"do": "fail"}}
        ]))
    }

    #[test]
    fn test_defaults_without_rules() {
        let e = evaluator();
        let ctx = RenderContext::new();
        assert_eq!(
            e.evaluate(&Outcome::ok(json!(1)), &[], &ctx).action,
            PolicyAction::Continue
        );
        let decision = e.evaluate(&http_error(503), &[], &ctx);
        assert_eq!(decision.action, PolicyAction::Fail);
        assert!(!decision.allows_retry(1));
    }

    #[test]
    fn test_first_match_wins() {
        let e = evaluator();
        let ctx = RenderContext::new();
        let policy = rate_limit_policy();

        let decision = e.evaluate(&http_error(429), &policy, &ctx);
        assert_eq!(decision.action, PolicyAction::Retry);
        assert_eq!(decision.rule_index, Some(0));
        assert_eq!(decision.attempts_remaining(1), 1);
        assert!(!decision.allows_retry(2));

        let decision = e.evaluate(&http_error(500), &policy, &ctx);
        assert_eq!(decision.action, PolicyAction::Fail);
        assert_eq!(decision.rule_index, Some(1));

        let decision = e.evaluate(&Outcome::ok(json!({})), &policy, &ctx);
        assert_eq!(decision.action, PolicyAction::Continue);
        assert_eq!(decision.rule_index, None);
    }

    #[test]
    fn test_retryable_flag_visible_to_rules() {
        let e = evaluator();
        let policy = rules(json!([
            {"when": "outcome.error.retryable", "then": {"do": "retry"}}
        ]));
        let ctx = RenderContext::new();

        let transient = Outcome::error(ErrorInfo::new(ErrorKind::Timeout, "timed out"));
        assert_eq!(e.evaluate(&transient, &policy, &ctx).action, PolicyAction::Retry);

        let permanent = Outcome::error(ErrorInfo::new(ErrorKind::Validation, "bad input"));
        assert_eq!(e.evaluate(&permanent, &policy, &ctx).action, PolicyAction::Fail);
    }

    #[test]
    fn test_else_rule_and_context() {
        let e = evaluator();
        let policy = rules(json!([
            {"when": "workload.strict", "then": {"do": "fail"}},
            {"else": {"then": {"do": "continue"}}}
        ]));
        let mut ctx = RenderContext::new();
        ctx.insert("workload".to_string(), json!({"strict": false}));

        let decision = e.evaluate(&http_error(500), &policy, &ctx);
        assert_eq!(decision.action, PolicyAction::Continue);
        assert_eq!(decision.rule_index, Some(1));
    }

    #[test]
    fn test_broken_rule_is_skipped() {
        let e = evaluator();
        let policy = rules(json!([
            {"when": "outcome.status ==", "then": {"do": "continue"}},
            {"when": "true", "then": {"do": "retry", "attempts": 4}}
        ]));
        let decision = e.evaluate(&http_error(500), &policy, &RenderContext::new());
        assert_eq!(decision.action, PolicyAction::Retry);
        assert_eq!(decision.attempts, Some(4));
    }

    #[test]
    fn test_backoff_delays() {
        let mut decision = Decision {
            action: PolicyAction::Retry,
            attempts: Some(5),
            backoff: Backoff::Exponential,
            delay: 2.0,
            rule_index: Some(0),
        };
        assert_eq!(decision.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(decision.delay_for_retry(3), Duration::from_secs(8));

        decision.backoff = Backoff::Linear;
        assert_eq!(decision.delay_for_retry(3), Duration::from_secs(6));

        decision.backoff = Backoff::Fixed;
        assert_eq!(decision.delay_for_retry(4), Duration::from_secs(2));

        decision.backoff = Backoff::None;
        assert_eq!(decision.delay_for_retry(4), Duration::ZERO);
    }

    #[test]
    fn test_backoff_delays_are_capped() {
        let cap = Duration::from_secs_f64(MAX_RETRY_DELAY_SECS);
        let mut decision = Decision {
            action: PolicyAction::Retry,
            attempts: Some(u32::MAX),
            backoff: Backoff::Fixed,
            delay: 1e20,
            rule_index: Some(0),
        };
        assert_eq!(decision.delay_for_retry(1), cap);

        decision.backoff = Backoff::Linear;
        assert_eq!(decision.delay_for_retry(u32::MAX), cap);

        decision.delay = 1.0;
        decision.backoff = Backoff::Exponential;
        assert_eq!(decision.delay_for_retry(65), cap);
        assert_eq!(decision.delay_for_retry(u32::MAX), cap);
        assert_eq!(decision.delay_for_retry(2), Duration::from_secs(2));

        decision.delay = f64::NAN;
        assert_eq!(decision.delay_for_retry(3), Duration::ZERO);
    }

    #[test]
    fn test_bounded_delay() {
        assert_eq!(bounded_delay(-5.0), Duration::ZERO);
        assert_eq!(bounded_delay(f64::INFINITY), Duration::from_secs_f64(MAX_RETRY_DELAY_SECS));
        assert_eq!(bounded_delay(1.5), Duration::from_millis(1500));
    }
}
