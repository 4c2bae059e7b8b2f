//! Embedded Numeric Evaluator
//!
//! Memory-isolated sandbox for lightweight, side-effect-free numeric
//! fragments. Each non-empty line is one arithmetic expression over
//! `+ - * / ^` and parentheses; the last line's value is the fragment's
//! result. No capabilities are exposed and nothing can escape the
//! evaluation, which makes this the right variant for pure calculation
//! steps where even an interpreter is more surface than needed.

use async_trait::async_trait;

use agent_core::capability::{CallContext, CapabilityRegistry};
use agent_core::error::{ExecError, LimitKind};
use agent_core::sandbox::{ResourceLimits, Sandbox, SandboxCaps, SandboxOutput};

const ALLOWED_CHARS: &str = "0123456789+-*/^(). \teE";

/// Evaluate one arithmetic expression, charging every recursion against the
/// op budget.
fn evaluate(expr: &str, ops: &mut u64, max_ops: u64) -> Result<f64, ExecError> {
    *ops += 1;
    if *ops > max_ops {
        return Err(ExecError::ResourceLimitExceeded {
            kind: LimitKind::OpCount,
        });
    }

    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ExecError::Validation("empty expression".into()));
    }
    if expr.chars().any(char::is_whitespace) {
        let cleaned: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        return evaluate(&cleaned, ops, max_ops);
    }

    // Innermost parentheses first.
    if let Some(start) = expr.rfind('(') {
        let Some(end) = expr[start..].find(')') else {
            return Err(ExecError::Validation("unbalanced parentheses".into()));
        };
        let inner = evaluate(&expr[start + 1..start + end], ops, max_ops)?;
        let rewritten = format!("{}{}{}", &expr[..start], inner, &expr[start + end + 1..]);
        return evaluate(&rewritten, ops, max_ops);
    }
    if expr.contains(')') {
        return Err(ExecError::Validation("unbalanced parentheses".into()));
    }

    // Addition/subtraction bind loosest, so split on the rightmost one that
    // is not a unary sign or an exponent marker.
    for (i, c) in expr.char_indices().rev() {
        if i > 0 && (c == '+' || c == '-') {
            let prev = expr[..i].chars().next_back().unwrap_or(' ');
            if prev.is_ascii_digit() || prev == '.' {
                let left = evaluate(&expr[..i], ops, max_ops)?;
                let right = evaluate(&expr[i + 1..], ops, max_ops)?;
                return Ok(if c == '+' { left + right } else { left - right });
            }
        }
    }

    // Multiplication/division.
    for (i, c) in expr.char_indices().rev() {
        if c == '*' || c == '/' {
            let left = evaluate(&expr[..i], ops, max_ops)?;
            let right = evaluate(&expr[i + 1..], ops, max_ops)?;
            if c == '/' {
                if right == 0.0 {
                    return Err(ExecError::Sandbox("division by zero".into()));
                }
                return Ok(left / right);
            }
            return Ok(left * right);
        }
    }

    // Power.
    if let Some(i) = expr.find('^') {
        let left = evaluate(&expr[..i], ops, max_ops)?;
        let right = evaluate(&expr[i + 1..], ops, max_ops)?;
        return Ok(left.powf(right));
    }

    expr.parse::<f64>()
        .map_err(|_| ExecError::Validation(format!("not a number: `{expr}`")))
}

/// Embedded numeric evaluator session.
pub struct EmbeddedSandbox {
    torn_down: bool,
}

impl EmbeddedSandbox {
    pub fn new() -> Self {
        Self { torn_down: false }
    }
}

impl Default for EmbeddedSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for EmbeddedSandbox {
    fn capabilities(&self) -> SandboxCaps {
        SandboxCaps {
            isolate: true,
            limit_cpu: true,
            limit_memory: true,
            limit_network: true,
            persist_across_calls: false,
        }
    }

    async fn execute(
        &mut self,
        fragment: &str,
        _exposed: &CapabilityRegistry,
        limits: &ResourceLimits,
        ctx: &CallContext,
    ) -> Result<SandboxOutput, ExecError> {
        if self.torn_down {
            return Err(ExecError::Sandbox("session already torn down".into()));
        }

        if let Some(bad) = fragment.chars().find(|c| !ALLOWED_CHARS.contains(*c) && *c != '\n') {
            return Err(ExecError::Validation(format!(
                "only numeric expressions are supported (found `{bad}`)"
            )));
        }

        let mut ops = 0u64;
        let mut last = None;
        for line in fragment.lines() {
            if ctx.cancel.is_cancelled() {
                return Err(ExecError::Interrupted);
            }
            if line.trim().is_empty() {
                continue;
            }
            last = Some(evaluate(line, &mut ops, limits.max_ops)?);
        }

        Ok(SandboxOutput {
            stdout: String::new(),
            value: last.map(|v| v.to_string()),
        })
    }

    async fn teardown(&mut self) {
        self.torn_down = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::interrupt::CancelToken;

    fn ctx() -> CallContext {
        CallContext::root(CancelToken::new())
    }

    async fn run(fragment: &str) -> Result<SandboxOutput, ExecError> {
        let mut sandbox = EmbeddedSandbox::new();
        sandbox
            .execute(fragment, &CapabilityRegistry::new(), &ResourceLimits::default(), &ctx())
            .await
    }

    #[tokio::test]
    async fn arithmetic_precedence() {
        assert_eq!(run("2 + 2").await.unwrap().value.as_deref(), Some("4"));
        assert_eq!(run("10 * 5").await.unwrap().value.as_deref(), Some("50"));
        assert_eq!(
            run("(2 + 3) * 4").await.unwrap().value.as_deref(),
            Some("20")
        );
        assert_eq!(run("2 ^ 8").await.unwrap().value.as_deref(), Some("256"));
    }

    #[tokio::test]
    async fn last_line_wins() {
        let out = run("1 + 1\n2 + 2\n3 * 3").await.unwrap();
        assert_eq!(out.value.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn division_by_zero_is_a_sandbox_fault() {
        let err = run("1 / 0").await.unwrap_err();
        assert!(matches!(err, ExecError::Sandbox(_)));
    }

    #[tokio::test]
    async fn non_numeric_fragments_are_rejected() {
        let err = run("open(\"x\")").await.unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
    }

    #[tokio::test]
    async fn op_budget_bounds_deep_expressions() {
        let mut sandbox = EmbeddedSandbox::new();
        let limits = ResourceLimits {
            max_ops: 10,
            ..ResourceLimits::default()
        };
        let long_sum = (0..100).map(|i| i.to_string()).collect::<Vec<_>>().join(" + ");

        let err = sandbox
            .execute(&long_sum, &CapabilityRegistry::new(), &limits, &ctx())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecError::ResourceLimitExceeded {
                kind: LimitKind::OpCount
            }
        );
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let mut sandbox = EmbeddedSandbox::new();
        sandbox.teardown().await;
        sandbox.teardown().await;
        assert!(run("1").await.is_ok());

        let err = sandbox
            .execute("1", &CapabilityRegistry::new(), &ResourceLimits::default(), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Sandbox(_)));
    }
}
