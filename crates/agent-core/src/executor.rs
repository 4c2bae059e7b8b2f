//! Action Executor
//!
//! Runs one proposed action to completion and returns a structured
//! observation or failure. Two variants share one contract, selected per
//! agent configuration rather than per call: free-form code fragments routed
//! through the sandbox boundary, and schema-validated structured calls routed
//! through the capability registry. Dispatch failures are returned, never
//! re-raised, so the loop can feed them back to the reasoning engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::{Action, Observation};
use crate::capability::{CallContext, CapabilityCall, CapabilityRegistry, ReturnKind};
use crate::error::ExecError;
use crate::sandbox::{ResourceLimits, Sandbox, SandboxKind, SandboxProvider};

/// Which action variant this agent dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Free-form generated code run inside the sandbox boundary
    Code,
    /// Schema-validated structured capability calls
    StructuredCall,
}

/// Executor configuration, fixed for the lifetime of an agent.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub mode: ExecutionMode,

    /// Sandbox variant provisioned for code dispatch
    pub sandbox_kind: SandboxKind,

    /// Resource ceilings applied to every sandbox execution
    pub limits: ResourceLimits,

    /// Modules a code fragment may reference; anything else is denied
    pub allowed_modules: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::StructuredCall,
            sandbox_kind: SandboxKind::InProcess,
            limits: ResourceLimits::default(),
            allowed_modules: Vec::new(),
        }
    }
}

/// Dispatches actions and exclusively owns the sandbox session it creates.
///
/// The session is provisioned lazily on first code dispatch and must be
/// released via [`ActionExecutor::release`] on every exit path of a run.
pub struct ActionExecutor {
    config: ExecutorConfig,
    provider: Option<Arc<dyn SandboxProvider>>,
    session: Option<Box<dyn Sandbox>>,
}

impl ActionExecutor {
    pub fn new(config: ExecutorConfig, provider: Option<Arc<dyn SandboxProvider>>) -> Self {
        Self {
            config,
            provider,
            session: None,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    /// Run one action to completion.
    pub async fn dispatch(
        &mut self,
        action: &Action,
        registry: &CapabilityRegistry,
        ctx: &CallContext,
    ) -> std::result::Result<Observation, ExecError> {
        if action.is_noop() {
            return Ok(Observation::no_output());
        }

        match (self.config.mode, action) {
            (ExecutionMode::Code, Action::Code { code }) => {
                self.dispatch_code(code, registry, ctx).await
            }
            (ExecutionMode::StructuredCall, Action::Call(call)) => {
                Self::dispatch_call(call, registry, ctx).await
            }
            (ExecutionMode::Code, Action::Call(call)) => Err(ExecError::Validation(format!(
                "this agent dispatches code fragments, not structured calls (got `{}`)",
                call.name
            ))),
            (ExecutionMode::StructuredCall, Action::Code { .. }) => Err(ExecError::Validation(
                "this agent dispatches structured calls, not code fragments".into(),
            )),
        }
    }

    async fn dispatch_code(
        &mut self,
        code: &str,
        registry: &CapabilityRegistry,
        ctx: &CallContext,
    ) -> std::result::Result<Observation, ExecError> {
        for module in referenced_modules(code) {
            if !self.config.allowed_modules.iter().any(|m| m == &module) {
                return Err(ExecError::PermissionDenied(format!(
                    "module `{module}` is not in the allow-list"
                )));
            }
        }

        let limits = self.config.limits.clone();
        let session = self.session_mut(&limits).await?;
        let output = session.execute(code, registry, &limits, ctx).await?;
        Ok(output.into_observation())
    }

    async fn dispatch_call(
        call: &CapabilityCall,
        registry: &CapabilityRegistry,
        ctx: &CallContext,
    ) -> std::result::Result<Observation, ExecError> {
        let capability = registry
            .get(&call.name)
            .ok_or_else(|| ExecError::CapabilityNotFound(call.name.clone()))?;

        capability.validate(call)?;
        let output = capability.invoke(call, ctx).await?;

        // The declared return kind governs observation serialization.
        let observation = match capability.schema().returns {
            ReturnKind::Text => match output.value.as_str() {
                Some(text) => Observation::text(text),
                None => Observation::text(output.value.to_string()),
            },
            ReturnKind::Json => {
                let rendered = serde_json::to_string_pretty(&output.value)
                    .unwrap_or_else(|_| output.value.to_string());
                Observation::text(rendered).with_data(output.value)
            }
            ReturnKind::Number | ReturnKind::Boolean => {
                Observation::text(output.value.to_string())
            }
        };
        Ok(observation)
    }

    async fn session_mut(
        &mut self,
        limits: &ResourceLimits,
    ) -> std::result::Result<&mut Box<dyn Sandbox>, ExecError> {
        if self.session.is_none() {
            let provider = self.provider.as_ref().ok_or_else(|| {
                ExecError::Sandbox("no sandbox provider configured for code dispatch".into())
            })?;
            let session = provider
                .create_session(self.config.sandbox_kind, limits)
                .await
                .map_err(|e| ExecError::Sandbox(e.to_string()))?;
            self.session = Some(session);
        }
        // Session was just ensured above.
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(ExecError::Sandbox("sandbox session unavailable".into())),
        }
    }

    /// Tear down the sandbox session, if one was created. Called on every
    /// exit path of a run; safe to call more than once.
    pub async fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.teardown().await;
        }
    }

    /// Whether a sandbox session is currently held.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }
}

/// Modules referenced by a fragment via `import`/`from`/`use` statements.
fn referenced_modules(code: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for line in code.lines() {
        let line = line.trim();
        let rest = if let Some(rest) = line.strip_prefix("import ") {
            rest
        } else if let Some(rest) = line.strip_prefix("from ") {
            rest
        } else if let Some(rest) = line.strip_prefix("use ") {
            rest
        } else {
            continue;
        };

        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if !name.is_empty() && !modules.contains(&name) {
            modules.push(name);
        }
    }
    modules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NO_OUTPUT_MARKER;
    use crate::interrupt::CancelToken;
    use crate::testkit::{CountingCapability, FakeBehavior, FakeSandboxProvider};
    use std::sync::atomic::Ordering;

    fn ctx() -> CallContext {
        CallContext::root(CancelToken::new())
    }

    fn code_executor(provider: Arc<FakeSandboxProvider>) -> ActionExecutor {
        ActionExecutor::new(
            ExecutorConfig {
                mode: ExecutionMode::Code,
                ..ExecutorConfig::default()
            },
            Some(provider),
        )
    }

    #[tokio::test]
    async fn noop_action_yields_no_output_marker() {
        let mut executor = ActionExecutor::new(ExecutorConfig::default(), None);
        let registry = CapabilityRegistry::new();

        let obs = executor
            .dispatch(&Action::code("  \n"), &registry, &ctx())
            .await
            .unwrap();
        assert_eq!(obs.text, NO_OUTPUT_MARKER);
    }

    #[tokio::test]
    async fn mode_mismatch_is_a_validation_error() {
        let mut executor = ActionExecutor::new(ExecutorConfig::default(), None);
        let registry = CapabilityRegistry::new();

        let err = executor
            .dispatch(&Action::code("1 + 1"), &registry, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
    }

    #[tokio::test]
    async fn validation_failure_never_invokes_the_capability() {
        let counting = CountingCapability::new("lookup");
        let invocations = counting.invocations();

        let mut registry = CapabilityRegistry::new();
        registry.register(counting);

        let mut executor = ActionExecutor::new(ExecutorConfig::default(), None);
        let call = CapabilityCall::new("lookup", [] as [(String, serde_json::Value); 0]);

        let err = executor
            .dispatch(&Action::Call(call), &registry, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_capability_is_distinguished() {
        let mut executor = ActionExecutor::new(ExecutorConfig::default(), None);
        let registry = CapabilityRegistry::new();
        let call =
            CapabilityCall::new("nope", [("q", serde_json::json!("x"))]);

        let err = executor
            .dispatch(&Action::Call(call), &registry, &ctx())
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::CapabilityNotFound("nope".into()));
    }

    #[tokio::test]
    async fn structured_call_serializes_by_return_kind() {
        let counting = CountingCapability::new("lookup");
        let invocations = counting.invocations();

        let mut registry = CapabilityRegistry::new();
        registry.register(counting);

        let mut executor = ActionExecutor::new(ExecutorConfig::default(), None);
        let call = CapabilityCall::new("lookup", [("q", serde_json::json!("rust"))]);

        let obs = executor
            .dispatch(&Action::Call(call), &registry, &ctx())
            .await
            .unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        // Json return kind keeps the structured payload alongside the text.
        assert!(obs.data.is_some());
        assert!(obs.text.contains("rust"));
    }

    #[tokio::test]
    async fn disallowed_module_is_denied_before_the_sandbox_runs() {
        let provider = Arc::new(FakeSandboxProvider::new(FakeBehavior::Succeed("ok".into())));
        let mut executor = code_executor(provider.clone());
        let registry = CapabilityRegistry::new();

        let err = executor
            .dispatch(
                &Action::code("import network\nnetwork.fetch()"),
                &registry,
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::PermissionDenied(_)));
        assert_eq!(provider.sessions_created(), 0);
    }

    #[tokio::test]
    async fn allowed_module_passes_through() {
        let provider = Arc::new(FakeSandboxProvider::new(FakeBehavior::Succeed("ok".into())));
        let mut executor = ActionExecutor::new(
            ExecutorConfig {
                mode: ExecutionMode::Code,
                allowed_modules: vec!["math".into()],
                ..ExecutorConfig::default()
            },
            Some(provider),
        );
        let registry = CapabilityRegistry::new();

        let obs = executor
            .dispatch(&Action::code("import math\nmath.sqrt(4)"), &registry, &ctx())
            .await
            .unwrap();
        assert_eq!(obs.text, "ok");
    }

    #[tokio::test]
    async fn release_tears_down_the_session_exactly_once() {
        let provider = Arc::new(FakeSandboxProvider::new(FakeBehavior::Succeed("ok".into())));
        let teardowns = provider.teardowns();
        let mut executor = code_executor(provider);
        let registry = CapabilityRegistry::new();

        executor
            .dispatch(&Action::code("1 + 1"), &registry, &ctx())
            .await
            .unwrap();
        assert!(executor.has_session());

        executor.release().await;
        executor.release().await;
        assert!(!executor.has_session());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn module_scan_finds_import_variants() {
        let code = "import alpha\nfrom beta import thing\nuse gamma;\nx = 1";
        assert_eq!(referenced_modules(code), vec!["alpha", "beta", "gamma"]);
    }
}
