//! Delegation Layer
//!
//! Exposes an entire agent as a named, described capability invocable by
//! another agent, enabling hierarchical multi-agent composition without
//! collapsing the two loops into one. Cyclic delegation is rejected
//! statically at registration time via transitive delegate-id closures; a
//! recursion-depth ceiling is additionally enforced at invocation as defense
//! in depth.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::capability::{
    CallContext, Capability, CapabilityCall, CapabilityOutput, CapabilitySchema, ParamType,
    ParameterSchema, ReturnKind,
};
use crate::error::{AgentError, ExecError, Result};
use crate::memory::{ExitReason, FinalStep, Task};
use crate::runner::AgentCore;

/// Recursion-depth ceiling applied when no explicit one is configured.
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 8;

/// Clonable handle to an agent whose runs are serialized behind a lock.
///
/// Registration of new capabilities only happens between runs, so the lock is
/// uncontended at that point.
#[derive(Clone)]
pub struct SharedAgent {
    inner: Arc<Mutex<AgentCore>>,
}

impl SharedAgent {
    pub fn new(core: AgentCore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(core)),
        }
    }

    /// Run a task on the underlying agent.
    pub async fn run(&self, task: Task, reset_history: bool) -> FinalStep {
        self.inner.lock().await.run(task, reset_history).await
    }

    /// Register a capability between runs, applying the same static cycle
    /// rejection as [`AgentCore::register_capability`].
    pub fn register_capability(&self, capability: Arc<dyn Capability>) -> Result<()> {
        let mut core = self.inner.try_lock().map_err(|_| {
            AgentError::Config(
                "agent is busy; capabilities can only be registered between runs".into(),
            )
        })?;
        core.register_capability(capability)
    }

    fn delegate_ids(&self) -> Result<Vec<Uuid>> {
        let core = self.inner.try_lock().map_err(|_| {
            AgentError::Config("agent is busy; wrap it as a managed agent between runs".into())
        })?;
        Ok(core.delegate_ids())
    }
}

/// An agent wrapped as a capability with an implicit `task` parameter.
///
/// Invocation runs the managed agent's full step loop and returns its final
/// answer as the observation to the parent loop.
pub struct ManagedAgent {
    name: String,
    description: String,
    reset_history: bool,
    max_depth: usize,
    delegate_ids: Vec<Uuid>,
    agent: SharedAgent,
}

impl ManagedAgent {
    /// Wrap an owned agent. By default each invocation starts from a clean
    /// history.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        core: AgentCore,
    ) -> Self {
        let delegate_ids = core.delegate_ids();
        Self {
            name: name.into(),
            description: description.into(),
            reset_history: true,
            max_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            delegate_ids,
            agent: SharedAgent::new(core),
        }
    }

    /// Wrap an agent that is also reachable elsewhere. Fails while the agent
    /// is running, since the delegate closure must be snapshotted between
    /// runs.
    pub fn from_shared(
        name: impl Into<String>,
        description: impl Into<String>,
        agent: SharedAgent,
    ) -> Result<Self> {
        let delegate_ids = agent.delegate_ids()?;
        Ok(Self {
            name: name.into(),
            description: description.into(),
            reset_history: true,
            max_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            delegate_ids,
            agent,
        })
    }

    /// Retain memory across invocations instead of resetting per task.
    pub fn with_retained_history(mut self) -> Self {
        self.reset_history = false;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Handle to the wrapped agent, e.g. for inspecting memory in tests.
    pub fn shared(&self) -> SharedAgent {
        self.agent.clone()
    }
}

#[async_trait]
impl Capability for ManagedAgent {
    fn schema(&self) -> CapabilitySchema {
        CapabilitySchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: vec![ParameterSchema::required(
                "task",
                ParamType::String,
                "Task text for the managed agent",
            )],
            returns: ReturnKind::Text,
        }
    }

    fn delegate_ids(&self) -> Vec<Uuid> {
        self.delegate_ids.clone()
    }

    async fn invoke(
        &self,
        call: &CapabilityCall,
        ctx: &CallContext,
    ) -> std::result::Result<CapabilityOutput, ExecError> {
        if ctx.depth >= self.max_depth {
            return Err(ExecError::Capability(format!(
                "delegation depth ceiling ({}) reached invoking `{}`",
                self.max_depth, self.name
            )));
        }

        let task_text = call
            .arguments
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExecError::Validation("missing required argument `task`".into()))?;

        tracing::debug!(agent = %self.name, depth = ctx.depth, "delegating task");

        let mut core = self.agent.inner.lock().await;
        core.adopt_cancel(ctx.cancel.clone());
        core.set_delegation_depth(ctx.depth + 1);
        let final_step = core.run(Task::new(task_text), self.reset_history).await;

        match final_step.exit {
            ExitReason::FinalAnswer | ExitReason::StepBudgetExceeded => {
                Ok(CapabilityOutput::text(final_step.answer))
            }
            ExitReason::Interrupted => Err(ExecError::Interrupted),
            ExitReason::FatalError => Err(ExecError::Capability(format!(
                "managed agent `{}` failed: {}",
                self.name, final_step.answer
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, Directive};
    use crate::engine::EngineResponse;
    use crate::interrupt::CancelToken;
    use crate::runner::AgentBuilder;
    use crate::testkit::{ScriptStep, ScriptedEngine};

    fn finishing_agent(answer: &str) -> AgentCore {
        AgentBuilder::new()
            .engine(Arc::new(ScriptedEngine::finishing_with(answer)))
            .build()
            .unwrap()
    }

    fn task_call(name: &str, task: &str) -> CapabilityCall {
        CapabilityCall::new(name, [("task", serde_json::json!(task))])
    }

    #[tokio::test]
    async fn invoking_a_managed_agent_returns_its_final_answer() {
        let managed = ManagedAgent::new("helper", "Answers sub-questions", finishing_agent("sub-answer"));
        let ctx = CallContext::root(CancelToken::new());

        let out = managed
            .invoke(&task_call("helper", "what is up"), &ctx)
            .await
            .unwrap();
        assert_eq!(out.value, serde_json::json!("sub-answer"));
    }

    #[tokio::test]
    async fn parent_loop_sees_the_child_answer_as_observation() {
        let parent_engine = ScriptedEngine::new(vec![
            ScriptStep::Respond(EngineResponse::new(Directive::Act {
                rationale: None,
                action: Action::Call(task_call("helper", "look this up")),
            })),
            ScriptStep::Respond(EngineResponse::new(Directive::Finish {
                answer: "parent done".into(),
            })),
        ]);

        let mut parent = AgentBuilder::new()
            .engine(Arc::new(parent_engine))
            .capability(ManagedAgent::new(
                "helper",
                "Answers sub-questions",
                finishing_agent("child says hi"),
            ))
            .build()
            .unwrap();

        let final_step = parent.run(Task::new("delegate"), true).await;
        assert_eq!(final_step.exit, ExitReason::FinalAnswer);

        let obs = parent.memory().last_observation().unwrap();
        assert_eq!(obs.text, "child says hi");
    }

    #[tokio::test]
    async fn delegation_cycles_are_rejected_at_registration() {
        let a = finishing_agent("a");
        let a_id = a.id();
        let shared_a = SharedAgent::new(a);

        // b manages a.
        let managed_a = ManagedAgent::from_shared("a", "agent a", shared_a.clone()).unwrap();
        assert!(managed_a.delegate_ids().contains(&a_id));

        let b = AgentBuilder::new()
            .engine(Arc::new(ScriptedEngine::finishing_with("b")))
            .capability(managed_a)
            .build()
            .unwrap();
        let shared_b = SharedAgent::new(b);

        // Closing the loop (a manages b manages a) must fail before any run.
        let managed_b = ManagedAgent::from_shared("b", "agent b", shared_b).unwrap();
        let err = shared_a
            .register_capability(Arc::new(managed_b))
            .unwrap_err();
        assert!(err.to_string().contains("cyclic delegation"));
    }

    #[tokio::test]
    async fn self_delegation_is_rejected() {
        let a = finishing_agent("a");
        let shared_a = SharedAgent::new(a);

        let managed_self = ManagedAgent::from_shared("me", "myself", shared_a.clone()).unwrap();
        let err = shared_a
            .register_capability(Arc::new(managed_self))
            .unwrap_err();
        assert!(err.to_string().contains("cyclic delegation"));
    }

    #[tokio::test]
    async fn depth_ceiling_is_enforced_at_invocation() {
        let managed = ManagedAgent::new("helper", "limited", finishing_agent("deep"))
            .with_max_depth(1);

        let shallow = CallContext::root(CancelToken::new());
        assert!(managed
            .invoke(&task_call("helper", "ok"), &shallow)
            .await
            .is_ok());

        let deep = shallow.nested();
        let err = managed
            .invoke(&task_call("helper", "too deep"), &deep)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Capability(_)));
    }

    #[tokio::test]
    async fn cancellation_propagates_to_the_managed_agent() {
        let managed = ManagedAgent::new("helper", "slow", finishing_agent("unused"));

        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = CallContext::root(cancel);

        let err = managed
            .invoke(&task_call("helper", "hurry"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::Interrupted);
    }

    #[tokio::test]
    async fn missing_task_argument_is_a_validation_error() {
        let managed = ManagedAgent::new("helper", "strict", finishing_agent("unused"));
        let ctx = CallContext::root(CancelToken::new());

        let call = CapabilityCall::new("helper", [] as [(String, serde_json::Value); 0]);
        let err = managed.invoke(&call, &ctx).await.unwrap_err();
        assert!(matches!(err, ExecError::Validation(_)));
    }
}
