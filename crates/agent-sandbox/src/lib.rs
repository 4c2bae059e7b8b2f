//! # agent-sandbox
//!
//! Isolation boundary implementations for the agent execution core.
//!
//! ## Variants
//!
//! - **In-process** (default): restricted statement evaluator, cheapest and
//!   weakest isolation
//! - **Embedded**: side-effect-free numeric evaluator
//! - **Container**: one spawned OS process per execution, built from a
//!   configured command vector
//! - **Remote**: micro-VM service behind a JSON contract
//!
//! All variants honor identical timeout, cancellation and teardown contracts,
//! so the agent core never branches on sandbox kind.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_sandbox::SandboxFactory;
//!
//! let factory = SandboxFactory::new()
//!     .with_container(ContainerConfig::new(docker_command));
//! let agent = AgentBuilder::new()
//!     .execution_mode(ExecutionMode::Code)
//!     .sandbox_provider(Arc::new(factory))
//!     .build()?;
//! ```

use async_trait::async_trait;

use agent_core::error::{AgentError, Result};
use agent_core::sandbox::{ResourceLimits, Sandbox, SandboxKind, SandboxProvider};

pub mod container;
pub mod embedded;
pub mod inprocess;
pub mod remote;

pub use container::{ContainerConfig, ContainerSandbox};
pub use embedded::EmbeddedSandbox;
pub use inprocess::InProcessSandbox;
pub use remote::{RemoteConfig, RemoteSandbox};

// Re-export core contracts for convenience
pub use agent_core::sandbox::{SandboxCaps, SandboxOutput};

/// Configurable provider selecting a session variant by [`SandboxKind`].
///
/// The in-process and embedded variants need no configuration; container and
/// remote sessions require theirs up front.
#[derive(Clone, Debug, Default)]
pub struct SandboxFactory {
    container: Option<ContainerConfig>,
    remote: Option<RemoteConfig>,
}

impl SandboxFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(mut self, config: ContainerConfig) -> Self {
        self.container = Some(config);
        self
    }

    pub fn with_remote(mut self, config: RemoteConfig) -> Self {
        self.remote = Some(config);
        self
    }
}

#[async_trait]
impl SandboxProvider for SandboxFactory {
    async fn create_session(
        &self,
        kind: SandboxKind,
        _limits: &ResourceLimits,
    ) -> Result<Box<dyn Sandbox>> {
        match kind {
            SandboxKind::InProcess => Ok(Box::new(InProcessSandbox::new())),
            SandboxKind::Embedded => Ok(Box::new(EmbeddedSandbox::new())),
            SandboxKind::Container => {
                let config = self.container.clone().ok_or_else(|| {
                    AgentError::Config("container sandbox requires a configured command".into())
                })?;
                Ok(Box::new(ContainerSandbox::new(config)))
            }
            SandboxKind::Remote => {
                let config = self.remote.clone().ok_or_else(|| {
                    AgentError::Config("remote sandbox requires a configured endpoint".into())
                })?;
                Ok(Box::new(RemoteSandbox::new(config)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::action::{Action, Directive, PlanDraft};
    use agent_core::capability::{
        CallContext, Capability, CapabilityCall, CapabilityOutput, CapabilitySchema, ParamType,
        ParameterSchema, ReturnKind,
    };
    use agent_core::engine::{EngineResponse, ReasoningEngine, TokenUsage};
    use agent_core::error::ExecError;
    use agent_core::memory::{ExitReason, MemoryLog, Task};
    use agent_core::runner::AgentBuilder;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn factory_selects_the_requested_variant() {
        let factory = SandboxFactory::new();
        let limits = ResourceLimits::default();

        let session = factory
            .create_session(SandboxKind::InProcess, &limits)
            .await
            .unwrap();
        assert!(!session.capabilities().isolate);

        let session = factory
            .create_session(SandboxKind::Embedded, &limits)
            .await
            .unwrap();
        assert!(session.capabilities().isolate);
    }

    #[tokio::test]
    async fn unconfigured_variants_are_rejected() {
        let factory = SandboxFactory::new();
        let limits = ResourceLimits::default();

        assert!(factory
            .create_session(SandboxKind::Container, &limits)
            .await
            .is_err());
        assert!(factory
            .create_session(SandboxKind::Remote, &limits)
            .await
            .is_err());
    }

    /// Engine replaying a fixed directive sequence, for end-to-end wiring.
    struct SequenceEngine {
        directives: Mutex<VecDeque<Directive>>,
    }

    impl SequenceEngine {
        fn new(directives: Vec<Directive>) -> Self {
            Self {
                directives: Mutex::new(directives.into()),
            }
        }
    }

    #[async_trait]
    impl ReasoningEngine for SequenceEngine {
        async fn next_directive(
            &self,
            _memory: &MemoryLog,
            _capabilities: &[CapabilitySchema],
        ) -> agent_core::Result<EngineResponse> {
            let directive = self
                .directives
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Directive::Finish {
                    answer: "sequence exhausted".into(),
                });
            Ok(EngineResponse::new(directive).with_usage(TokenUsage::new(10, 5)))
        }

        async fn draft_plan(
            &self,
            _memory: &MemoryLog,
            _capabilities: &[CapabilitySchema],
        ) -> agent_core::Result<PlanDraft> {
            Ok(PlanDraft::new("evaluate, then answer"))
        }
    }

    struct UpperCapability;

    #[async_trait]
    impl Capability for UpperCapability {
        fn schema(&self) -> CapabilitySchema {
            CapabilitySchema {
                name: "upper".into(),
                description: "Uppercase some text".into(),
                parameters: vec![ParameterSchema::required(
                    "text",
                    ParamType::String,
                    "Text to uppercase",
                )],
                returns: ReturnKind::Text,
            }
        }

        async fn invoke(
            &self,
            call: &CapabilityCall,
            _ctx: &CallContext,
        ) -> std::result::Result<CapabilityOutput, ExecError> {
            let text = call
                .arguments
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Ok(CapabilityOutput::text(text.to_uppercase()))
        }
    }

    #[tokio::test]
    async fn code_agent_runs_fragments_through_the_in_process_sandbox() {
        let engine = SequenceEngine::new(vec![
            Directive::Act {
                rationale: Some("compute and shout".into()),
                action: Action::code("let greeting = upper(\"done: \")\ngreeting + str(6 * 7)"),
            },
            Directive::Finish {
                answer: "finished".into(),
            },
        ]);

        let mut agent = AgentBuilder::new()
            .engine(Arc::new(engine))
            .capability(UpperCapability)
            .execution_mode(agent_core::ExecutionMode::Code)
            .sandbox_provider(Arc::new(SandboxFactory::new()))
            .build()
            .unwrap();

        let final_step = agent.run(Task::new("shout the answer"), true).await;
        assert_eq!(final_step.exit, ExitReason::FinalAnswer);

        let obs = agent.memory().last_observation().unwrap();
        assert_eq!(obs.text, "DONE: 42.0");
    }
}
