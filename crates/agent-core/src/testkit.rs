//! Shared test fixtures: a scripted reasoning engine, a counting capability,
//! and a fake sandbox whose behavior and teardown count are observable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::action::{Directive, PlanDraft};
use crate::capability::{
    CallContext, Capability, CapabilityCall, CapabilityOutput, CapabilityRegistry,
    CapabilitySchema, ParamType, ParameterSchema, ReturnKind,
};
use crate::engine::{EngineResponse, ReasoningEngine};
use crate::error::{AgentError, ExecError, Result};
use crate::memory::MemoryLog;
use crate::sandbox::{
    ResourceLimits, Sandbox, SandboxCaps, SandboxKind, SandboxOutput, SandboxProvider,
};

/// Capability that records how often it was actually invoked.
pub(crate) struct CountingCapability {
    name: String,
    invocations: Arc<AtomicUsize>,
}

impl CountingCapability {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn invocations(&self) -> Arc<AtomicUsize> {
        self.invocations.clone()
    }
}

#[async_trait]
impl Capability for CountingCapability {
    fn schema(&self) -> CapabilitySchema {
        CapabilitySchema {
            name: self.name.clone(),
            description: "Look something up".into(),
            parameters: vec![ParameterSchema::required(
                "q",
                ParamType::String,
                "Query text",
            )],
            returns: ReturnKind::Json,
        }
    }

    async fn invoke(
        &self,
        call: &CapabilityCall,
        _ctx: &CallContext,
    ) -> std::result::Result<CapabilityOutput, ExecError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let q = call
            .arguments
            .get("q")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(CapabilityOutput::json(serde_json::json!({ "result": q })))
    }
}

/// What a fake sandbox does on execute.
#[derive(Clone, Debug)]
pub(crate) enum FakeBehavior {
    Succeed(String),
    Fail(ExecError),
    /// Block until the call context is cancelled, then report interruption.
    WaitForCancel,
}

pub(crate) struct FakeSandbox {
    behavior: FakeBehavior,
    teardowns: Arc<AtomicUsize>,
    torn_down: bool,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn capabilities(&self) -> SandboxCaps {
        SandboxCaps {
            isolate: true,
            ..SandboxCaps::default()
        }
    }

    async fn execute(
        &mut self,
        _fragment: &str,
        _exposed: &CapabilityRegistry,
        _limits: &ResourceLimits,
        ctx: &CallContext,
    ) -> std::result::Result<SandboxOutput, ExecError> {
        match &self.behavior {
            FakeBehavior::Succeed(out) => Ok(SandboxOutput {
                stdout: out.clone(),
                value: None,
            }),
            FakeBehavior::Fail(err) => Err(err.clone()),
            FakeBehavior::WaitForCancel => {
                ctx.cancel.cancelled().await;
                Err(ExecError::Interrupted)
            }
        }
    }

    async fn teardown(&mut self) {
        if !self.torn_down {
            self.torn_down = true;
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub(crate) struct FakeSandboxProvider {
    behavior: FakeBehavior,
    teardowns: Arc<AtomicUsize>,
    sessions: AtomicUsize,
}

impl FakeSandboxProvider {
    pub(crate) fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            teardowns: Arc::new(AtomicUsize::new(0)),
            sessions: AtomicUsize::new(0),
        }
    }

    pub(crate) fn teardowns(&self) -> Arc<AtomicUsize> {
        self.teardowns.clone()
    }

    pub(crate) fn sessions_created(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for FakeSandboxProvider {
    async fn create_session(
        &self,
        _kind: SandboxKind,
        _limits: &ResourceLimits,
    ) -> Result<Box<dyn Sandbox>> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSandbox {
            behavior: self.behavior.clone(),
            teardowns: self.teardowns.clone(),
            torn_down: false,
        }))
    }
}

/// One scripted engine turn.
#[derive(Clone, Debug)]
pub(crate) enum ScriptStep {
    Respond(EngineResponse),
    Unavailable(String),
    Garbled(String),
}

/// Engine that replays a fixed script, then repeats a fallback directive.
pub(crate) struct ScriptedEngine {
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<Directive>,
    plans: Mutex<VecDeque<PlanDraft>>,
    directive_calls: AtomicUsize,
}

impl ScriptedEngine {
    pub(crate) fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            plans: Mutex::new(VecDeque::new()),
            directive_calls: AtomicUsize::new(0),
        }
    }

    /// Engine that answers immediately with a final answer.
    pub(crate) fn finishing_with(answer: impl Into<String>) -> Self {
        Self::new(vec![ScriptStep::Respond(EngineResponse::new(
            Directive::Finish {
                answer: answer.into(),
            },
        ))])
    }

    /// Engine that never finishes: repeats the given directive forever.
    pub(crate) fn repeating(directive: Directive) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(directive),
            plans: Mutex::new(VecDeque::new()),
            directive_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_fallback(mut self, directive: Directive) -> Self {
        self.fallback = Some(directive);
        self
    }

    pub(crate) fn with_plans(self, plans: Vec<PlanDraft>) -> Self {
        *self.plans.lock().unwrap() = plans.into();
        self
    }

    pub(crate) fn directive_calls(&self) -> usize {
        self.directive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    async fn next_directive(
        &self,
        _memory: &MemoryLog,
        _capabilities: &[CapabilitySchema],
    ) -> Result<EngineResponse> {
        self.directive_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ScriptStep::Respond(response)) => Ok(response),
            Some(ScriptStep::Unavailable(msg)) => Err(AgentError::ProviderUnavailable(msg)),
            Some(ScriptStep::Garbled(msg)) => Err(AgentError::Parse(msg)),
            None => match &self.fallback {
                Some(directive) => Ok(EngineResponse::new(directive.clone())),
                None => Err(AgentError::Provider("script exhausted".into())),
            },
        }
    }

    async fn draft_plan(
        &self,
        _memory: &MemoryLog,
        _capabilities: &[CapabilitySchema],
    ) -> Result<PlanDraft> {
        let next = self.plans.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| PlanDraft::new("proceed step by step")))
    }
}
