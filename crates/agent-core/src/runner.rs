//! Step Loop
//!
//! Orchestrates one task end-to-end: requests the next directive from the
//! reasoning engine, forwards actions to the executor, appends every outcome
//! to memory, applies the termination and replanning policy, and produces the
//! final step. The loop is sequential per run; concurrency belongs to callers
//! running independent agents on independent workers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::action::{Directive, PlanDraft};
use crate::capability::{CallContext, Capability, CapabilityRegistry, CapabilitySchema};
use crate::engine::{EngineResponse, ReasoningEngine, TokenUsage};
use crate::error::{AgentError, ExecError, Result};
use crate::event::{EventSink, LoopEvent, LoopState, TracingEventSink};
use crate::executor::{ActionExecutor, ExecutionMode, ExecutorConfig};
use crate::interrupt::CancelToken;
use crate::memory::{
    ActionStep, ExitReason, FinalStep, MemoryLog, MemoryStep, PlanningStep, RetentionPolicy,
    SystemStep, Task, TaskStep,
};
use crate::sandbox::{ResourceLimits, SandboxKind, SandboxProvider};

const DEFAULT_SYSTEM_INSTRUCTIONS: &str = "You solve tasks step by step. \
Each turn, either propose exactly one action using the available capabilities \
and wait for its observation, or finish with your final answer once the task \
is solved. Observations may contain errors you caused; correct yourself and \
continue.";

/// Backoff policy for retryable boundary failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given attempt (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_backoff)
    }
}

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Operating instructions recorded as the run's system step
    pub system_instructions: String,

    /// Maximum action steps before the loop force-terminates
    pub max_steps: usize,

    /// Plan every N steps; `Some(1)` means plan before every step
    pub planning_interval: Option<usize>,

    /// Backoff policy for an unreachable reasoning engine
    pub provider_retry: RetryPolicy,

    /// Consecutive resource-limit failures tolerated before escalating
    pub limit_retries: u32,

    /// Memory retention across multi-turn runs
    pub retention: RetentionPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_instructions: DEFAULT_SYSTEM_INSTRUCTIONS.into(),
            max_steps: 10,
            planning_interval: None,
            provider_retry: RetryPolicy::default(),
            limit_retries: 2,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Human-in-the-loop decision on a freshly recorded planning step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanDecision {
    Approve,
    /// Replace the plan text before the loop resumes
    Edit(String),
    /// Terminate the run as interrupted
    Cancel,
}

/// Synchronous callback invoked at the planning boundary.
#[async_trait]
pub trait PlanningHook: Send + Sync {
    async fn on_planning_step(&self, step: &PlanningStep) -> PlanDecision;
}

enum PlanFlow {
    Continue,
    Interrupt,
    Fatal(String),
}

/// Emits one event per state transition, measuring time spent per state.
struct StateTimer {
    state: LoopState,
    entered: Instant,
}

impl StateTimer {
    fn start() -> Self {
        Self {
            state: LoopState::Init,
            entered: Instant::now(),
        }
    }

    fn advance(
        &mut self,
        next: LoopState,
        sink: &dyn EventSink,
        run_id: Uuid,
        step: usize,
        usage: Option<TokenUsage>,
    ) {
        sink.emit(&LoopEvent {
            run_id,
            step,
            state: self.state,
            duration: self.entered.elapsed(),
            usage,
        });
        self.state = next;
        self.entered = Instant::now();
    }
}

/// The agent execution core.
///
/// Owns its memory log and sandbox session exclusively; shares the capability
/// registry read-only. Construct via [`AgentBuilder`].
pub struct AgentCore {
    id: Uuid,
    engine: Arc<dyn ReasoningEngine>,
    registry: Arc<CapabilityRegistry>,
    executor: ActionExecutor,
    memory: MemoryLog,
    config: AgentConfig,
    planning_hook: Option<Arc<dyn PlanningHook>>,
    sink: Arc<dyn EventSink>,
    cancel: CancelToken,
    depth: usize,
}

impl AgentCore {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn memory(&self) -> &MemoryLog {
        &self.memory
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Clonable handle for interrupting this agent's runs.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// This agent's id plus every agent id transitively reachable through
    /// its registered capabilities.
    pub fn delegate_ids(&self) -> Vec<Uuid> {
        let mut ids = vec![self.id];
        ids.extend(self.registry.delegate_ids());
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Register a capability between runs.
    ///
    /// Rejects cyclic delegation statically: a capability whose transitive
    /// delegate set reaches back to this agent is refused before any run.
    pub fn register_capability(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        if capability.delegate_ids().contains(&self.id) {
            return Err(AgentError::Config(format!(
                "cyclic delegation: capability `{}` reaches back to this agent",
                capability.schema().name
            )));
        }
        Arc::make_mut(&mut self.registry).register_arc(capability);
        Ok(())
    }

    pub(crate) fn adopt_cancel(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub(crate) fn set_delegation_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Run one task to completion.
    ///
    /// Always returns a final step; per-step failures are recorded in memory
    /// and fed back to the reasoning engine rather than surfaced here.
    /// `reset_history` discards prior memory; passing `false` retains it as
    /// leading context for multi-turn continuity.
    pub async fn run(&mut self, task: Task, reset_history: bool) -> FinalStep {
        let run_id = Uuid::new_v4();
        if reset_history {
            self.memory = MemoryLog::new();
        } else {
            self.memory.begin_run();
            let retention = self.config.retention.clone();
            self.memory.prune(&retention);
        }

        tracing::info!(run = %run_id, agent = %self.id, goal = %task.goal, "run started");
        let mut timer = StateTimer::start();
        let schemas = self.registry.schemas();

        if self.memory.is_empty() {
            self.push(MemoryStep::System(SystemStep {
                index: self.memory.next_index(),
                instructions: self.config.system_instructions.clone(),
                created_at: Utc::now(),
            }));
        }
        self.push(MemoryStep::Task(TaskStep {
            index: self.memory.next_index(),
            task,
            created_at: Utc::now(),
        }));

        let mut steps_taken = 0usize;
        let mut limit_strikes = 0u32;
        let mut last_planned: Option<usize> = None;
        let mut stray_plans = 0usize;

        let (answer, exit) = loop {
            if self.cancel.is_cancelled() {
                break (
                    "run interrupted before completion".to_string(),
                    ExitReason::Interrupted,
                );
            }

            if let Some(interval) = self.config.planning_interval {
                if steps_taken % interval == 0 && last_planned != Some(steps_taken) {
                    timer.advance(LoopState::Planning, &*self.sink, run_id, steps_taken, None);
                    last_planned = Some(steps_taken);
                    match self.plan_at_cadence(&schemas).await {
                        PlanFlow::Continue => {}
                        PlanFlow::Interrupt => {
                            break (
                                "run interrupted at the planning boundary".to_string(),
                                ExitReason::Interrupted,
                            );
                        }
                        PlanFlow::Fatal(msg) => break (msg, ExitReason::FatalError),
                    }
                }
            }

            if steps_taken >= self.config.max_steps {
                // Best-effort answer from whatever was observed last.
                let answer = self
                    .memory
                    .last_observation()
                    .map(|obs| obs.text.clone())
                    .unwrap_or_else(|| {
                        "step budget exhausted before any observation".to_string()
                    });
                break (answer, ExitReason::StepBudgetExceeded);
            }

            timer.advance(LoopState::Reasoning, &*self.sink, run_id, steps_taken, None);
            let response = match self.next_directive_with_retry(&schemas).await {
                Ok(response) => response,
                Err(AgentError::Parse(msg)) => {
                    // Unparsable engine output is an observation, not an abort.
                    self.push(MemoryStep::Action(ActionStep {
                        index: self.memory.next_index(),
                        rationale: None,
                        action: None,
                        observation: None,
                        error: Some(ExecError::Validation(msg)),
                        usage: None,
                        duration: Duration::ZERO,
                        started_at: Utc::now(),
                    }));
                    steps_taken += 1;
                    continue;
                }
                Err(err) if self.cancel.is_cancelled() => {
                    tracing::debug!(error = %err, "engine call abandoned on cancellation");
                    break (
                        "run interrupted before completion".to_string(),
                        ExitReason::Interrupted,
                    );
                }
                Err(err) => break (err.to_string(), ExitReason::FatalError),
            };

            let usage = response.usage;
            match response.directive {
                Directive::Finish { answer } => break (answer, ExitReason::FinalAnswer),
                Directive::Plan(draft) => {
                    stray_plans += 1;
                    if stray_plans > self.config.max_steps {
                        break (
                            "reasoning engine produced only planning output".to_string(),
                            ExitReason::FatalError,
                        );
                    }
                    match self.record_plan(draft).await {
                        PlanFlow::Continue => {}
                        PlanFlow::Interrupt => {
                            break (
                                "run interrupted at the planning boundary".to_string(),
                                ExitReason::Interrupted,
                            );
                        }
                        PlanFlow::Fatal(msg) => break (msg, ExitReason::FatalError),
                    }
                }
                Directive::Act { rationale, action } => {
                    stray_plans = 0;
                    timer.advance(
                        LoopState::Dispatching,
                        &*self.sink,
                        run_id,
                        steps_taken,
                        usage.clone(),
                    );

                    let started_at = Utc::now();
                    let started = Instant::now();
                    let ctx = CallContext {
                        depth: self.depth,
                        cancel: self.cancel.clone(),
                    };
                    let result = self.executor.dispatch(&action, &self.registry, &ctx).await;
                    timer.advance(LoopState::Observing, &*self.sink, run_id, steps_taken, None);

                    let (observation, error) = match result {
                        Ok(observation) => (Some(observation), None),
                        Err(err) => (None, Some(err)),
                    };
                    if let Some(err) = &error {
                        if err.is_resource_limit() {
                            limit_strikes += 1;
                        } else {
                            limit_strikes = 0;
                        }
                        tracing::warn!(action = action.label(), error = %err, "dispatch failed");
                    } else {
                        limit_strikes = 0;
                    }
                    let interrupted = matches!(error, Some(ExecError::Interrupted));

                    self.push(MemoryStep::Action(ActionStep {
                        index: self.memory.next_index(),
                        rationale,
                        action: Some(action),
                        observation,
                        error,
                        usage,
                        duration: started.elapsed(),
                        started_at,
                    }));
                    steps_taken += 1;

                    if interrupted {
                        break (
                            "run interrupted during execution".to_string(),
                            ExitReason::Interrupted,
                        );
                    }
                    if limit_strikes > self.config.limit_retries {
                        break (
                            format!(
                                "resource limit exceeded {limit_strikes} consecutive times"
                            ),
                            ExitReason::FatalError,
                        );
                    }
                }
            }
        };

        timer.advance(LoopState::Terminating, &*self.sink, run_id, steps_taken, None);
        self.executor.release().await;

        let final_step = FinalStep {
            index: self.memory.next_index(),
            answer,
            exit,
            created_at: Utc::now(),
        };
        self.push(MemoryStep::Final(final_step.clone()));

        self.sink.emit(&LoopEvent {
            run_id,
            step: steps_taken,
            state: LoopState::Terminating,
            duration: timer.entered.elapsed(),
            usage: None,
        });
        tracing::info!(run = %run_id, exit = %final_step.exit, steps = steps_taken, "run finished");
        final_step
    }

    async fn plan_at_cadence(&mut self, schemas: &[CapabilitySchema]) -> PlanFlow {
        let mut attempt: u32 = 0;
        let draft = loop {
            match self.engine.draft_plan(&self.memory, schemas).await {
                Ok(draft) => break draft,
                Err(err)
                    if err.is_retryable() && attempt < self.config.provider_retry.max_retries =>
                {
                    attempt += 1;
                    tokio::time::sleep(self.config.provider_retry.backoff(attempt)).await;
                }
                Err(AgentError::Parse(msg)) => {
                    // A garbled plan is skippable; acting can proceed without one.
                    tracing::warn!(error = %msg, "discarding unparsable plan");
                    return PlanFlow::Continue;
                }
                Err(err) => return PlanFlow::Fatal(err.to_string()),
            }
        };
        self.record_plan(draft).await
    }

    async fn record_plan(&mut self, draft: PlanDraft) -> PlanFlow {
        let step = PlanningStep {
            index: self.memory.next_index(),
            plan: draft.plan,
            facts: draft.facts,
            edited: false,
            created_at: Utc::now(),
        };
        self.push(MemoryStep::Planning(step.clone()));

        let hook = self.planning_hook.clone();
        if let Some(hook) = hook {
            match hook.on_planning_step(&step).await {
                PlanDecision::Approve => {}
                PlanDecision::Edit(new_plan) => {
                    if let Err(err) = self.memory.amend_last_plan(new_plan) {
                        return PlanFlow::Fatal(err.to_string());
                    }
                }
                PlanDecision::Cancel => return PlanFlow::Interrupt,
            }
        }
        PlanFlow::Continue
    }

    async fn next_directive_with_retry(
        &self,
        schemas: &[CapabilitySchema],
    ) -> Result<EngineResponse> {
        let mut attempt: u32 = 0;
        loop {
            match self.engine.next_directive(&self.memory, schemas).await {
                Ok(response) => return Ok(response),
                Err(err)
                    if err.is_retryable() && attempt < self.config.provider_retry.max_retries =>
                {
                    attempt += 1;
                    let backoff = self.config.provider_retry.backoff(attempt);
                    tracing::warn!(error = %err, attempt, "reasoning engine unavailable, backing off");
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = self.cancel.cancelled() => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn push(&mut self, step: MemoryStep) {
        // Indices come from next_index, so append cannot reject them; surface
        // loudly rather than panic if that ever stops holding.
        if let Err(err) = self.memory.append(step) {
            tracing::error!(error = %err, "memory append rejected");
        }
    }
}

/// Builder for agent configuration
pub struct AgentBuilder {
    id: Uuid,
    engine: Option<Arc<dyn ReasoningEngine>>,
    registry: CapabilityRegistry,
    config: AgentConfig,
    executor_config: ExecutorConfig,
    sandbox_provider: Option<Arc<dyn SandboxProvider>>,
    planning_hook: Option<Arc<dyn PlanningHook>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            engine: None,
            registry: CapabilityRegistry::new(),
            config: AgentConfig::default(),
            executor_config: ExecutorConfig::default(),
            sandbox_provider: None,
            planning_hook: None,
            sink: None,
        }
    }

    pub fn engine(mut self, engine: Arc<dyn ReasoningEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn capability<C: Capability + 'static>(mut self, capability: C) -> Self {
        self.registry.register(capability);
        self
    }

    pub fn capability_arc(mut self, capability: Arc<dyn Capability>) -> Self {
        self.registry.register_arc(capability);
        self
    }

    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn system_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.system_instructions = instructions.into();
        self
    }

    pub fn max_steps(mut self, max: usize) -> Self {
        self.config.max_steps = max;
        self
    }

    pub fn planning_interval(mut self, interval: usize) -> Self {
        self.config.planning_interval = Some(interval);
        self
    }

    pub fn provider_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.provider_retry = policy;
        self
    }

    pub fn limit_retries(mut self, retries: u32) -> Self {
        self.config.limit_retries = retries;
        self
    }

    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.config.retention = policy;
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.executor_config.mode = mode;
        self
    }

    pub fn sandbox_kind(mut self, kind: SandboxKind) -> Self {
        self.executor_config.sandbox_kind = kind;
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.executor_config.limits = limits;
        self
    }

    pub fn allowed_modules(mut self, modules: Vec<String>) -> Self {
        self.executor_config.allowed_modules = modules;
        self
    }

    pub fn sandbox_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.sandbox_provider = Some(provider);
        self
    }

    pub fn planning_hook(mut self, hook: Arc<dyn PlanningHook>) -> Self {
        self.planning_hook = Some(hook);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and construct the agent.
    pub fn build(self) -> Result<AgentCore> {
        let engine = self
            .engine
            .ok_or_else(|| AgentError::Config("reasoning engine is required".into()))?;

        if self.config.max_steps == 0 {
            return Err(AgentError::Config("max_steps must be at least 1".into()));
        }
        if self.config.planning_interval == Some(0) {
            return Err(AgentError::Config(
                "planning interval must be at least 1".into(),
            ));
        }
        if self.executor_config.mode == ExecutionMode::Code && self.sandbox_provider.is_none() {
            return Err(AgentError::Config(
                "code execution requires a sandbox provider".into(),
            ));
        }

        Ok(AgentCore {
            id: self.id,
            engine,
            registry: Arc::new(self.registry),
            executor: ActionExecutor::new(self.executor_config, self.sandbox_provider),
            memory: MemoryLog::new(),
            config: self.config,
            planning_hook: self.planning_hook,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingEventSink)),
            cancel: CancelToken::new(),
            depth: 0,
        })
    }
}
