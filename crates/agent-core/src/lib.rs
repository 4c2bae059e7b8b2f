//! # agent-core
//!
//! Step-bounded agent execution core: a reasoning/action/observation loop
//! with dual action dispatch, an append-only memory log, sandboxed-execution
//! contracts, and hierarchical multi-agent delegation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         AgentCore                              │
//! │  ┌──────────┐  ┌────────────────┐  ┌────────────────────────┐  │
//! │  │   Step   │  │    Action      │  │  ReasoningEngine       │  │
//! │  │   Loop   │──│    Executor    │  │  (Strategy)            │  │
//! │  └────┬─────┘  └───────┬────────┘  └────────────────────────┘  │
//! │       │          ┌─────┴──────┐                                │
//! │  ┌────┴─────┐  ┌─┴────────┐ ┌─┴─────────┐                      │
//! │  │  Memory  │  │ Registry │ │  Sandbox  │                      │
//! │  │   Log    │  │ (shared) │ │ (session) │                      │
//! │  └──────────┘  └──────────┘ └───────────┘                      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `ReasoningEngine` and `Sandbox` traits keep the concrete completion
//! provider and the concrete isolation boundary pluggable; the loop never
//! branches on either. Managed agents re-enter the same machinery as plain
//! capabilities.

pub mod action;
pub mod capability;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod interrupt;
pub mod memory;
pub mod runner;
pub mod sandbox;

#[cfg(test)]
pub(crate) mod testkit;

pub use action::{Action, Directive, Observation, PlanDraft, NO_OUTPUT_MARKER};
pub use capability::{
    CallContext, Capability, CapabilityCall, CapabilityOutput, CapabilityRegistry,
    CapabilitySchema, ClockCapability, ParamType, ParameterSchema, ReturnKind,
};
pub use delegation::{ManagedAgent, SharedAgent, DEFAULT_MAX_DELEGATION_DEPTH};
pub use engine::{EngineResponse, ReasoningEngine, TokenUsage};
pub use error::{AgentError, ExecError, LimitKind, Result};
pub use event::{EventSink, LoopEvent, LoopState, TracingEventSink};
pub use executor::{ActionExecutor, ExecutionMode, ExecutorConfig};
pub use interrupt::CancelToken;
pub use memory::{
    ActionStep, ExitReason, FinalStep, MemoryLog, MemoryStep, PlanningStep, RetentionPolicy, Role,
    SystemStep, Task, TaskStep, TranscriptEntry,
};
pub use runner::{AgentBuilder, AgentConfig, AgentCore, PlanDecision, PlanningHook, RetryPolicy};
pub use sandbox::{
    ResourceLimits, Sandbox, SandboxCaps, SandboxKind, SandboxOutput, SandboxProvider,
};
