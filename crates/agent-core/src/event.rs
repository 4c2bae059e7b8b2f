//! Observability Events
//!
//! The loop emits one structured event per state transition. The core only
//! produces events; transport to a tracing collector is a consumer concern.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::engine::TokenUsage;

/// Step-loop state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Init,
    Planning,
    Reasoning,
    Dispatching,
    Observing,
    Terminating,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Init => write!(f, "init"),
            LoopState::Planning => write!(f, "planning"),
            LoopState::Reasoning => write!(f, "reasoning"),
            LoopState::Dispatching => write!(f, "dispatching"),
            LoopState::Observing => write!(f, "observing"),
            LoopState::Terminating => write!(f, "terminating"),
        }
    }
}

/// One state transition of the step loop.
#[derive(Clone, Debug, Serialize)]
pub struct LoopEvent {
    pub run_id: Uuid,

    /// Step counter at the time of the transition
    pub step: usize,

    /// The state being left
    pub state: LoopState,

    /// Time spent in that state
    pub duration: Duration,

    /// Token cost attributed to the state, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Consumer of loop events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LoopEvent);
}

/// Default sink: emits every transition as a `tracing` debug event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &LoopEvent) {
        tracing::debug!(
            run = %event.run_id,
            step = event.step,
            state = %event.state,
            duration_ms = event.duration.as_millis() as u64,
            tokens = event.usage.as_ref().map(|u| u.total_tokens),
            "loop transition"
        );
    }
}
