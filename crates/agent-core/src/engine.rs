//! Reasoning Engine Strategy Pattern
//!
//! Defines the boundary contract to the reasoning engine (any text/chat
//! completion provider). The step loop works exclusively through this
//! interface; concrete engines live outside this crate.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::engine::ReasoningEngine;
//!
//! let engine: Arc<dyn ReasoningEngine> = Arc::new(MyEngine::new(config));
//! let response = engine.next_directive(&memory, &schemas).await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::{Directive, PlanDraft};
use crate::capability::CapabilitySchema;
use crate::error::Result;
use crate::memory::MemoryLog;

/// Token usage statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A directive plus the cost of producing it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub directive: Directive,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl EngineResponse {
    pub fn new(directive: Directive) -> Self {
        Self {
            directive,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Strategy trait for reasoning engines.
///
/// Implementations see the full memory log (typically via
/// [`MemoryLog::render_transcript`]) and the schemas of every registered
/// capability. Failure semantics the loop relies on:
///
/// - an unreachable provider is `AgentError::ProviderUnavailable` and is
///   retried with backoff;
/// - output that cannot be parsed into a [`Directive`] is
///   `AgentError::Parse` and is fed back to the engine as an observation,
///   never a fatal abort.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Produce the next directive for the loop.
    async fn next_directive(
        &self,
        memory: &MemoryLog,
        capabilities: &[CapabilitySchema],
    ) -> Result<EngineResponse>;

    /// Produce a high-level plan at the planning cadence.
    async fn draft_plan(
        &self,
        memory: &MemoryLog,
        capabilities: &[CapabilitySchema],
    ) -> Result<PlanDraft>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_totals() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
    }
}
