//! Sandboxed Runtime Contracts
//!
//! A capability-negotiated isolation boundary with a uniform
//! execute/observe/teardown contract. The step loop and the action executor
//! only ever see these traits; concrete sessions (in-process evaluator,
//! container, remote micro-VM, embedded numeric evaluator) are selected by
//! configuration, so the core never branches on sandbox kind.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::action::Observation;
use crate::capability::{CallContext, CapabilityRegistry};
use crate::error::{ExecError, Result};

/// What a sandbox variant can guarantee.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxCaps {
    /// A fragment cannot observe or mutate state outside its session
    pub isolate: bool,
    /// CPU/operation ceilings are enforced
    pub limit_cpu: bool,
    /// Memory ceilings are enforced
    pub limit_memory: bool,
    /// Network access is denied or confined
    pub limit_network: bool,
    /// Interpreter state survives across execute calls within a session
    pub persist_across_calls: bool,
}

/// Resource ceilings enforced per execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock ceiling for one execute call
    pub wall_clock: Duration,

    /// Interpreter operation-count ceiling
    pub max_ops: u64,

    /// Memory ceiling, where the variant can enforce one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(10),
            max_ops: 100_000,
            max_memory_bytes: None,
        }
    }
}

/// What a fragment produced on its standard output / return channel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxOutput {
    pub stdout: String,

    /// Rendered value of the fragment's final expression, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SandboxOutput {
    /// Fold stdout and return value into one observation; both empty means
    /// the explicit no-output marker.
    pub fn into_observation(self) -> Observation {
        let mut parts = Vec::new();
        let stdout = self.stdout.trim_end();
        if !stdout.is_empty() {
            parts.push(stdout.to_string());
        }
        if let Some(value) = self.value {
            if !value.is_empty() {
                parts.push(value);
            }
        }

        if parts.is_empty() {
            Observation::no_output()
        } else {
            Observation::text(parts.join("\n"))
        }
    }
}

/// Which isolation boundary variant to provision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// In-process restricted evaluator: cheapest, weakest isolation
    InProcess,
    /// Process/filesystem/network isolation via a spawned container
    Container,
    /// Remote micro-VM service: strongest isolation, network round-trip cost
    Remote,
    /// Memory-isolated embedded evaluator for side-effect-free numeric work
    Embedded,
}

/// One isolation boundary instance, exclusively owned by the action executor
/// that created it.
///
/// Contract, regardless of variant:
/// 1. a fragment cannot observe or mutate state outside its session;
/// 2. resource limits produce a distinguishable
///    [`ExecError::ResourceLimitExceeded`] rather than hanging the loop;
/// 3. `teardown` is idempotent and always releases underlying resources,
///    even if `execute` faulted;
/// 4. cancellation via the call context is observable inside `execute`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn capabilities(&self) -> SandboxCaps;

    /// Run one fragment to completion within the given limits. Registered
    /// capabilities are exposed to the fragment where the variant supports
    /// calling back into the host.
    async fn execute(
        &mut self,
        fragment: &str,
        exposed: &CapabilityRegistry,
        limits: &ResourceLimits,
        ctx: &CallContext,
    ) -> std::result::Result<SandboxOutput, ExecError>;

    /// Release underlying resources. Idempotent.
    async fn teardown(&mut self);
}

/// Factory boundary for sandbox sessions.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create_session(
        &self,
        kind: SandboxKind,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn Sandbox>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NO_OUTPUT_MARKER;

    #[test]
    fn output_folds_stdout_and_value() {
        let out = SandboxOutput {
            stdout: "printed\n".into(),
            value: Some("42".into()),
        };
        assert_eq!(out.into_observation().text, "printed\n42");
    }

    #[test]
    fn empty_output_becomes_no_output_marker() {
        let out = SandboxOutput::default();
        assert_eq!(out.into_observation().text, NO_OUTPUT_MARKER);
    }

    #[test]
    fn value_only_output() {
        let out = SandboxOutput {
            stdout: String::new(),
            value: Some("ok".into()),
        };
        assert_eq!(out.into_observation().text, "ok");
    }
}
