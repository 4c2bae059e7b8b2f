//! Container-Backed Sandbox
//!
//! Process, filesystem and network isolation by handing the fragment to a
//! spawned OS process built from a configured command vector, typically a
//! `docker run --rm -i --network=none …` invocation ending in the in-container
//! interpreter. The fragment is streamed over stdin and stdout becomes the
//! observation; the process is killed on timeout or cancellation. One process
//! is spawned per execution, so no state leaks between fragments.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use agent_core::capability::{CallContext, CapabilityRegistry};
use agent_core::error::{ExecError, LimitKind};
use agent_core::sandbox::{ResourceLimits, Sandbox, SandboxCaps, SandboxOutput};

/// Container sandbox configuration.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Full command vector, e.g.
    /// `["docker", "run", "--rm", "-i", "--network=none", "python:3.12-slim", "python3", "-"]`.
    /// The last element must read the fragment from stdin.
    pub command: Vec<String>,

    /// Extra environment for the spawned process
    pub env: Vec<(String, String)>,

    /// Ship the exposed capability schemas to the container via the
    /// `AGENT_CAPABILITIES` environment variable, for in-container harnesses
    /// that proxy capability calls back to the host
    pub expose_capabilities: bool,
}

impl ContainerConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            env: Vec::new(),
            expose_capabilities: false,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_capability_schemas(mut self) -> Self {
        self.expose_capabilities = true;
        self
    }
}

/// Container-backed sandbox session.
pub struct ContainerSandbox {
    config: ContainerConfig,
    torn_down: bool,
}

impl ContainerSandbox {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            torn_down: false,
        }
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn capabilities(&self) -> SandboxCaps {
        // CPU/memory/network confinement is delegated to flags in the
        // configured command; the wall-clock ceiling is enforced here.
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
        exposed: &CapabilityRegistry,
        limits: &ResourceLimits,
        ctx: &CallContext,
    ) -> Result<SandboxOutput, ExecError> {
        if self.torn_down {
            return Err(ExecError::Sandbox("session already torn down".into()));
        }
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(ExecError::Sandbox("empty container command".into()));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            command.env(key, value);
        }
        if self.config.expose_capabilities {
            let schemas = serde_json::to_string(&exposed.schemas())
                .map_err(|e| ExecError::Sandbox(format!("capability schema export: {e}")))?;
            command.env("AGENT_CAPABILITIES", schemas);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecError::Sandbox(format!("failed to spawn sandbox process: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(fragment.as_bytes())
                .await
                .map_err(|e| ExecError::Sandbox(format!("failed to write fragment: {e}")))?;
            // Dropping stdin closes the pipe so the interpreter sees EOF.
        }

        // kill_on_drop reaps the process on both timeout and cancellation.
        let output = tokio::select! {
            outcome = tokio::time::timeout(limits.wall_clock, child.wait_with_output()) => {
                match outcome {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => {
                        return Err(ExecError::Sandbox(format!("sandbox process failed: {e}")))
                    }
                    Err(_) => {
                        return Err(ExecError::ResourceLimitExceeded {
                            kind: LimitKind::WallClock,
                        })
                    }
                }
            }
            () = ctx.cancel.cancelled() => return Err(ExecError::Interrupted),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let detail = if stderr.is_empty() {
                format!("exit status {}", output.status)
            } else {
                stderr.to_string()
            };
            return Err(ExecError::Sandbox(detail));
        }

        Ok(SandboxOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            value: None,
        })
    }

    async fn teardown(&mut self) {
        // Per-execution processes are reaped by kill_on_drop; nothing else
        // is held between calls.
        self.torn_down = true;
    }
}
