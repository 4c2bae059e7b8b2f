//! Remote Micro-VM Sandbox
//!
//! Strongest isolation at a network round-trip cost: fragments are executed
//! by a remote sandbox service, one session per run. The wire format is a
//! small JSON contract (execute + teardown endpoints); exposed capability
//! schemas travel with every request so the service can surface them to the
//! fragment.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use agent_core::capability::{CallContext, CapabilityRegistry, CapabilitySchema};
use agent_core::error::{ExecError, LimitKind};
use agent_core::sandbox::{ResourceLimits, Sandbox, SandboxCaps, SandboxOutput};

/// Remote sandbox service configuration.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Service base URL, e.g. `https://sandbox.internal:8700`
    pub base_url: String,

    /// Bearer token, if the service requires one
    pub auth_token: Option<String>,

    /// Transport headroom added on top of the fragment's wall-clock limit
    pub request_grace: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            request_grace: Duration::from_secs(5),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    fragment: &'a str,
    limits: &'a ResourceLimits,
    capabilities: Vec<CapabilitySchema>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    limit_exceeded: Option<LimitKind>,
}

/// Remote sandbox session.
pub struct RemoteSandbox {
    client: reqwest::Client,
    config: RemoteConfig,
    session_id: Uuid,
    torn_down: bool,
}

impl RemoteSandbox {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            session_id: Uuid::new_v4(),
            torn_down: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn session_url(&self, suffix: &str) -> String {
        format!(
            "{}/sessions/{}{suffix}",
            self.config.base_url.trim_end_matches('/'),
            self.session_id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Sandbox for RemoteSandbox {
    fn capabilities(&self) -> SandboxCaps {
        SandboxCaps {
            isolate: true,
            limit_cpu: true,
            limit_memory: true,
            limit_network: true,
            persist_across_calls: true,
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

        let body = ExecuteRequest {
            fragment,
            limits,
            capabilities: exposed.schemas(),
        };
        let request = self
            .authorize(self.client.post(self.session_url("/execute")))
            .timeout(limits.wall_clock + self.config.request_grace)
            .json(&body);

        let response = tokio::select! {
            outcome = request.send() => outcome,
            () = ctx.cancel.cancelled() => return Err(ExecError::Interrupted),
        };

        let response = response.map_err(|e| {
            if e.is_timeout() {
                ExecError::ResourceLimitExceeded {
                    kind: LimitKind::WallClock,
                }
            } else {
                ExecError::Sandbox(format!("sandbox service unreachable: {e}"))
            }
        })?;

        if !response.status().is_success() {
            return Err(ExecError::Sandbox(format!(
                "sandbox service returned {}",
                response.status()
            )));
        }

        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| ExecError::Sandbox(format!("malformed sandbox response: {e}")))?;

        if let Some(kind) = parsed.limit_exceeded {
            return Err(ExecError::ResourceLimitExceeded { kind });
        }
        if let Some(error) = parsed.error {
            return Err(ExecError::Sandbox(error));
        }

        Ok(SandboxOutput {
            stdout: parsed.stdout,
            value: parsed.value,
        })
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        // Best effort: the service reaps idle sessions on its own.
        let request = self
            .authorize(self.client.delete(self.session_url("")))
            .timeout(Duration::from_secs(5));
        if let Err(e) = request.send().await {
            tracing::debug!(session = %self.session_id, error = %e, "remote teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::interrupt::CancelToken;

    fn ctx() -> CallContext {
        CallContext::root(CancelToken::new())
    }

    #[test]
    fn session_urls_are_stable() {
        let sandbox = RemoteSandbox::new(RemoteConfig::new("http://svc:8700/"));
        let id = sandbox.session_id();
        assert_eq!(
            sandbox.session_url("/execute"),
            format!("http://svc:8700/sessions/{id}/execute")
        );
    }

    #[test]
    fn limit_responses_map_to_limit_errors() {
        let parsed: ExecuteResponse = serde_json::from_str(
            r#"{"stdout": "", "limit_exceeded": "wall_clock"}"#,
        )
        .unwrap();
        assert_eq!(parsed.limit_exceeded, Some(LimitKind::WallClock));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_sandbox_fault() {
        // Reserved port with nothing listening; connection is refused fast.
        let mut sandbox = RemoteSandbox::new(RemoteConfig::new("http://127.0.0.1:1"));
        let err = sandbox
            .execute("1 + 1", &CapabilityRegistry::new(), &ResourceLimits::default(), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Sandbox(_)));
    }

    #[tokio::test]
    async fn pre_cancelled_context_short_circuits() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut sandbox = RemoteSandbox::new(RemoteConfig::new("http://127.0.0.1:1"));
        let err = sandbox
            .execute(
                "1 + 1",
                &CapabilityRegistry::new(),
                &ResourceLimits::default(),
                &CallContext::root(cancel),
            )
            .await
            .unwrap_err();
        // Either the refused connection or the cancellation may win the race.
        assert!(matches!(
            err,
            ExecError::Interrupted | ExecError::Sandbox(_)
        ));
    }
}
