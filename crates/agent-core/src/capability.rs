//! Capability System
//!
//! Named, schema-described units of external functionality (tools or managed
//! sub-agents) invocable by structured call. Capabilities are registered at
//! agent construction time and the registry is immutable for the duration of
//! a run, so it can be shared read-only across concurrently running agents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ExecError;
use crate::interrupt::CancelToken;

/// Structured invocation request for a registered capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCall {
    /// Capability identifier
    pub name: String,

    /// Arguments as key-value pairs
    pub arguments: HashMap<String, serde_json::Value>,

    /// Optional call ID for tracking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl CapabilityCall {
    pub fn new<I, K>(name: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        Self {
            name: name.into(),
            arguments: arguments
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Raw value produced by a capability, before return-kind serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    pub value: serde_json::Value,
}

impl CapabilityOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::String(text.into()),
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self { value }
    }
}

/// JSON type accepted for a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        }
    }
}

/// Parameter definition for a capability schema
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// Accepted JSON type
    #[serde(rename = "type")]
    pub param_type: ParamType,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
}

impl ParameterSchema {
    pub fn required(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
            enum_values: None,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_enum(mut self, values: Vec<serde_json::Value>) -> Self {
        self.enum_values = Some(values);
        self
    }
}

/// How a capability's return value is serialized into the observation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    #[default]
    Text,
    Json,
    Number,
    Boolean,
}

/// Capability definition schema, shown to the reasoning engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySchema {
    /// Unique capability identifier within a registry
    pub name: String,

    /// Human-readable purpose description
    pub description: String,

    /// Parameter definitions
    pub parameters: Vec<ParameterSchema>,

    /// Return type tag
    #[serde(default)]
    pub returns: ReturnKind,
}

/// Context threaded through every capability invocation.
///
/// Carries the delegation depth (managed sub-agents increment it) and the
/// run's cancellation token.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub depth: usize,
    pub cancel: CancelToken,
}

impl CallContext {
    pub fn root(cancel: CancelToken) -> Self {
        Self { depth: 0, cancel }
    }

    /// Context for a nested invocation, one delegation level down.
    pub fn nested(&self) -> Self {
        Self {
            depth: self.depth + 1,
            cancel: self.cancel.clone(),
        }
    }
}

/// Capability trait - implement to add new invocable functionality
#[async_trait]
pub trait Capability: Send + Sync {
    /// Schema describing the capability to the reasoning engine
    fn schema(&self) -> CapabilitySchema;

    /// Invoke with validated arguments
    async fn invoke(
        &self,
        call: &CapabilityCall,
        ctx: &CallContext,
    ) -> std::result::Result<CapabilityOutput, ExecError>;

    /// Validate argument presence, type and value constraints. Runs before
    /// `invoke`; a failure here means the capability is never invoked.
    fn validate(&self, call: &CapabilityCall) -> std::result::Result<(), ExecError> {
        let schema = self.schema();

        for param in &schema.parameters {
            match call.arguments.get(&param.name) {
                None => {
                    if param.required {
                        return Err(ExecError::Validation(format!(
                            "missing required argument `{}`",
                            param.name
                        )));
                    }
                }
                Some(value) => {
                    if !param.param_type.matches(value) {
                        return Err(ExecError::Validation(format!(
                            "argument `{}` expects type {}, got {}",
                            param.name,
                            param.param_type.name(),
                            json_type_name(value)
                        )));
                    }
                    if let Some(allowed) = &param.enum_values {
                        if !allowed.contains(value) {
                            return Err(ExecError::Validation(format!(
                                "argument `{}` is not one of the allowed values",
                                param.name
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Transitive set of agent ids reachable through this capability.
    ///
    /// Plain tools return nothing; managed-agent capabilities return their
    /// own agent id plus everything their registry delegates to, so cyclic
    /// delegation can be rejected at registration time.
    fn delegate_ids(&self) -> Vec<Uuid> {
        Vec::new()
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Registry for available capabilities
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new capability
    pub fn register<C: Capability + 'static>(&mut self, capability: C) {
        let schema = capability.schema();
        self.capabilities.insert(schema.name, Arc::new(capability));
    }

    /// Register a shared capability
    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let schema = capability.schema();
        self.capabilities.insert(schema.name, capability);
    }

    /// Get a capability by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Validate then invoke a capability call
    pub async fn invoke(
        &self,
        call: &CapabilityCall,
        ctx: &CallContext,
    ) -> std::result::Result<CapabilityOutput, ExecError> {
        let capability = self
            .get(&call.name)
            .ok_or_else(|| ExecError::CapabilityNotFound(call.name.clone()))?;

        capability.validate(call)?;
        capability.invoke(call, ctx).await
    }

    /// All capability schemas, sorted by name for deterministic prompts
    pub fn schemas(&self) -> Vec<CapabilitySchema> {
        let mut schemas: Vec<_> = self.capabilities.values().map(|c| c.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Registered capability names
    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Union of delegate-id closures across registered capabilities.
    pub fn delegate_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .capabilities
            .values()
            .flat_map(|c| c.delegate_ids())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Generate a prompt section describing available capabilities, for
    /// reasoning engines that inject capability docs into their instructions.
    pub fn describe_for_prompt(&self) -> String {
        let mut prompt = String::from("## Available Capabilities\n\n");

        for schema in self.schemas() {
            prompt.push_str(&format!("### {}\n", schema.name));
            prompt.push_str(&format!("{}\n", schema.description));

            if !schema.parameters.is_empty() {
                prompt.push_str("**Parameters:**\n");
                for param in &schema.parameters {
                    let required = if param.required { " (required)" } else { "" };
                    prompt.push_str(&format!(
                        "- `{}` ({}){}: {}\n",
                        param.name,
                        param.param_type.name(),
                        required,
                        param.description
                    ));
                }
            }
            prompt.push('\n');
        }

        prompt
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("names", &self.names())
            .finish()
    }
}

// ============================================================================
// Built-in Capabilities
// ============================================================================

/// Clock capability - returns the current date and time
pub struct ClockCapability;

#[async_trait]
impl Capability for ClockCapability {
    fn schema(&self) -> CapabilitySchema {
        CapabilitySchema {
            name: "clock".into(),
            description: "Get the current date and time".into(),
            parameters: vec![ParameterSchema::optional(
                "format",
                ParamType::String,
                "Output format: 'iso', 'human', or 'unix'",
            )
            .with_default(serde_json::json!("human"))
            .with_enum(vec![
                serde_json::json!("iso"),
                serde_json::json!("human"),
                serde_json::json!("unix"),
            ])],
            returns: ReturnKind::Text,
        }
    }

    async fn invoke(
        &self,
        call: &CapabilityCall,
        _ctx: &CallContext,
    ) -> std::result::Result<CapabilityOutput, ExecError> {
        let format = call
            .arguments
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("human");

        let now = chrono::Utc::now();

        let output = match format {
            "iso" => now.to_rfc3339(),
            "unix" => now.timestamp().to_string(),
            _ => now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string(),
        };

        Ok(CapabilityOutput::text(output))
    }
}
