//! Action Model
//!
//! A single proposed step is either a free-form code fragment or a structured
//! capability call. The two variants form a closed tagged enum so every call
//! site handles both cases exhaustively at compile time.

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityCall;

/// Marker observation text for empty or no-op actions.
pub const NO_OUTPUT_MARKER: &str = "(no output)";

/// One proposed step from the reasoning engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Free-form program fragment executed inside the sandbox boundary.
    Code { code: String },

    /// Schema-validated invocation of a registered capability.
    Call(CapabilityCall),
}

impl Action {
    pub fn code(code: impl Into<String>) -> Self {
        Action::Code { code: code.into() }
    }

    pub fn call(call: CapabilityCall) -> Self {
        Action::Call(call)
    }

    /// An empty fragment or a call with a blank name does nothing; dispatch
    /// answers it with [`NO_OUTPUT_MARKER`] instead of an error.
    pub fn is_noop(&self) -> bool {
        match self {
            Action::Code { code } => code.trim().is_empty(),
            Action::Call(call) => call.name.trim().is_empty(),
        }
    }

    /// Short human-readable label for logs and transcripts.
    pub fn label(&self) -> &str {
        match self {
            Action::Code { .. } => "code",
            Action::Call(call) => &call.name,
        }
    }
}

/// Result (or error text) fed back into memory after dispatching an action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Serialized output shown to the reasoning engine
    pub text: String,

    /// Structured payload, kept when the capability declares a JSON return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Observation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The explicit "no output" marker for no-op actions.
    pub fn no_output() -> Self {
        Self::text(NO_OUTPUT_MARKER)
    }

    pub fn is_no_output(&self) -> bool {
        self.text == NO_OUTPUT_MARKER
    }
}

/// A high-level strategy proposal from the reasoning engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    /// Strategy text
    pub plan: String,

    /// Facts the engine believes it has established so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facts: Option<String>,
}

impl PlanDraft {
    pub fn new(plan: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            facts: None,
        }
    }

    pub fn with_facts(mut self, facts: impl Into<String>) -> Self {
        self.facts = Some(facts.into());
        self
    }
}

/// What the reasoning engine wants the loop to do next.
///
/// The final-answer variant terminates the loop and is never forwarded to the
/// action executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    /// Dispatch one action
    Act {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
        action: Action,
    },

    /// Record a planning step before acting again
    Plan(PlanDraft),

    /// Terminate the run with this answer
    Finish { answer: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_detection() {
        assert!(Action::code("   \n").is_noop());
        assert!(!Action::code("1 + 1").is_noop());
        let blank = CapabilityCall::new("", [] as [(String, serde_json::Value); 0]);
        assert!(Action::Call(blank).is_noop());
    }

    #[test]
    fn no_output_marker() {
        let obs = Observation::no_output();
        assert!(obs.is_no_output());
        assert_eq!(obs.text, NO_OUTPUT_MARKER);
        assert!(!Observation::text("done").is_no_output());
    }

    #[test]
    fn directive_tags_are_stable() {
        let json = serde_json::to_value(Directive::Finish {
            answer: "42".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "finish");
        assert_eq!(json["answer"], "42");
    }
}
