//! Memory Model
//!
//! An append-only, ordered log of typed steps recording every task, plan,
//! action, observation, error, and final answer of a run. Step indices are
//! contiguous from zero; a written step is never mutated again, with one
//! sanctioned exception: the human-in-the-loop edit of the most recent
//! planning step before the loop resumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::action::{Action, Observation};
use crate::engine::TokenUsage;
use crate::error::{AgentError, ExecError, Result};

/// The user-supplied goal, immutable once accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,

    /// Goal text
    pub goal: String,

    /// Optional structured context handed along with the goal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,

    pub accepted_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            context: None,
            accepted_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Why a run terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The reasoning engine emitted the designated final-answer directive
    FinalAnswer,
    /// Step budget exhausted; the answer is best-effort
    StepBudgetExceeded,
    /// Unrecoverable failure (provider down after retries, repeated limits)
    FatalError,
    /// External cancellation
    Interrupted,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::FinalAnswer => write!(f, "final_answer"),
            ExitReason::StepBudgetExceeded => write!(f, "step_budget_exceeded"),
            ExitReason::FatalError => write!(f, "fatal_error"),
            ExitReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Operating instructions given to the reasoning engine; once per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemStep {
    pub index: usize,
    pub instructions: String,
    pub created_at: DateTime<Utc>,
}

/// The accepted task; once per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub index: usize,
    pub task: Task,
    pub created_at: DateTime<Utc>,
}

/// High-level strategy recorded at the planning cadence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanningStep {
    pub index: usize,
    pub plan: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub facts: Option<String>,

    /// Set when the human-in-the-loop hook replaced the plan text
    #[serde(default)]
    pub edited: bool,

    pub created_at: DateTime<Utc>,
}

/// One loop iteration: rationale, proposed action, outcome, cost.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub index: usize,

    /// Reasoning text accompanying the action, when the engine provides one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,

    /// The proposed action; absent when the engine output was unparsable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    /// Dispatch result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,

    /// Dispatch failure, fed back to the engine on the next iteration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecError>,

    /// Token cost reported by the reasoning engine for this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// Wall-clock time spent dispatching
    pub duration: Duration,

    pub started_at: DateTime<Utc>,
}

/// Terminal answer and exit reason; always the last entry of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalStep {
    pub index: usize,
    pub answer: String,
    pub exit: ExitReason,
    pub created_at: DateTime<Utc>,
}

/// Tagged memory entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum MemoryStep {
    System(SystemStep),
    Task(TaskStep),
    Planning(PlanningStep),
    Action(ActionStep),
    Final(FinalStep),
}

impl MemoryStep {
    pub fn index(&self) -> usize {
        match self {
            MemoryStep::System(s) => s.index,
            MemoryStep::Task(s) => s.index,
            MemoryStep::Planning(s) => s.index,
            MemoryStep::Action(s) => s.index,
            MemoryStep::Final(s) => s.index,
        }
    }
}

/// Retention policy for multi-turn memory growth.
///
/// When a run starts with `reset_history = false`, observation payloads of
/// action steps older than the newest `keep_recent_observations` are replaced
/// with a truncation marker. Disabled by default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_recent_observations: Option<usize>,
}

const PRUNED_PREFIX: &str = "[observation pruned:";

/// Role of a transcript entry rendered for a reasoning engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Uniform, role-tagged view of the memory log for engine implementations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
}

impl TranscriptEntry {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Append-only ordered log of memory steps.
///
/// A final step seals the log; a subsequent run on the same log (multi-turn
/// continuity) reopens it explicitly via [`MemoryLog::begin_run`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryLog {
    steps: Vec<MemoryStep>,
    sealed: bool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next appended step must carry.
    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    /// Append a step, enforcing index contiguity and the single-final-step
    /// invariant. A final step seals the log.
    pub fn append(&mut self, step: MemoryStep) -> Result<()> {
        if self.sealed {
            return Err(AgentError::Memory(
                "run is sealed by a final step; begin a new run before appending".into(),
            ));
        }
        if step.index() != self.steps.len() {
            return Err(AgentError::Memory(format!(
                "non-contiguous step index {} (expected {})",
                step.index(),
                self.steps.len()
            )));
        }

        if matches!(step, MemoryStep::Final(_)) {
            self.sealed = true;
        }
        self.steps.push(step);
        Ok(())
    }

    /// Reopen a sealed log for a follow-up run with retained history.
    pub fn begin_run(&mut self) {
        self.sealed = false;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn steps(&self) -> &[MemoryStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&MemoryStep> {
        self.steps.last()
    }

    /// The most recent final step, if any run has terminated.
    pub fn final_step(&self) -> Option<&FinalStep> {
        self.steps.iter().rev().find_map(|s| match s {
            MemoryStep::Final(f) => Some(f),
            _ => None,
        })
    }

    /// Action steps in order.
    pub fn action_steps(&self) -> impl Iterator<Item = &ActionStep> {
        self.steps.iter().filter_map(|s| match s {
            MemoryStep::Action(a) => Some(a),
            _ => None,
        })
    }

    /// The most recent successful observation, used to synthesize a
    /// best-effort answer on step-budget exhaustion.
    pub fn last_observation(&self) -> Option<&Observation> {
        self.steps.iter().rev().find_map(|s| match s {
            MemoryStep::Action(a) => a.observation.as_ref(),
            _ => None,
        })
    }

    /// The sanctioned human-in-the-loop override: replace the plan text of
    /// the most recent step, which must be a planning step.
    pub fn amend_last_plan(&mut self, new_plan: impl Into<String>) -> Result<()> {
        match self.steps.last_mut() {
            Some(MemoryStep::Planning(planning)) => {
                planning.plan = new_plan.into();
                planning.edited = true;
                Ok(())
            }
            _ => Err(AgentError::Memory(
                "the most recent step is not a planning step".into(),
            )),
        }
    }

    /// Rebuild a log from a recorded step sequence through the normal append
    /// path, revalidating every invariant. Replaying the steps of an existing
    /// log yields an identical log.
    pub fn replay<I>(steps: I) -> Result<MemoryLog>
    where
        I: IntoIterator<Item = MemoryStep>,
    {
        let mut log = MemoryLog::new();
        for step in steps {
            // Any step recorded after a final step belongs to a follow-up run.
            if log.is_sealed() {
                log.begin_run();
            }
            log.append(step)?;
        }
        Ok(log)
    }

    /// Apply the retention policy: truncate observation payloads of action
    /// steps older than the newest `keep_recent_observations`.
    pub fn prune(&mut self, policy: &RetentionPolicy) {
        let Some(keep) = policy.keep_recent_observations else {
            return;
        };

        let with_observation = self
            .steps
            .iter()
            .filter(|s| matches!(s, MemoryStep::Action(a) if a.observation.is_some()))
            .count();
        if with_observation <= keep {
            return;
        }

        let mut to_prune = with_observation - keep;
        for step in &mut self.steps {
            if to_prune == 0 {
                break;
            }
            if let MemoryStep::Action(action) = step {
                if let Some(obs) = &action.observation {
                    if obs.text.starts_with(PRUNED_PREFIX) && obs.data.is_none() {
                        to_prune -= 1;
                        continue;
                    }
                    let original_len = obs.text.len();
                    action.observation = Some(Observation::text(format!(
                        "{PRUNED_PREFIX} {original_len} chars]"
                    )));
                    to_prune -= 1;
                }
            }
        }
    }

    /// Render the log as role-tagged transcript entries.
    pub fn render_transcript(&self) -> Vec<TranscriptEntry> {
        let mut entries = Vec::with_capacity(self.steps.len() * 2);

        for step in &self.steps {
            match step {
                MemoryStep::System(s) => {
                    entries.push(TranscriptEntry::new(Role::System, &s.instructions));
                }
                MemoryStep::Task(t) => {
                    let mut content = t.task.goal.clone();
                    if let Some(ctx) = &t.task.context {
                        content.push_str("\n\nContext:\n");
                        content.push_str(&ctx.to_string());
                    }
                    entries.push(TranscriptEntry::new(Role::User, content));
                }
                MemoryStep::Planning(p) => {
                    let mut content = format!("Plan:\n{}", p.plan);
                    if let Some(facts) = &p.facts {
                        content.push_str("\n\nKnown facts:\n");
                        content.push_str(facts);
                    }
                    entries.push(TranscriptEntry::new(Role::Assistant, content));
                }
                MemoryStep::Action(a) => {
                    let mut content = String::new();
                    if let Some(rationale) = &a.rationale {
                        content.push_str(rationale);
                        content.push_str("\n\n");
                    }
                    match &a.action {
                        Some(Action::Code { code }) => {
                            content.push_str(&format!("```\n{code}\n```"));
                        }
                        Some(Action::Call(call)) => {
                            let rendered = serde_json::to_string(call)
                                .unwrap_or_else(|_| call.name.clone());
                            content.push_str(&rendered);
                        }
                        None => content.push_str("(unparsable action)"),
                    }
                    entries.push(TranscriptEntry::new(Role::Assistant, content));

                    let feedback = match (&a.observation, &a.error) {
                        (_, Some(err)) => format!("Error: {err}"),
                        (Some(obs), None) => obs.text.clone(),
                        (None, None) => String::new(),
                    };
                    if !feedback.is_empty() {
                        entries.push(TranscriptEntry::new(Role::Tool, feedback));
                    }
                }
                MemoryStep::Final(f) => {
                    entries.push(TranscriptEntry::new(Role::Assistant, &f.answer));
                }
            }
        }

        entries
    }
}
