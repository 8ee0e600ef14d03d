//! The per-request workflow record threaded through every turn.
//!
//! Owned by exactly one supervisor run. Agents only ever see `view()`; the
//! loop merges their deltas. Once `finish` is called every mutator fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Done,
    NeedsSupport,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Done => "done",
            TurnStatus::NeedsSupport => "needs_support",
            TurnStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub agent: String,
    pub instructions: String,
    pub status: TurnStatus,
    pub summary: String,
    pub at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn new(agent: &str, instructions: &str, status: TurnStatus, summary: impl Into<String>) -> Self {
        Self {
            agent: agent.to_string(),
            instructions: instructions.to_string(),
            status,
            summary: summary.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportRequest {
    pub requester: String,
    pub request: Value,
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub location: String,
    pub producer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completion {
    Complete,
    Incomplete { reason: String },
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        matches!(self, Completion::Complete)
    }
}

/// Iteration counts per loop category. Only ever incremented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationCounters {
    pub turns: u32,
    pub fix_cycles: u32,
    pub escalations: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateError {
    Terminal,
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Terminal => write!(f, "workflow state is terminal and cannot change"),
        }
    }
}

impl std::error::Error for StateError {}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    request_id: String,
    task_description: String,
    history: Vec<TurnRecord>,
    support_context: BTreeMap<String, Value>,
    support_requests: Vec<SupportRequest>,
    artifact_refs: BTreeMap<String, ArtifactRef>,
    agent_outputs: BTreeMap<String, Value>,
    quality_score: Option<f64>,
    confidence: Option<f64>,
    iteration_count: IterationCounters,
    annotations: Vec<String>,
    terminal: bool,
    completion: Option<Completion>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(task_description: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            task_description: task_description.to_string(),
            history: Vec::new(),
            support_context: BTreeMap::new(),
            support_requests: Vec::new(),
            artifact_refs: BTreeMap::new(),
            agent_outputs: BTreeMap::new(),
            quality_score: None,
            confidence: None,
            iteration_count: IterationCounters::default(),
            annotations: Vec::new(),
            terminal: false,
            completion: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn task_description(&self) -> &str {
        &self.task_description
    }

    pub fn history(&self) -> &[TurnRecord] {
        &self.history
    }

    pub fn support_requests(&self) -> &[SupportRequest] {
        &self.support_requests
    }

    pub fn artifact_refs(&self) -> &BTreeMap<String, ArtifactRef> {
        &self.artifact_refs
    }

    pub fn quality_score(&self) -> Option<f64> {
        self.quality_score
    }

    pub fn confidence(&self) -> Option<f64> {
        self.confidence
    }

    pub fn counters(&self) -> IterationCounters {
        self.iteration_count
    }

    pub fn annotations(&self) -> &[String] {
        &self.annotations
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.terminal {
            Err(StateError::Terminal)
        } else {
            Ok(())
        }
    }

    pub fn record_turn(&mut self, turn: TurnRecord) -> Result<(), StateError> {
        self.ensure_open()?;
        self.history.push(turn);
        Ok(())
    }

    /// Merges an agent delta: artifacts, scores, and the raw delta under
    /// `agent_outputs[agent]`.
    ///
    /// An artifact already owned by another agent keeps its first producer.
    pub fn apply_delta(&mut self, agent: &str, delta: &Value) -> Result<(), StateError> {
        self.ensure_open()?;

        if let Some(artifacts) = delta.get("artifacts").and_then(Value::as_object) {
            for (name, location) in artifacts {
                let location = match location {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match self.artifact_refs.get(name) {
                    Some(existing) if existing.producer != agent => {
                        tracing::warn!(
                            artifact = %name,
                            owner = %existing.producer,
                            agent,
                            "ignoring artifact already produced by another agent"
                        );
                    }
                    _ => {
                        self.artifact_refs.insert(
                            name.clone(),
                            ArtifactRef {
                                location,
                                producer: agent.to_string(),
                            },
                        );
                    }
                }
            }
        }

        if let Some(score) = delta.get("quality_score").and_then(Value::as_f64) {
            self.quality_score = Some(clamp_unit(score));
        }
        if let Some(confidence) = delta.get("confidence").and_then(Value::as_f64) {
            self.confidence = Some(clamp_unit(confidence));
        }

        self.agent_outputs.insert(agent.to_string(), delta.clone());
        Ok(())
    }

    pub fn set_agent_output(&mut self, agent: &str, output: Value) -> Result<(), StateError> {
        self.ensure_open()?;
        self.agent_outputs.insert(agent.to_string(), output);
        Ok(())
    }

    /// Overwrites the support result for `requester`.
    pub fn set_support_context(&mut self, requester: &str, result: Value) -> Result<(), StateError> {
        self.ensure_open()?;
        self.support_context.insert(requester.to_string(), result);
        Ok(())
    }

    pub fn record_support_request(
        &mut self,
        requester: &str,
        request: Value,
        round: u32,
    ) -> Result<(), StateError> {
        self.ensure_open()?;
        self.support_requests.push(SupportRequest {
            requester: requester.to_string(),
            request,
            round,
        });
        Ok(())
    }

    pub fn set_confidence(&mut self, confidence: f64) -> Result<(), StateError> {
        self.ensure_open()?;
        self.confidence = Some(clamp_unit(confidence));
        Ok(())
    }

    pub fn annotate(&mut self, note: impl Into<String>) -> Result<(), StateError> {
        self.ensure_open()?;
        self.annotations.push(note.into());
        Ok(())
    }

    pub fn increment_turns(&mut self) -> Result<u32, StateError> {
        self.ensure_open()?;
        self.iteration_count.turns += 1;
        Ok(self.iteration_count.turns)
    }

    pub fn increment_fix_cycles(&mut self) -> Result<u32, StateError> {
        self.ensure_open()?;
        self.iteration_count.fix_cycles += 1;
        Ok(self.iteration_count.fix_cycles)
    }

    pub fn increment_escalations(&mut self) -> Result<u32, StateError> {
        self.ensure_open()?;
        self.iteration_count.escalations += 1;
        Ok(self.iteration_count.escalations)
    }

    /// Sets the completion flag and makes the state immutable. Only succeeds once.
    pub fn finish(&mut self, completion: Completion) -> Result<(), StateError> {
        self.ensure_open()?;
        if let Completion::Incomplete { ref reason } = completion {
            self.annotations.push(format!("incomplete: {}", reason));
        }
        self.completion = Some(completion);
        self.finished_at = Some(Utc::now());
        self.terminal = true;
        Ok(())
    }

    /// Parameters for the decision capability's `decide` method.
    pub fn decision_params(&self, available_agents: &[String]) -> Value {
        json!({
            "task_description": self.task_description,
            "history": self.history,
            "support_context": self.support_context,
            "quality_score": self.quality_score,
            "confidence": self.confidence,
            "available_agents": available_agents,
            "iteration": self.iteration_count.turns,
        })
    }

    /// Read-only snapshot handed to agents.
    pub fn view(&self) -> Value {
        json!({
            "request_id": self.request_id,
            "task_description": self.task_description,
            "history": self.history,
            "support_context": self.support_context,
            "artifact_refs": self.artifact_refs,
            "agent_outputs": self.agent_outputs,
            "quality_score": self.quality_score,
            "confidence": self.confidence,
        })
    }
}

#[cfg(test)]
impl WorkflowState {
    pub fn support_context(&self) -> &BTreeMap<String, Value> {
        &self.support_context
    }

    pub fn agent_outputs(&self) -> &BTreeMap<String, Value> {
        &self.agent_outputs
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
