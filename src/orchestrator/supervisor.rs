//! The decision loop.
//!
//! `Deciding -> Dispatching -> (Deciding | Responding | Escalating)`, ending in
//! `Responding`, which finalizes the state and hands it to the responder.
//! Every exit path yields a terminal state; failures become annotations.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::agent::{AgentRegistry, AgentReply};
use super::directive::{DirectiveAction, RoutingDirective};
use super::human::{CapabilityHuman, Escalation, HumanLoop};
use super::responder::{CapabilityResponder, ResponseFormatter};
use super::state::{Completion, StateError, TurnRecord, TurnStatus, WorkflowState};
use crate::config::{LoopLimits, OrchestratorConfig, RoleConfig, TimeoutConfig};
use crate::gateway::ToolCaller;
use crate::observer::{NullObserver, Observer};

enum Phase {
    Deciding,
    Dispatching(RoutingDirective),
    Escalating { reason: String },
    Responding(Completion),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Deciding => "Deciding",
            Phase::Dispatching(_) => "Dispatching",
            Phase::Escalating { .. } => "Escalating",
            Phase::Responding(_) => "Responding",
        }
    }
}

/// Final result of one request.
#[derive(Debug, Serialize)]
pub struct RequestOutcome {
    pub state: WorkflowState,
    /// Whatever the responder returned, if delivery succeeded.
    pub response: Option<Value>,
    pub delivery_error: Option<String>,
}

impl RequestOutcome {
    pub fn is_complete(&self) -> bool {
        self.state
            .completion()
            .is_some_and(|completion| completion.is_complete())
    }
}

pub struct Supervisor {
    caller: Arc<dyn ToolCaller>,
    agents: AgentRegistry,
    roles: RoleConfig,
    limits: LoopLimits,
    decision_timeout: Duration,
    escalation_timeout: Duration,
    human: Arc<dyn HumanLoop>,
    responder: Arc<dyn ResponseFormatter>,
    observer: Arc<dyn Observer>,
}

impl Supervisor {
    /// Builds a supervisor whose human and responder are the configured
    /// capabilities, reached through `caller`.
    pub fn new(
        caller: Arc<dyn ToolCaller>,
        agents: AgentRegistry,
        roles: RoleConfig,
        limits: LoopLimits,
    ) -> Self {
        let timeouts = TimeoutConfig::default();
        let human = Arc::new(CapabilityHuman::new(
            &roles.human,
            Arc::clone(&caller),
            timeouts.escalation(),
        ));
        let responder = Arc::new(CapabilityResponder::new(
            &roles.responder,
            Arc::clone(&caller),
            timeouts.call(),
        ));

        Self {
            caller,
            agents,
            roles,
            limits,
            decision_timeout: timeouts.call(),
            escalation_timeout: timeouts.escalation(),
            human,
            responder,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn from_config(config: &OrchestratorConfig, caller: Arc<dyn ToolCaller>) -> Self {
        let agents = AgentRegistry::from_config(config, Arc::clone(&caller));
        let responder = Arc::new(CapabilityResponder::new(
            &config.roles.responder,
            Arc::clone(&caller),
            config.call_timeout_for(&config.roles.responder),
        ));
        let human = Arc::new(CapabilityHuman::new(
            &config.roles.human,
            Arc::clone(&caller),
            config.timeouts.escalation(),
        ));

        Self::new(caller, agents, config.roles.clone(), config.limits.clone())
            .with_timeouts(
                config.call_timeout_for(&config.roles.decider),
                config.timeouts.escalation(),
            )
            .with_human(human)
            .with_responder(responder)
    }

    pub fn with_human(mut self, human: Arc<dyn HumanLoop>) -> Self {
        self.human = human;
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn ResponseFormatter>) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_timeouts(mut self, decision: Duration, escalation: Duration) -> Self {
        self.decision_timeout = decision;
        self.escalation_timeout = escalation;
        self
    }

    /// Runs one request to completion. Never fails: problems end up as
    /// annotations on an incomplete state.
    pub async fn run(&self, task: &str) -> RequestOutcome {
        let mut state = WorkflowState::new(task);
        tracing::info!(request_id = %state.request_id(), "request started");

        let mut phase = Phase::Deciding;
        let completion = loop {
            let from = phase.name();
            let step = match phase {
                Phase::Deciding => self.decide(&mut state).await,
                Phase::Dispatching(directive) => self.dispatch(&mut state, directive).await,
                Phase::Escalating { reason } => self.escalate(&mut state, reason).await,
                Phase::Responding(completion) => break completion,
            };
            phase = match step {
                Ok(next) => next,
                Err(e) => Phase::Responding(Completion::Incomplete {
                    reason: e.to_string(),
                }),
            };
            tracing::debug!(request_id = %state.request_id(), from, to = phase.name(), "phase transition");
            self.observer
                .record_phase_transition(state.request_id(), from, phase.name());
        };

        self.respond(state, completion).await
    }

    async fn decide(&self, state: &mut WorkflowState) -> Result<Phase, StateError> {
        let max = self.limits.max_iterations;
        if state.counters().turns >= max {
            tracing::warn!(request_id = %state.request_id(), max, "decision ceiling reached");
            return Ok(Phase::Responding(Completion::Incomplete {
                reason: format!("decision ceiling of {} turns reached", max),
            }));
        }

        state.increment_turns()?;
        let params = state.decision_params(&self.agents.names());
        let value = match self
            .caller
            .call(&self.roles.decider, "decide", params, self.decision_timeout)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                state.annotate(format!("decision call failed: {}", e))?;
                return Ok(Phase::Escalating {
                    reason: format!("decision call failed: {}", e),
                });
            }
        };

        let mut directive =
            match RoutingDirective::parse(&value, &self.roles, |name| self.agents.contains(name)) {
                Ok(directive) => directive,
                Err(e) => {
                    state.annotate(format!("rejected directive: {}", e))?;
                    return Ok(Phase::Escalating {
                        reason: format!("decision returned an invalid directive: {}", e),
                    });
                }
            };

        state.set_confidence(directive.confidence)?;
        if directive.gate(self.limits.confidence_threshold, &self.roles.human) {
            tracing::info!(
                request_id = %state.request_id(),
                confidence = directive.confidence,
                "low-confidence directive escalated"
            );
        }

        Ok(match directive.action {
            DirectiveAction::Continue => Phase::Dispatching(directive),
            DirectiveAction::Respond => Phase::Responding(Completion::Complete),
            DirectiveAction::Escalate => Phase::Escalating {
                reason: if directive.reasoning.is_empty() {
                    "decision requested escalation".to_string()
                } else {
                    directive.reasoning
                },
            },
        })
    }

    async fn dispatch(
        &self,
        state: &mut WorkflowState,
        directive: RoutingDirective,
    ) -> Result<Phase, StateError> {
        let name = directive.target.as_str();
        let instructions = directive.instructions.as_str();
        let Some(agent) = self.agents.get(name) else {
            state.annotate(format!("agent '{}' is not registered", name))?;
            return Ok(Phase::Escalating {
                reason: format!("agent '{}' is not registered", name),
            });
        };

        let mut support: Option<Value> = None;
        let mut rounds = 0;
        let reply = loop {
            let reply = match agent.run(instructions, state.view(), support.as_ref()).await {
                Ok(reply) => reply,
                Err(e) => {
                    state.record_turn(TurnRecord::new(
                        name,
                        instructions,
                        TurnStatus::Failed,
                        format!("call failed: {}", e),
                    ))?;
                    state.annotate(format!("agent '{}' failed: {}", name, e))?;
                    return Ok(Phase::Escalating {
                        reason: format!("agent '{}' failed: {}", name, e),
                    });
                }
            };

            if reply.status != TurnStatus::NeedsSupport || rounds >= self.limits.max_support_rounds
            {
                break reply;
            }

            rounds += 1;
            let request = reply.support_request.clone().unwrap_or(Value::Null);
            state.record_support_request(name, request.clone(), rounds)?;
            state.apply_delta(name, &reply.delta)?;

            match self.run_support(state, name, instructions, &request).await? {
                Some(result) => {
                    state.set_support_context(name, result.clone())?;
                    support = Some(result);
                }
                None => break reply,
            }
        };

        state.apply_delta(name, &reply.delta)?;
        let mut summary = reply.summary();
        if reply.status == TurnStatus::NeedsSupport {
            state.annotate(format!(
                "agent '{}' still needed support after {} round(s)",
                name, rounds
            ))?;
            summary = format!("unresolved: {}", summary);
        }
        state.record_turn(TurnRecord::new(name, instructions, reply.status, summary))?;

        if name == self.roles.verifier && reply.verification_failed() {
            let cycles = state.increment_fix_cycles()?;
            tracing::info!(request_id = %state.request_id(), cycles, "verification failed");
            if cycles >= self.limits.max_fix_cycles {
                return Ok(Phase::Responding(Completion::Incomplete {
                    reason: format!("verification still failing after {} fix cycles", cycles),
                }));
            }
        }

        Ok(Phase::Deciding)
    }

    /// Runs the support agent for `requester`. `None` means no usable result.
    async fn run_support(
        &self,
        state: &mut WorkflowState,
        requester: &str,
        instructions: &str,
        request: &Value,
    ) -> Result<Option<Value>, StateError> {
        let support = match self.roles.support.as_deref() {
            Some(name) if name != requester => self.agents.get(name),
            _ => None,
        };
        let Some(support) = support else {
            state.annotate(format!(
                "no support agent available for '{}'",
                requester
            ))?;
            return Ok(None);
        };

        let support_name = support.name().to_string();
        let support_instructions = match request {
            Value::String(text) => format!("Support '{}': {}", requester, text),
            other => format!("Support '{}': {}", requester, other),
        };
        let context = json!({
            "requester": requester,
            "request": request,
            "requester_instructions": instructions,
        });

        match support
            .run(&support_instructions, state.view(), Some(&context))
            .await
        {
            Ok(reply) => {
                state.apply_delta(&support_name, &reply.delta)?;
                state.record_turn(TurnRecord::new(
                    &support_name,
                    &support_instructions,
                    reply.status,
                    reply.summary(),
                ))?;
                Ok(usable_support(reply))
            }
            Err(e) => {
                state.record_turn(TurnRecord::new(
                    &support_name,
                    &support_instructions,
                    TurnStatus::Failed,
                    format!("call failed: {}", e),
                ))?;
                state.annotate(format!("support agent '{}' failed: {}", support_name, e))?;
                Ok(None)
            }
        }
    }

    async fn escalate(&self, state: &mut WorkflowState, reason: String) -> Result<Phase, StateError> {
        let count = state.increment_escalations()?;
        if count > self.limits.max_escalations {
            return Ok(Phase::Responding(Completion::Incomplete {
                reason: format!(
                    "escalation limit of {} exceeded; last reason: {}",
                    self.limits.max_escalations, reason
                ),
            }));
        }

        tracing::info!(request_id = %state.request_id(), %reason, "escalating to human");
        let human = self.roles.human.clone();
        let escalation = Escalation {
            reason: reason.clone(),
            context: state.view(),
        };

        let failure = match tokio::time::timeout(
            self.escalation_timeout,
            self.human.escalate(&escalation),
        )
        .await
        {
            Ok(Ok(resolution)) => {
                state.set_agent_output(
                    &human,
                    json!({"reason": reason, "resolution_text": resolution.resolution_text}),
                )?;
                state.record_turn(TurnRecord::new(
                    &human,
                    &reason,
                    TurnStatus::Done,
                    resolution.resolution_text,
                ))?;
                return Ok(Phase::Deciding);
            }
            Ok(Err(e)) => format!("escalation failed: {}", e),
            Err(_) => format!("escalation timed out after {:?}", self.escalation_timeout),
        };

        tracing::warn!(request_id = %state.request_id(), %failure, "escalation unresolved");
        state.record_turn(TurnRecord::new(
            &human,
            &reason,
            TurnStatus::Failed,
            failure.clone(),
        ))?;
        Ok(Phase::Responding(Completion::Incomplete { reason: failure }))
    }

    async fn respond(&self, mut state: WorkflowState, completion: Completion) -> RequestOutcome {
        if let Err(e) = state.finish(completion) {
            tracing::warn!(request_id = %state.request_id(), error = %e, "state already finished");
        }
        self.observer
            .record_phase_transition(state.request_id(), "Responding", "Terminal");

        let (response, delivery_error) = match self.responder.deliver(&state).await {
            Ok(response) => (Some(response), None),
            Err(e) => {
                tracing::warn!(request_id = %state.request_id(), error = %e, "response delivery failed");
                (None, Some(e.to_string()))
            }
        };

        tracing::info!(
            request_id = %state.request_id(),
            turns = state.counters().turns,
            complete = state.completion().is_some_and(Completion::is_complete),
            "request finished"
        );

        RequestOutcome {
            state,
            response,
            delivery_error,
        }
    }
}

fn usable_support(reply: AgentReply) -> Option<Value> {
    (reply.status != TurnStatus::Failed).then_some(reply.delta)
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
