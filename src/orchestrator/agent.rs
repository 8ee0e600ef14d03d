//! Agent nodes and the registry the supervisor routes through.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::state::TurnStatus;
use crate::config::OrchestratorConfig;
use crate::gateway::{CallError, ToolCaller};

/// What an agent hands back after a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub status: TurnStatus,
    pub delta: Value,
    pub support_request: Option<Value>,
}

impl AgentReply {
    /// Parses `{status, delta, support_request?}`. A missing delta is `{}`.
    pub fn parse(capability: &str, value: Value) -> Result<Self, CallError> {
        let Value::Object(mut reply) = value else {
            return Err(CallError::malformed(capability, "agent reply is not an object"));
        };

        let status = match reply.get("status").and_then(Value::as_str) {
            Some("done") => TurnStatus::Done,
            Some("needs_support") => TurnStatus::NeedsSupport,
            Some("failed") => TurnStatus::Failed,
            Some(other) => {
                return Err(CallError::malformed(
                    capability,
                    format!("unknown agent status '{}'", other),
                ))
            }
            None => return Err(CallError::malformed(capability, "agent reply has no status")),
        };

        let delta = match reply.remove("delta") {
            None | Some(Value::Null) => json!({}),
            Some(delta @ Value::Object(_)) => delta,
            Some(_) => return Err(CallError::malformed(capability, "delta must be an object")),
        };

        let support_request = reply.remove("support_request").filter(|v| !v.is_null());

        Ok(Self {
            status,
            delta,
            support_request,
        })
    }

    /// One-line summary for the history entry.
    pub fn summary(&self) -> String {
        self.delta
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.status.as_str().to_string())
    }

    /// A verification turn fails on `status: failed` or `delta.passed == false`.
    pub fn verification_failed(&self) -> bool {
        self.status == TurnStatus::Failed
            || self.delta.get("passed").and_then(Value::as_bool) == Some(false)
    }
}

#[async_trait]
pub trait AgentNode: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        instructions: &str,
        state_view: Value,
        support: Option<&Value>,
    ) -> Result<AgentReply, CallError>;
}

/// Agent backed by a capability's `run` method.
pub struct CapabilityAgent {
    name: String,
    caller: Arc<dyn ToolCaller>,
    timeout: Duration,
}

impl CapabilityAgent {
    pub fn new(name: &str, caller: Arc<dyn ToolCaller>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            caller,
            timeout,
        }
    }
}

#[async_trait]
impl AgentNode for CapabilityAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        instructions: &str,
        state_view: Value,
        support: Option<&Value>,
    ) -> Result<AgentReply, CallError> {
        let mut params = json!({
            "instructions": instructions,
            "state_view": state_view,
        });
        if let Some(support) = support {
            params["support"] = support.clone();
        }

        let result = self
            .caller
            .call(&self.name, "run", params, self.timeout)
            .await?;
        AgentReply::parse(&self.name, result)
    }
}

/// Agents keyed by capability name. Adding an agent is a `register` call.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn AgentNode>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One `CapabilityAgent` per configured capability outside the fixed roles.
    pub fn from_config(config: &OrchestratorConfig, caller: Arc<dyn ToolCaller>) -> Self {
        let mut registry = Self::new();
        for name in config.agent_names() {
            let timeout = config.call_timeout_for(&name);
            registry.register(Arc::new(CapabilityAgent::new(
                &name,
                Arc::clone(&caller),
                timeout,
            )));
        }
        registry
    }

    pub fn register(&mut self, agent: Arc<dyn AgentNode>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentNode>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCaller;

    #[test]
    fn test_parse_reply_variants() {
        let reply = AgentReply::parse(
            "verify",
            json!({"status": "needs_support", "support_request": "missing dependency list"}),
        )
        .unwrap();
        assert_eq!(reply.status, TurnStatus::NeedsSupport);
        assert_eq!(reply.delta, json!({}));
        assert_eq!(reply.support_request, Some(json!("missing dependency list")));

        let reply = AgentReply::parse("verify", json!({"status": "done", "delta": {"passed": false}}))
            .unwrap();
        assert!(reply.verification_failed());
        assert_eq!(reply.summary(), "done");
    }

    #[test]
    fn test_parse_rejects_bad_replies() {
        for value in [
            json!([]),
            json!({"delta": {}}),
            json!({"status": "maybe"}),
            json!({"status": "done", "delta": "text"}),
        ] {
            let err = AgentReply::parse("write", value).unwrap_err();
            assert_eq!(err.kind(), "malformed");
        }
    }

    #[tokio::test]
    async fn test_capability_agent_sends_instructions_view_and_support() {
        let caller = ScriptedCaller::new();
        caller.always_ok(
            "verify",
            "run",
            json!({"status": "done", "delta": {"summary": "all good"}}),
        );
        let agent = CapabilityAgent::new("verify", caller.clone(), Duration::from_secs(5));

        let support = json!({"deps": ["serde"]});
        let reply = agent
            .run("check deps", json!({"task_description": "t"}), Some(&support))
            .await
            .unwrap();
        assert_eq!(reply.summary(), "all good");

        let call = &caller.calls()[0];
        assert_eq!(call.method, "run");
        assert_eq!(call.params["instructions"], "check deps");
        assert_eq!(call.params["state_view"]["task_description"], "t");
        assert_eq!(call.params["support"], support);
    }

    #[test]
    fn test_registry_from_config_skips_reserved_roles() {
        let config: OrchestratorConfig = serde_yaml::from_str(
            r#"
capabilities:
  supervisor-decide: {command: "d"}
  responder: {command: "r"}
  human: {command: "h"}
  implement: {command: "i"}
  verify: {command: "v"}
"#,
        )
        .unwrap();
        let caller: Arc<dyn ToolCaller> = ScriptedCaller::new();
        let registry = AgentRegistry::from_config(&config, caller);
        assert_eq!(registry.names(), vec!["implement".to_string(), "verify".to_string()]);
        assert!(!registry.contains("human"));
    }
}
