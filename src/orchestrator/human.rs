use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::{CallError, ToolCaller};

/// What the human sees: why the loop stopped and the state at that point.
#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub reason: String,
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolution_text: String,
}

/// Human-in-the-loop collaborator. The supervisor bounds every call with
/// the escalation timeout.
#[async_trait]
pub trait HumanLoop: Send + Sync {
    async fn escalate(&self, escalation: &Escalation) -> Result<Resolution, CallError>;
}

/// Escalates through a capability's `escalate` method.
pub struct CapabilityHuman {
    capability: String,
    caller: Arc<dyn ToolCaller>,
    timeout: Duration,
}

impl CapabilityHuman {
    pub fn new(capability: &str, caller: Arc<dyn ToolCaller>, timeout: Duration) -> Self {
        Self {
            capability: capability.to_string(),
            caller,
            timeout,
        }
    }
}

#[async_trait]
impl HumanLoop for CapabilityHuman {
    async fn escalate(&self, escalation: &Escalation) -> Result<Resolution, CallError> {
        let params = serde_json::to_value(escalation)
            .map_err(|e| CallError::malformed(&self.capability, e.to_string()))?;
        let result = self
            .caller
            .call(&self.capability, "escalate", params, self.timeout)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| CallError::malformed(&self.capability, format!("bad resolution: {}", e)))
    }
}
