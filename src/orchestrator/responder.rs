use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::state::WorkflowState;
use crate::gateway::{CallError, ToolCaller};

/// Receives the final state once the loop reaches a terminal state.
#[async_trait]
pub trait ResponseFormatter: Send + Sync {
    async fn deliver(&self, state: &WorkflowState) -> Result<Value, CallError>;
}

/// Hands the final state to a capability's `respond` method.
pub struct CapabilityResponder {
    capability: String,
    caller: Arc<dyn ToolCaller>,
    timeout: Duration,
}

impl CapabilityResponder {
    pub fn new(capability: &str, caller: Arc<dyn ToolCaller>, timeout: Duration) -> Self {
        Self {
            capability: capability.to_string(),
            caller,
            timeout,
        }
    }
}

#[async_trait]
impl ResponseFormatter for CapabilityResponder {
    async fn deliver(&self, state: &WorkflowState) -> Result<Value, CallError> {
        self.caller
            .call(
                &self.capability,
                "respond",
                json!({ "state": state }),
                self.timeout,
            )
            .await
    }
}
