//! Retry and circuit breaking around any `ToolCaller`.

mod breaker;
mod retry;

pub use breaker::{Admission, BreakerStatus, CircuitBreakers};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ResiliencePolicy;
use crate::gateway::{CallError, ToolCaller};
use crate::observer::{BreakerTransition, Observer};

/// Decorates a `ToolCaller` with bounded retry for transient errors and a
/// circuit breaker per capability.
pub struct ResilientCaller {
    inner: Arc<dyn ToolCaller>,
    retry: RetryPolicy,
    breakers: CircuitBreakers,
    observer: Arc<dyn Observer>,
}

impl ResilientCaller {
    pub fn new(
        inner: Arc<dyn ToolCaller>,
        policy: &ResiliencePolicy,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            inner,
            retry: RetryPolicy::from_config(policy),
            breakers: CircuitBreakers::new(policy.breaker_threshold, policy.breaker_cooldown()),
            observer,
        }
    }

    pub fn status(&self, capability: &str) -> BreakerStatus {
        self.breakers.status(capability)
    }

    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        self.breakers.statuses()
    }

    fn report(&self, capability: &str, transition: BreakerTransition) {
        match transition {
            BreakerTransition::Opened => {
                tracing::warn!(capability, "circuit opened")
            }
            BreakerTransition::HalfOpen => {
                tracing::info!(capability, "circuit half-open, admitting trial call")
            }
            BreakerTransition::Closed => tracing::info!(capability, "circuit closed"),
        }
        self.observer.record_breaker(capability, transition);
    }
}

#[async_trait]
impl ToolCaller for ResilientCaller {
    async fn call(
        &self,
        capability: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let max_attempts = match self.breakers.admit(capability) {
            Admission::Rejected(retry_in) => {
                tracing::debug!(capability, method, ?retry_in, "rejected by open circuit");
                return Err(CallError::CircuitOpen {
                    capability: capability.to_string(),
                    retry_in,
                });
            }
            Admission::Trial => {
                self.report(capability, BreakerTransition::HalfOpen);
                1
            }
            Admission::Normal => self.retry.max_attempts,
        };

        let mut attempt = 1;
        let result = loop {
            match self
                .inner
                .call(capability, method, params.clone(), timeout)
                .await
            {
                Ok(value) => break Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        capability,
                        method,
                        attempt,
                        max_attempts,
                        error = %error,
                        "transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => break Err(error),
            }
        };

        let transition = match &result {
            Ok(_) => self.breakers.record_success(capability),
            Err(_) => self.breakers.record_failure(capability),
        };
        if let Some(transition) = transition {
            self.report(capability, transition);
        }

        result
    }
}

#[cfg(test)]
#[path = "tests/resilient_caller_tests.rs"]
mod tests;
