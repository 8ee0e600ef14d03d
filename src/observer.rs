//! Observation hooks for gateway calls, breaker transitions, worker
//! notifications and supervisor phase changes.
//!
//! Observers are fire-and-forget: every hook is synchronous, infallible and
//! must not block. The default implementations discard the event.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// One completed gateway call (a single attempt, not a retry sequence).
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub capability: String,
    pub method: String,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    pub outcome: CallOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "kind")]
pub enum CallOutcome {
    Ok,
    /// Failure kind, e.g. `timeout` or `worker_crashed`.
    Failed(String),
}

/// Circuit breaker state changes, reported once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerTransition {
    Opened,
    HalfOpen,
    Closed,
}

impl BreakerTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerTransition::Opened => "opened",
            BreakerTransition::HalfOpen => "half_open",
            BreakerTransition::Closed => "closed",
        }
    }
}

pub trait Observer: Send + Sync {
    fn record_call(&self, _record: &CallRecord) {}

    fn record_breaker(&self, _capability: &str, _transition: BreakerTransition) {}

    /// Out-of-band worker messages (progress, logs). Never affect a pending call.
    fn record_notification(&self, _capability: &str, _kind: &str, _payload: &Value) {}

    fn record_phase_transition(&self, _request_id: &str, _from: &str, _to: &str) {}
}

/// Observer that discards everything.
pub struct NullObserver;

impl Observer for NullObserver {}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}
