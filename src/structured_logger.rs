//! Structured JSONL logger for orchestration events.
//!
//! Every entry carries a monotonic sequence number, a microsecond ISO 8601
//! timestamp and the session ID of the supervisor process, so a run can be
//! reconstructed from `events.jsonl` after the fact.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::observer::{BreakerTransition, CallOutcome, CallRecord, Observer};

pub struct StructuredLogger {
    session_id: String,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single log entry in JSONL format.
#[derive(Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number (unique across the session)
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    pub session_id: String,
    /// Component that emitted the log
    pub component: String,
    pub event: Value,
}

impl StructuredLogger {
    /// Creates a logger writing to `<logs_dir>/events.jsonl`, appending if it exists.
    pub fn new(session_id: &str, logs_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let log_path = logs_dir.join("events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            session_id: session_id.to_string(),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path,
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Logs a structured event as a single line. Thread-safe; write errors are dropped.
    pub fn log(&self, component: &str, event: impl Serialize) {
        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            session_id: self.session_id.clone(),
            component: component.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    pub fn log_request_started(&self, task: &str) {
        self.log(
            "Supervisor",
            serde_json::json!({
                "type": "RequestStarted",
                "task": task
            }),
        );
    }

    pub fn log_request_finished(&self, request_id: &str, completion: &impl Serialize) {
        self.log(
            "Supervisor",
            serde_json::json!({
                "type": "RequestFinished",
                "request_id": request_id,
                "completion": completion
            }),
        );
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

impl Observer for StructuredLogger {
    fn record_call(&self, record: &CallRecord) {
        let (ok, failure) = match &record.outcome {
            CallOutcome::Ok => (true, None),
            CallOutcome::Failed(kind) => (false, Some(kind.as_str())),
        };
        self.log(
            "Gateway",
            serde_json::json!({
                "type": "Call",
                "capability": record.capability,
                "method": record.method,
                "latency_ms": u64::try_from(record.latency.as_millis()).unwrap_or(u64::MAX),
                "ok": ok,
                "failure": failure
            }),
        );
    }

    fn record_breaker(&self, capability: &str, transition: BreakerTransition) {
        self.log(
            "Breaker",
            serde_json::json!({
                "type": "Transition",
                "capability": capability,
                "state": transition.as_str()
            }),
        );
    }

    fn record_notification(&self, capability: &str, kind: &str, payload: &Value) {
        self.log(
            "Worker",
            serde_json::json!({
                "type": "Notification",
                "capability": capability,
                "notification": kind,
                "payload": payload
            }),
        );
    }

    fn record_phase_transition(&self, request_id: &str, from: &str, to: &str) {
        self.log(
            "Supervisor",
            serde_json::json!({
                "type": "PhaseTransition",
                "request_id": request_id,
                "from": from,
                "to": to
            }),
        );
    }
}

#[cfg(test)]
#[path = "tests/structured_logger_tests.rs"]
mod tests;
