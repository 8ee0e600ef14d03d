//! Newline-delimited JSON envelopes exchanged with worker processes.
//!
//! Requests flow supervisor -> worker; responses, error envelopes and
//! notifications flow back. A response is recognised by an `id` plus a
//! `result` key (a `null` result is still a response).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Request envelope: `{"id": <int>, "method": <string>, "params": <object>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Error body carried by `{"id": <int>, "error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Unsolicited worker message: `{"notification": <string>, "payload": <any>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNotification {
    pub notification: String,
    #[serde(default)]
    pub payload: Value,
}

/// Any message a worker may write to its stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Response { id: u64, result: Value },
    Error { id: u64, error: RemoteErrorBody },
    Notification(WorkerNotification),
}

/// Kind given to error envelopes whose body does not match `RemoteErrorBody`.
pub const MALFORMED_ERROR_KIND: &str = "malformed_error";

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolError(pub String);

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error: {}", self.0)
    }
}

impl std::error::Error for ProtocolError {}

impl WorkerMessage {
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line.trim())
            .map_err(|e| ProtocolError(format!("invalid JSON: {}", e)))?;
        let Value::Object(mut object) = value else {
            return Err(ProtocolError("envelope is not a JSON object".to_string()));
        };

        if let Some(kind) = object.remove("notification") {
            let Value::String(notification) = kind else {
                return Err(ProtocolError("notification name must be a string".to_string()));
            };
            let payload = object.remove("payload").unwrap_or(Value::Null);
            return Ok(WorkerMessage::Notification(WorkerNotification {
                notification,
                payload,
            }));
        }

        let id = take_id(&mut object)?;

        // An unreadable body still resolves the call it names.
        if let Some(error) = object.remove("error") {
            let error = serde_json::from_value(error.clone()).unwrap_or_else(|e| RemoteErrorBody {
                kind: MALFORMED_ERROR_KIND.to_string(),
                message: format!("unreadable error body {}: {}", error, e),
                retryable: false,
            });
            return Ok(WorkerMessage::Error { id, error });
        }

        match object.remove("result") {
            Some(result) => Ok(WorkerMessage::Response { id, result }),
            None => Err(ProtocolError(format!(
                "envelope with id {} has neither result nor error",
                id
            ))),
        }
    }

    pub fn to_line(&self) -> String {
        let value = match self {
            WorkerMessage::Response { id, result } => {
                serde_json::json!({"id": id, "result": result})
            }
            WorkerMessage::Error { id, error } => serde_json::json!({"id": id, "error": error}),
            WorkerMessage::Notification(notification) => {
                serde_json::to_value(notification).unwrap_or(Value::Null)
            }
        };
        value.to_string()
    }
}

fn take_id(object: &mut Map<String, Value>) -> Result<u64, ProtocolError> {
    match object.remove("id") {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| ProtocolError(format!("correlation id {} is not a u64", n))),
        Some(other) => Err(ProtocolError(format!(
            "correlation id must be an integer, got {}",
            other
        ))),
        None => Err(ProtocolError("envelope has no id".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_response_with_null_result() {
        let msg = WorkerMessage::from_line(r#"{"id": 4, "result": null}"#).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Response {
                id: 4,
                result: Value::Null
            }
        );
    }

    #[test]
    fn test_parses_error_envelope() {
        let msg = WorkerMessage::from_line(
            r#"{"id": 9, "error": {"kind": "rate_limited", "message": "slow down", "retryable": true}}"#,
        )
        .unwrap();
        let WorkerMessage::Error { id, error } = msg else {
            panic!("expected error envelope");
        };
        assert_eq!(id, 9);
        assert_eq!(error.kind, "rate_limited");
        assert!(error.retryable);
    }

    #[test]
    fn test_retryable_defaults_to_false() {
        let msg =
            WorkerMessage::from_line(r#"{"id": 1, "error": {"kind": "bad", "message": "m"}}"#)
                .unwrap();
        assert!(matches!(msg, WorkerMessage::Error { error, .. } if !error.retryable));
    }

    #[test]
    fn test_unreadable_error_body_still_names_its_call() {
        let msg = WorkerMessage::from_line(r#"{"id": 1, "error": "boom"}"#).unwrap();
        let WorkerMessage::Error { id, error } = msg else {
            panic!("expected error envelope");
        };
        assert_eq!(id, 1);
        assert_eq!(error.kind, MALFORMED_ERROR_KIND);
        assert!(error.message.contains("boom"));
        assert!(!error.retryable);
    }

    #[test]
    fn test_parses_notification_without_payload() {
        let msg = WorkerMessage::from_line(r#"{"notification": "heartbeat"}"#).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Notification(WorkerNotification {
                notification: "heartbeat".to_string(),
                payload: Value::Null,
            })
        );
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        for line in [
            "not json",
            "[1, 2]",
            r#"{"result": 1}"#,
            r#"{"id": "abc", "result": 1}"#,
            r#"{"id": -3, "result": 1}"#,
            r#"{"id": 2}"#,
            r#"{"notification": 5}"#,
        ] {
            assert!(WorkerMessage::from_line(line).is_err(), "accepted: {line}");
        }
    }

    #[test]
    fn test_to_line_is_parsed_back() {
        let msg = WorkerMessage::Error {
            id: 3,
            error: RemoteErrorBody {
                kind: "method_not_found".to_string(),
                message: "no such method".to_string(),
                retryable: false,
            },
        };
        assert_eq!(WorkerMessage::from_line(&msg.to_line()).unwrap(), msg);
    }

    #[test]
    fn test_request_serializes_to_wire_shape() {
        let request = WorkerRequest {
            id: 12,
            method: "run".to_string(),
            params: serde_json::json!({"instructions": "go"}),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"id": 12, "method": "run", "params": {"instructions": "go"}})
        );
    }
}
