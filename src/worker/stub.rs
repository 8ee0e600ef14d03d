//! Deterministic built-in worker used by `supervisor --stub-worker`.
//!
//! Speaks the worker protocol on stdin/stdout so a full request can run
//! without any external tools. A stub named as the decider walks through its
//! plan in order, then asks for a response.

use anyhow::Result;
use serde_json::{json, Value};
use std::io::{BufRead, Write};

use super::protocol::{RemoteErrorBody, WorkerMessage, WorkerRequest};

pub struct StubWorker {
    name: String,
    plan: Vec<String>,
    runs: u64,
}

impl StubWorker {
    pub fn new(name: &str, plan: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            plan,
            runs: 0,
        }
    }

    pub fn run_stdio(mut self) -> Result<()> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        self.serve(stdin.lock(), stdout.lock())
    }

    pub fn serve<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> Result<()> {
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let request: WorkerRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    eprintln!("[stub:{}] ignoring unparseable request: {}", self.name, e);
                    continue;
                }
            };

            let reply = match self.handle(&request, &mut output) {
                Ok(result) => WorkerMessage::Response {
                    id: request.id,
                    result,
                },
                Err(error) => WorkerMessage::Error {
                    id: request.id,
                    error,
                },
            };
            writeln!(output, "{}", reply.to_line())?;
            output.flush()?;
        }
        Ok(())
    }

    fn handle<W: Write>(
        &mut self,
        request: &WorkerRequest,
        output: &mut W,
    ) -> Result<Value, RemoteErrorBody> {
        match request.method.as_str() {
            "decide" => Ok(self.decide(&request.params)),
            "run" => {
                let progress = json!({
                    "notification": "progress",
                    "payload": {"agent": self.name, "stage": "started"}
                });
                writeln!(output, "{}", progress).map_err(io_error)?;
                Ok(self.run(&request.params))
            }
            "respond" => Ok(respond(&request.params)),
            "escalate" => Ok(json!({
                "resolution_text": format!("proceed ({})", request.params["reason"].as_str().unwrap_or("no reason"))
            })),
            other => Err(RemoteErrorBody {
                kind: "method_not_found".to_string(),
                message: format!("stub worker '{}' has no method '{}'", self.name, other),
                retryable: false,
            }),
        }
    }

    fn decide(&self, params: &Value) -> Value {
        let done = params["history"]
            .as_array()
            .map(|history| {
                history
                    .iter()
                    .filter(|turn| {
                        turn["agent"]
                            .as_str()
                            .is_some_and(|agent| self.plan.iter().any(|step| step == agent))
                    })
                    .count()
            })
            .unwrap_or(0);
        let task = params["task_description"].as_str().unwrap_or_default();

        match self.plan.get(done) {
            Some(next) => json!({
                "action": "CONTINUE",
                "target": next,
                "instructions": format!("Step {} of {}: {}", done + 1, self.plan.len(), task),
                "confidence": 0.9,
                "reasoning": format!("{} is next in the plan", next)
            }),
            None => json!({
                "action": "RESPOND",
                "instructions": "Summarize the results",
                "confidence": 0.95,
                "reasoning": "every planned step has run"
            }),
        }
    }

    fn run(&mut self, params: &Value) -> Value {
        self.runs += 1;
        let instructions = params["instructions"].as_str().unwrap_or_default();

        let mut artifacts = serde_json::Map::new();
        artifacts.insert(
            format!("notes/{}", self.name),
            json!(format!("memory://{}/{}", self.name, self.runs)),
        );
        let mut delta = json!({
            "summary": format!("{} completed: {}", self.name, instructions),
            "artifacts": artifacts
        });
        if self.name == "verify" {
            delta["passed"] = json!(true);
            delta["quality_score"] = json!(0.9);
        }

        json!({"status": "done", "delta": delta})
    }
}

fn respond(params: &Value) -> Value {
    let state = &params["state"];
    let agents: Vec<&str> = state["history"]
        .as_array()
        .map(|history| history.iter().filter_map(|t| t["agent"].as_str()).collect())
        .unwrap_or_default();
    json!({
        "text": format!(
            "{} (agents: {})",
            state["task_description"].as_str().unwrap_or_default(),
            agents.join(" -> ")
        ),
        "artifacts": state["artifact_refs"].clone()
    })
}

fn io_error(e: std::io::Error) -> RemoteErrorBody {
    RemoteErrorBody {
        kind: "io".to_string(),
        message: e.to_string(),
        retryable: true,
    }
}
