//! Terminal stand-in for the human role when no `human` capability is
//! configured: the escalation goes to stderr and the answer comes from stdin.
//!
//! Stdin is read on a plain OS thread feeding a channel. A blocking read
//! parked there never holds up runtime shutdown, and an escalation that
//! times out only drops its `recv`, so the next escalation still gets the
//! next line.

use async_trait::async_trait;
use std::io::BufRead;
use tokio::sync::{mpsc, Mutex};

use crate::gateway::CallError;
use crate::orchestrator::{Escalation, HumanLoop, Resolution};

pub struct ConsoleHuman {
    lines: Mutex<mpsc::Receiver<String>>,
}

impl ConsoleHuman {
    pub fn stdin() -> Self {
        Self::from_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// Reads replies line by line from `input` on a background thread.
    pub fn from_reader<R: BufRead + Send + 'static>(input: R) -> Self {
        Self::new(spawn_line_reader(input))
    }

    pub fn new(lines: mpsc::Receiver<String>) -> Self {
        Self {
            lines: Mutex::new(lines),
        }
    }
}

fn spawn_line_reader<R: BufRead + Send + 'static>(input: R) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    let spawned = std::thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            for line in input.lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        // Sender is gone with the closure; escalations see a closed console.
        tracing::warn!(error = %e, "could not start console reader");
    }
    rx
}

#[async_trait]
impl HumanLoop for ConsoleHuman {
    async fn escalate(&self, escalation: &Escalation) -> Result<Resolution, CallError> {
        eprintln!();
        eprintln!("[supervisor] Escalation: {}", escalation.reason);
        eprintln!("[supervisor] Type guidance for the supervisor and press Enter:");

        let line = self
            .lines
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| CallError::malformed("human", "stdin closed"))?;

        let text = line.trim();
        if text.is_empty() {
            return Err(CallError::malformed("human", "no reply on stdin"));
        }
        Ok(Resolution {
            resolution_text: text.to_string(),
        })
    }
}
