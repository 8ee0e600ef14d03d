use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use crate::app::cli::Cli;
use crate::app::console::ConsoleHuman;
use crate::config::OrchestratorConfig;
use crate::gateway::ToolGateway;
use crate::observer::Observer;
use crate::orchestrator::{Completion, RequestOutcome, Supervisor};
use crate::resilience::{BreakerStatus, ResilientCaller};
use crate::structured_logger::StructuredLogger;
use crate::worker::ProcessLauncher;

const SUMMARY_WIDTH: usize = 120;

pub async fn run_headless(cli: Cli) -> Result<()> {
    let working_dir = std::env::current_dir().context("Failed to read current directory")?;
    let (mut config, config_path) =
        OrchestratorConfig::discover(cli.config.as_deref(), &working_dir)?;
    if let Some(max) = cli.max_iterations {
        config.limits.max_iterations = max;
        config.validate()?;
    }
    tracing::info!(config = %config_path.display(), "loaded orchestration config");

    if cli.list_capabilities {
        print!("{}", describe_config(&config));
        return Ok(());
    }

    let task = cli.task_text();
    if task.is_empty() {
        bail!("No task given. Usage: supervisor [OPTIONS] <TASK>...");
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let log_dir = match cli.log_dir {
        Some(dir) => dir,
        None => default_log_dir(&session_id)?,
    };
    let logger = Arc::new(StructuredLogger::new(&session_id, &log_dir)?);
    let observer: Arc<dyn Observer> = logger.clone();
    logger.log_request_started(&task);

    let launcher = Arc::new(ProcessLauncher::new(
        config.timeouts.read(),
        config.timeouts.shutdown(),
        Arc::clone(&observer),
    ));
    let gateway = Arc::new(ToolGateway::new(
        config.capabilities.clone(),
        launcher,
        Arc::clone(&observer),
    ));
    let caller = Arc::new(ResilientCaller::new(
        gateway.clone(),
        &config.resilience,
        Arc::clone(&observer),
    ));

    let mut supervisor =
        Supervisor::from_config(&config, caller.clone()).with_observer(Arc::clone(&observer));
    if !config.has_human_capability() {
        supervisor = supervisor.with_human(Arc::new(ConsoleHuman::stdin()));
    }

    let outcome = supervisor.run(&task).await;
    tracing::info!(
        request_id = outcome.state.request_id(),
        complete = outcome.is_complete(),
        "request finished"
    );
    let decider = caller.status(&config.roles.decider);
    if decider.consecutive_failures > 0 {
        tracing::warn!(
            capability = %config.roles.decider,
            failures = decider.consecutive_failures,
            open = decider.open,
            "decision capability was failing at the end of the request"
        );
    }
    let live = gateway.live_workers().await;
    tracing::debug!(workers = ?live, "stopping workers");
    gateway.shutdown().await;
    logger.log_request_finished(outcome.state.request_id(), &outcome.state.completion());

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print!("{}", format_summary(&outcome, &caller.statuses()));
        eprintln!("[supervisor] Events logged to {}", logger.path().display());
    }
    Ok(())
}

fn default_log_dir(session_id: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".supervisor-agent").join("logs").join(session_id))
}

fn describe_config(config: &OrchestratorConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Capabilities:");
    for (name, capability) in &config.capabilities {
        let role = role_of(config, name).map(|r| format!(" ({})", r)).unwrap_or_default();
        let _ = writeln!(
            out,
            "  {}{}: {} {}",
            name,
            role,
            capability.command,
            capability.args.join(" ")
        );
    }
    let _ = writeln!(out, "Agents: {}", config.agent_names().join(", "));
    out
}

fn role_of(config: &OrchestratorConfig, name: &str) -> Option<&'static str> {
    let roles = &config.roles;
    if roles.decider == name {
        Some("decider")
    } else if roles.responder == name {
        Some("responder")
    } else if roles.human == name {
        Some("human")
    } else if roles.support.as_deref() == Some(name) {
        Some("support")
    } else if roles.verifier == name {
        Some("verifier")
    } else {
        None
    }
}

/// Human-readable report of a finished request.
pub fn format_summary(
    outcome: &RequestOutcome,
    breakers: &BTreeMap<String, BreakerStatus>,
) -> String {
    let state = &outcome.state;
    let mut out = String::new();

    let status = match state.completion() {
        Some(Completion::Complete) => "complete".to_string(),
        Some(Completion::Incomplete { reason }) => format!("incomplete ({})", reason),
        None => "unfinished".to_string(),
    };
    let _ = writeln!(out, "Request {}: {}", state.request_id(), status);
    let _ = writeln!(out, "Task: {}", truncate(state.task_description(), SUMMARY_WIDTH));

    let counters = state.counters();
    let _ = writeln!(
        out,
        "Turns: {}  Fix cycles: {}  Escalations: {}",
        counters.turns, counters.fix_cycles, counters.escalations
    );
    if state.quality_score().is_some() || state.confidence().is_some() {
        let _ = writeln!(
            out,
            "Quality: {}  Confidence: {}",
            score_text(state.quality_score()),
            score_text(state.confidence())
        );
    }
    if !state.support_requests().is_empty() {
        let _ = writeln!(out, "Support requests: {}", state.support_requests().len());
    }

    if !state.history().is_empty() {
        let _ = writeln!(out, "History:");
        for (i, turn) in state.history().iter().enumerate() {
            let _ = writeln!(
                out,
                "  {}. {} [{}] {}",
                i + 1,
                turn.agent,
                turn.status.as_str(),
                truncate(&turn.summary, SUMMARY_WIDTH)
            );
        }
    }

    if !state.artifact_refs().is_empty() {
        let _ = writeln!(out, "Artifacts:");
        for (name, artifact) in state.artifact_refs() {
            let _ = writeln!(
                out,
                "  {} -> {} ({})",
                name, artifact.location, artifact.producer
            );
        }
    }

    for note in state.annotations() {
        let _ = writeln!(out, "Note: {}", note);
    }

    let open: Vec<String> = breakers
        .iter()
        .filter(|(_, status)| status.open)
        .map(|(name, status)| {
            format!(
                "{} ({}/{} failures)",
                name, status.consecutive_failures, status.threshold
            )
        })
        .collect();
    if !open.is_empty() {
        let _ = writeln!(out, "Open circuits: {}", open.join(", "));
    }

    match (&outcome.response, &outcome.delivery_error) {
        (Some(response), _) => {
            let text = response
                .get("text")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| response.to_string());
            let _ = writeln!(out, "\n{}", text);
        }
        (None, Some(error)) => {
            let _ = writeln!(out, "Delivery failed: {}", error);
        }
        (None, None) => {}
    }
    out
}

fn score_text(score: Option<f64>) -> String {
    score.map(|s| format!("{:.2}", s)).unwrap_or_else(|| "-".to_string())
}

fn truncate(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() <= max_chars {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
#[path = "tests/headless_tests.rs"]
mod tests;
