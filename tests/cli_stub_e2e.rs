//! Runs the real binary against its own built-in stub workers.

use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_supervisor");

fn write_config(dir: &Path, plan: &str) -> std::path::PathBuf {
    let stub = |name: &str, extra: &str| {
        format!(
            "  {name}:\n    command: \"{BIN}\"\n    args: [\"--stub-worker\", \"{name}\"{extra}]\n"
        )
    };
    let mut yaml = String::from("capabilities:\n");
    yaml.push_str(&stub(
        "supervisor-decide",
        &format!(", \"--stub-plan\", \"{plan}\""),
    ));
    for name in ["research", "write", "verify", "responder"] {
        yaml.push_str(&stub(name, ""));
    }
    yaml.push_str("resilience:\n  base_delay_ms: 10\ntimeouts:\n  call_secs: 20\n  shutdown_secs: 2\n");

    let path = dir.join("supervisor.yaml");
    std::fs::write(&path, yaml).expect("write config");
    path
}

fn run(dir: &TempDir, args: &[&str]) -> Output {
    Command::new(BIN)
        .current_dir(dir.path())
        .env_remove("SUPERVISOR_CONFIG")
        .args(args)
        .output()
        .expect("spawn supervisor")
}

#[test]
fn full_request_through_stub_workers() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "research,write,verify");
    let logs = dir.path().join("logs");

    let output = run(
        &dir,
        &[
            "--config",
            config.to_str().unwrap(),
            "--log-dir",
            logs.to_str().unwrap(),
            "--json",
            "write a haiku",
        ],
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let outcome: Value = serde_json::from_slice(&output.stdout).expect("json outcome");
    let state = &outcome["state"];
    assert_eq!(state["completion"]["status"], "complete");
    assert_eq!(state["task_description"], "write a haiku");

    let agents: Vec<&str> = state["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|turn| turn["agent"].as_str().unwrap())
        .collect();
    assert_eq!(agents, vec!["research", "write", "verify"]);
    assert!(state["artifact_refs"]["notes/write"].is_object());
    assert!(outcome["response"]["text"].is_string());

    let events = std::fs::read_to_string(logs.join("events.jsonl")).expect("events log");
    assert!(events.lines().count() > 5);
    assert!(events.contains("\"RequestFinished\""));
}

#[test]
fn config_is_discovered_in_working_directory() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "research");

    let output = run(&dir, &["--list-capabilities"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("supervisor-decide (decider)"));
    assert!(stdout.contains("Agents: research, verify, write"));
}

#[test]
fn missing_task_fails() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "research");

    let output = run(&dir, &["--config", config.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No task given"));
}
