//! Starting worker processes for capabilities.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::handle::WorkerHandle;
use crate::config::CapabilityConfig;
use crate::observer::Observer;

/// Produces a live `WorkerHandle` for a capability. The gateway calls this
/// lazily and again after a crash.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, capability: &str, config: &CapabilityConfig) -> Result<WorkerHandle>;
}

/// Launches each capability as a child process speaking the worker protocol
/// on stdin/stdout. Stderr is drained into the debug log.
pub struct ProcessLauncher {
    io_timeout: Duration,
    shutdown_timeout: Duration,
    observer: Arc<dyn Observer>,
}

impl ProcessLauncher {
    pub fn new(io_timeout: Duration, shutdown_timeout: Duration, observer: Arc<dyn Observer>) -> Self {
        Self {
            io_timeout,
            shutdown_timeout,
            observer,
        }
    }
}

/// Resolves `command` on `PATH`, falling back to the literal value.
pub fn resolve_command(command: &str) -> PathBuf {
    which::which(command).unwrap_or_else(|_| PathBuf::from(command))
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, capability: &str, config: &CapabilityConfig) -> Result<WorkerHandle> {
        let program = resolve_command(&config.command);

        let mut command = Command::new(&program);
        command.args(&config.args).envs(&config.env);
        if let Some(ref dir) = config.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().with_context(|| {
            format!(
                "Failed to spawn worker for '{}' ({})",
                capability,
                program.display()
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .context("Failed to get stdin from worker process")?;
        let stdout = child
            .stdout
            .take()
            .context("Failed to get stdout from worker process")?;
        let stderr = child
            .stderr
            .take()
            .context("Failed to get stderr from worker process")?;

        tracing::info!(capability, pid = ?child.id(), program = %program.display(), "worker started");

        let name = capability.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(capability = %name, "stderr: {}", line);
            }
        });

        let handle = WorkerHandle::from_streams(
            capability,
            stdout,
            stdin,
            self.io_timeout,
            Arc::clone(&self.observer),
        )
        .with_child(child, self.shutdown_timeout);
        Ok(handle)
    }
}
