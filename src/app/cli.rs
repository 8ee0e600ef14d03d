use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "supervisor")]
#[command(about = "Routes a task between worker-process agents until it can be answered")]
#[command(version)]
pub struct Cli {
    /// The task to run (all arguments are joined)
    #[arg(trailing_var_arg = true)]
    pub task: Vec<String>,

    /// Orchestration config (defaults to $SUPERVISOR_CONFIG, ./supervisor.yaml, ~/.supervisor-agent/config.yaml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the decision ceiling from the config
    #[arg(short, long)]
    pub max_iterations: Option<u32>,

    /// Directory for events.jsonl (default: ~/.supervisor-agent/logs/<session>)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Print the full outcome as JSON instead of a summary
    #[arg(long)]
    pub json: bool,

    /// List configured capabilities and roles, then exit
    #[arg(long)]
    pub list_capabilities: bool,

    /// Internal: serve the worker protocol on stdio as a built-in stub
    #[arg(long, hide = true)]
    pub stub_worker: Option<String>,

    /// Internal: agents a stub decider walks through before responding
    #[arg(long, hide = true, value_delimiter = ',')]
    pub stub_plan: Vec<String>,
}

impl Cli {
    pub fn task_text(&self) -> String {
        self.task.join(" ").trim().to_string()
    }
}
