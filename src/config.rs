use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that points at a config file when `--config` is absent.
pub const CONFIG_ENV_VAR: &str = "SUPERVISOR_CONFIG";

/// File name looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "supervisor.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Capability name -> how to launch the worker process backing it.
    pub capabilities: BTreeMap<String, CapabilityConfig>,
    #[serde(default)]
    pub roles: RoleConfig,
    #[serde(default)]
    pub limits: LoopLimits,
    #[serde(default)]
    pub resilience: ResiliencePolicy,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CapabilityConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Overrides `timeouts.call_secs` for this capability.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
}

#[cfg(test)]
impl CapabilityConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            call_timeout_secs: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Fixed capability names the loop routes to outside of regular agents.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoleConfig {
    #[serde(default = "default_decider")]
    pub decider: String,
    #[serde(default = "default_responder")]
    pub responder: String,
    #[serde(default = "default_human")]
    pub human: String,
    /// Agent dispatched when another agent reports `needs_support`.
    #[serde(default)]
    pub support: Option<String>,
    /// Agent whose failed turns count as verify/fix cycles.
    #[serde(default = "default_verifier")]
    pub verifier: String,
}

fn default_decider() -> String {
    "supervisor-decide".to_string()
}

fn default_responder() -> String {
    "responder".to_string()
}

fn default_human() -> String {
    "human".to_string()
}

fn default_verifier() -> String {
    "verify".to_string()
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            decider: default_decider(),
            responder: default_responder(),
            human: default_human(),
            support: None,
            verifier: default_verifier(),
        }
    }
}

impl RoleConfig {
    /// True if `name` is one of the fixed roles that never act as a regular agent.
    pub fn is_reserved(&self, name: &str) -> bool {
        name == self.decider || name == self.responder || name == self.human
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoopLimits {
    /// Global ceiling on decision turns per request. Default: 30
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Failed verification rounds before responding with what exists. Default: 3
    #[serde(default = "default_max_fix_cycles")]
    pub max_fix_cycles: u32,
    /// Support rounds per dispatch before the turn is recorded unresolved. Default: 2
    #[serde(default = "default_max_support_rounds")]
    pub max_support_rounds: u32,
    /// Escalations per request before giving up with a partial result. Default: 3
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,
    /// Directives below this confidence are escalated. Default: 0.5
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_max_iterations() -> u32 {
    30
}

fn default_max_fix_cycles() -> u32 {
    3
}

fn default_max_support_rounds() -> u32 {
    2
}

fn default_max_escalations() -> u32 {
    3
}

fn default_confidence_threshold() -> f64 {
    0.5
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_fix_cycles: default_max_fix_cycles(),
            max_support_rounds: default_max_support_rounds(),
            max_escalations: default_max_escalations(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// Retry and circuit breaker tuning shared by every capability.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResiliencePolicy {
    /// Attempts per call for transient failures. Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds. Default: 200
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor between consecutive retry delays. Default: 2.0
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on a single retry delay in milliseconds. Default: 10000
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Failed call sequences that open the breaker. Default: 5
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Seconds an open breaker rejects calls before a trial. Default: 30
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

impl ResiliencePolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("resilience.max_attempts must be at least 1");
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "resilience.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            );
        }
        if self.breaker_threshold == 0 {
            anyhow::bail!("resilience.breaker_threshold must be at least 1");
        }
        if self.max_delay_ms < self.base_delay_ms {
            anyhow::bail!("resilience.max_delay_ms must not be below base_delay_ms");
        }
        Ok(())
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimeoutConfig {
    /// Per-call timeout for worker invocations. Default: 120
    #[serde(default = "default_call_secs")]
    pub call_secs: u64,
    /// Upper bound on any single channel read or write. Default: 300
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,
    /// How long an escalation may wait for a human. Default: 600
    #[serde(default = "default_escalation_secs")]
    pub escalation_secs: u64,
    /// Grace period for worker processes to exit on shutdown. Default: 5
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

fn default_call_secs() -> u64 {
    120
}

fn default_read_secs() -> u64 {
    300
}

fn default_escalation_secs() -> u64 {
    600
}

fn default_shutdown_secs() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_secs: default_call_secs(),
            read_secs: default_read_secs(),
            escalation_secs: default_escalation_secs(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn call(&self) -> Duration {
        Duration::from_secs(self.call_secs)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn escalation(&self) -> Duration {
        Duration::from_secs(self.escalation_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the config path (explicit, env var, working dir, home) and loads it.
    pub fn discover(explicit: Option<&Path>, working_dir: &Path) -> Result<(Self, PathBuf)> {
        let path = resolve_config_path(explicit, working_dir).with_context(|| {
            format!(
                "No config found: pass --config, set {}, or create ./{}",
                CONFIG_ENV_VAR, LOCAL_CONFIG_FILE
            )
        })?;
        let config = Self::load(&path)?;
        Ok((config, path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.capabilities.is_empty() {
            anyhow::bail!("At least one capability must be configured");
        }

        for (name, capability) in &self.capabilities {
            if capability.command.trim().is_empty() {
                anyhow::bail!("Capability '{}' has an empty command", name);
            }
        }

        if !self.capabilities.contains_key(&self.roles.decider) {
            anyhow::bail!(
                "Decider capability '{}' not found in capabilities configuration",
                self.roles.decider
            );
        }

        if !self.capabilities.contains_key(&self.roles.responder) {
            anyhow::bail!(
                "Responder capability '{}' not found in capabilities configuration",
                self.roles.responder
            );
        }

        if let Some(ref support) = self.roles.support {
            if !self.capabilities.contains_key(support) || self.roles.is_reserved(support) {
                anyhow::bail!(
                    "Support agent '{}' must be a configured, non-reserved capability",
                    support
                );
            }
        }

        let threshold = self.limits.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!(
                "limits.confidence_threshold must be within [0, 1], got {}",
                threshold
            );
        }
        if self.limits.max_iterations == 0 || self.limits.max_fix_cycles == 0 {
            anyhow::bail!("limits.max_iterations and limits.max_fix_cycles must be at least 1");
        }

        if self.timeouts.call_secs == 0 || self.timeouts.read_secs == 0 {
            anyhow::bail!("timeouts.call_secs and timeouts.read_secs must be at least 1");
        }

        self.resilience.validate()?;

        Ok(())
    }

    /// Capabilities that act as dispatchable agents (everything except fixed roles).
    pub fn agent_names(&self) -> Vec<String> {
        self.capabilities
            .keys()
            .filter(|name| !self.roles.is_reserved(name))
            .cloned()
            .collect()
    }

    /// True if a worker process backs the human-in-the-loop role.
    pub fn has_human_capability(&self) -> bool {
        self.capabilities.contains_key(&self.roles.human)
    }

    pub fn call_timeout_for(&self, capability: &str) -> Duration {
        self.capabilities
            .get(capability)
            .and_then(|c| c.call_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.timeouts.call())
    }
}

fn resolve_config_path(explicit: Option<&Path>, working_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let local = working_dir.join(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }

    let home = dirs::home_dir()?.join(".supervisor-agent").join("config.yaml");
    home.is_file().then_some(home)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
