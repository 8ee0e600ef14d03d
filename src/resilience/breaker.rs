//! Per-capability circuit breakers.
//!
//! Closed: calls pass, failed sequences are counted. At the threshold the
//! breaker opens and rejects calls until the cool-down elapses; then exactly
//! one trial call is admitted. Its success closes the breaker, its failure
//! re-opens it with a fresh cool-down.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::observer::BreakerTransition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// First call after the cool-down; gets a single attempt.
    Trial,
    Rejected(Duration),
}

/// Read-only view of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub open: bool,
    pub consecutive_failures: u32,
    pub threshold: u32,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open: bool,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

pub struct CircuitBreakers {
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, BreakerState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn admit(&self, capability: &str) -> Admission {
        let now = Instant::now();
        let mut states = self.states();
        let state = states.entry(capability.to_string()).or_default();

        if !state.open {
            return Admission::Normal;
        }

        let opened_at = state.opened_at.unwrap_or(now);
        let since_open = now.saturating_duration_since(opened_at);
        if since_open < self.cooldown {
            return Admission::Rejected(self.cooldown - since_open);
        }

        // A trial that never reported back within a cool-down no longer blocks.
        if let Some(started) = state.trial_started {
            let since_trial = now.saturating_duration_since(started);
            if since_trial < self.cooldown {
                return Admission::Rejected(self.cooldown - since_trial);
            }
        }

        state.trial_started = Some(now);
        Admission::Trial
    }

    pub fn record_success(&self, capability: &str) -> Option<BreakerTransition> {
        let mut states = self.states();
        let state = states.entry(capability.to_string()).or_default();
        state.consecutive_failures = 0;
        state.trial_started = None;
        if state.open {
            state.open = false;
            state.opened_at = None;
            Some(BreakerTransition::Closed)
        } else {
            None
        }
    }

    pub fn record_failure(&self, capability: &str) -> Option<BreakerTransition> {
        let now = Instant::now();
        let mut states = self.states();
        let state = states.entry(capability.to_string()).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.open {
            state.opened_at = Some(now);
            state.trial_started = None;
            return Some(BreakerTransition::Opened);
        }

        if state.consecutive_failures >= self.threshold {
            state.open = true;
            state.opened_at = Some(now);
            state.trial_started = None;
            return Some(BreakerTransition::Opened);
        }
        None
    }

    pub fn status(&self, capability: &str) -> BreakerStatus {
        let states = self.states();
        let (open, consecutive_failures) = states
            .get(capability)
            .map(|s| (s.open, s.consecutive_failures))
            .unwrap_or((false, 0));
        BreakerStatus {
            open,
            consecutive_failures,
            threshold: self.threshold,
        }
    }

    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        self.states()
            .iter()
            .map(|(name, s)| {
                (
                    name.clone(),
                    BreakerStatus {
                        open: s.open,
                        consecutive_failures: s.consecutive_failures,
                        threshold: self.threshold,
                    },
                )
            })
            .collect()
    }
}
