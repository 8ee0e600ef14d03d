//! Uniform call surface over the pool of worker processes.
//!
//! One `WorkerHandle` per capability, started on first use and replaced after
//! a crash. The handle map sits behind a single async lock held across
//! lookup, launch and removal so a capability never gets two workers.

mod error;

pub use error::CallError;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::CapabilityConfig;
use crate::observer::{CallOutcome, CallRecord, Observer};
use crate::worker::{WorkerHandle, WorkerLauncher};

/// Anything that can invoke a method on a named capability.
///
/// The gateway implements it directly; the resilience layer wraps another
/// `ToolCaller` and implements it again.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    async fn call(
        &self,
        capability: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError>;
}

pub struct ToolGateway {
    registry: BTreeMap<String, CapabilityConfig>,
    launcher: Arc<dyn WorkerLauncher>,
    workers: Mutex<HashMap<String, Arc<WorkerHandle>>>,
    observer: Arc<dyn Observer>,
}

impl ToolGateway {
    pub fn new(
        registry: BTreeMap<String, CapabilityConfig>,
        launcher: Arc<dyn WorkerLauncher>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            registry,
            launcher,
            workers: Mutex::new(HashMap::new()),
            observer,
        }
    }

    /// Capabilities with a running worker, sorted.
    pub async fn live_workers(&self) -> Vec<String> {
        let workers = self.workers.lock().await;
        let mut live: Vec<String> = workers
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(name, _)| name.clone())
            .collect();
        live.sort();
        live
    }

    /// Stops every worker. Later calls start fresh ones.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<WorkerHandle>> = {
            let mut workers = self.workers.lock().await;
            workers.drain().map(|(_, handle)| handle).collect()
        };
        tracing::debug!(count = handles.len(), "shutting down workers");
        futures::future::join_all(handles.iter().map(|handle| handle.shutdown())).await;
    }

    async fn handle_for(&self, capability: &str) -> Result<Arc<WorkerHandle>, CallError> {
        let config = self
            .registry
            .get(capability)
            .ok_or_else(|| CallError::UnknownCapability(capability.to_string()))?;

        let mut workers = self.workers.lock().await;
        if let Some(handle) = workers.get(capability) {
            if handle.is_alive() {
                return Ok(Arc::clone(handle));
            }
            tracing::info!(capability, "replacing dead worker");
            workers.remove(capability);
        }

        let handle = self
            .launcher
            .launch(capability, config)
            .await
            .map_err(|e| CallError::LaunchFailed {
                capability: capability.to_string(),
                reason: format!("{:#}", e),
            })?;
        let handle = Arc::new(handle);
        workers.insert(capability.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops `handle` from the pool unless it was already replaced.
    async fn evict(&self, capability: &str, handle: &Arc<WorkerHandle>) {
        let mut workers = self.workers.lock().await;
        if workers
            .get(capability)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
        {
            workers.remove(capability);
        }
    }

    async fn dispatch(
        &self,
        capability: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let handle = self.handle_for(capability).await?;
        match handle.invoke(method, params, timeout).await {
            Ok(result) => Ok(result),
            Err(error) => {
                if !handle.is_alive() {
                    self.evict(capability, &handle).await;
                }
                Err(CallError::from_invoke(capability, method, error))
            }
        }
    }
}

#[async_trait]
impl ToolCaller for ToolGateway {
    async fn call(
        &self,
        capability: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let started = Instant::now();
        let result = self.dispatch(capability, method, params, timeout).await;

        let outcome = match &result {
            Ok(_) => CallOutcome::Ok,
            Err(e) => CallOutcome::Failed(e.kind().to_string()),
        };
        self.observer.record_call(&CallRecord {
            capability: capability.to_string(),
            method: method.to_string(),
            latency: started.elapsed(),
            outcome,
        });

        result
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
