//! Test doubles shared across modules: in-memory workers, a scripted
//! `ToolCaller` and an observer that records everything it sees.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::config::CapabilityConfig;
use crate::gateway::{CallError, ToolCaller};
use crate::observer::{BreakerTransition, CallRecord, Observer};
use crate::worker::protocol::WorkerRequest;
use crate::worker::{WorkerHandle, WorkerLauncher};

#[derive(Default)]
pub struct RecordingObserver {
    calls: Mutex<Vec<CallRecord>>,
    breakers: Mutex<Vec<(String, BreakerTransition)>>,
    notifications: Mutex<Vec<(String, String, Value)>>,
    phases: Mutex<Vec<(String, String, String)>>,
}

impl RecordingObserver {
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn breakers(&self) -> Vec<(String, BreakerTransition)> {
        self.breakers.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<(String, String, Value)> {
        self.notifications.lock().unwrap().clone()
    }

    /// `(from, to)` pairs in order, across all requests.
    pub fn phases(&self) -> Vec<(String, String)> {
        self.phases
            .lock()
            .unwrap()
            .iter()
            .map(|(_, from, to)| (from.clone(), to.clone()))
            .collect()
    }
}

impl Observer for RecordingObserver {
    fn record_call(&self, record: &CallRecord) {
        self.calls.lock().unwrap().push(record.clone());
    }

    fn record_breaker(&self, capability: &str, transition: BreakerTransition) {
        self.breakers
            .lock()
            .unwrap()
            .push((capability.to_string(), transition));
    }

    fn record_notification(&self, capability: &str, kind: &str, payload: &Value) {
        self.notifications.lock().unwrap().push((
            capability.to_string(),
            kind.to_string(),
            payload.clone(),
        ));
    }

    fn record_phase_transition(&self, request_id: &str, from: &str, to: &str) {
        self.phases.lock().unwrap().push((
            request_id.to_string(),
            from.to_string(),
            to.to_string(),
        ));
    }
}

/// The worker side of an in-memory channel.
pub struct FakeWorker {
    requests: BufReader<DuplexStream>,
    responses: DuplexStream,
}

impl FakeWorker {
    pub async fn try_next_request(&mut self) -> Option<WorkerRequest> {
        let mut line = String::new();
        match self.requests.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => serde_json::from_str(&line).ok(),
        }
    }

    pub async fn next_request(&mut self) -> WorkerRequest {
        self.try_next_request()
            .await
            .expect("worker expected another request")
    }

    pub async fn respond(&mut self, id: u64, result: Value) {
        self.send_line(&json!({"id": id, "result": result})).await;
    }

    pub async fn send_line(&mut self, value: &Value) {
        self.send_raw(format!("{}\n", value).as_bytes()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let _ = self.responses.write_all(bytes).await;
        let _ = self.responses.flush().await;
    }
}

/// A handle wired to an in-memory worker instead of a process.
pub fn fake_worker(
    capability: &str,
    io_timeout: Duration,
    observer: Arc<dyn Observer>,
) -> (WorkerHandle, FakeWorker) {
    let (to_worker, from_supervisor) = duplex(64 * 1024);
    let (to_supervisor, from_worker) = duplex(64 * 1024);
    let handle =
        WorkerHandle::from_streams(capability, from_worker, to_worker, io_timeout, observer);
    let worker = FakeWorker {
        requests: BufReader::new(from_supervisor),
        responses: to_supervisor,
    };
    (handle, worker)
}

/// Maps a request to a result; `None` makes the worker exit.
pub type WorkerScript = Arc<dyn Fn(&str, &WorkerRequest) -> Option<Value> + Send + Sync>;

/// Launcher that starts scripted in-memory workers and counts launches.
pub struct InMemoryLauncher {
    script: WorkerScript,
    launches: AtomicUsize,
    unlaunchable: HashSet<String>,
    observer: Arc<dyn Observer>,
}

impl InMemoryLauncher {
    pub fn new(script: WorkerScript, observer: Arc<dyn Observer>) -> Self {
        Self {
            script,
            launches: AtomicUsize::new(0),
            unlaunchable: HashSet::new(),
            observer,
        }
    }

    /// Workers answer `{"capability", "method", "params"}`; method `crash` exits instead.
    pub fn echo(observer: Arc<dyn Observer>) -> Self {
        Self::new(
            Arc::new(|capability, request| {
                (request.method != "crash").then(|| {
                    json!({
                        "capability": capability,
                        "method": request.method,
                        "params": request.params
                    })
                })
            }),
            observer,
        )
    }

    pub fn refusing(mut self, capability: &str) -> Self {
        self.unlaunchable.insert(capability.to_string());
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for InMemoryLauncher {
    async fn launch(&self, capability: &str, _config: &CapabilityConfig) -> Result<WorkerHandle> {
        tokio::task::yield_now().await;
        if self.unlaunchable.contains(capability) {
            anyhow::bail!("no such program for '{}'", capability);
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (handle, mut worker) =
            fake_worker(capability, Duration::from_secs(300), Arc::clone(&self.observer));
        let script = Arc::clone(&self.script);
        let name = capability.to_string();
        tokio::spawn(async move {
            while let Some(request) = worker.try_next_request().await {
                match script(&name, &request) {
                    Some(result) => worker.respond(request.id, result).await,
                    None => break,
                }
            }
        });
        Ok(handle)
    }
}

/// One scripted reply.
#[derive(Clone)]
pub enum Reply {
    Return(Result<Value, CallError>),
    /// Never answers; only a caller-side timeout ends the call.
    Hang,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub capability: String,
    pub method: String,
    pub params: Value,
}

/// `ToolCaller` that replays queued replies per `(capability, method)`.
///
/// Once a queue is empty the `always` reply for that pair is used; with
/// neither, the call fails as malformed.
#[derive(Default)]
pub struct ScriptedCaller {
    queued: Mutex<HashMap<(String, String), VecDeque<Reply>>>,
    always: Mutex<HashMap<(String, String), Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedCaller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, capability: &str, method: &str, reply: Reply) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry((capability.to_string(), method.to_string()))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn push_ok(&self, capability: &str, method: &str, value: Value) -> &Self {
        self.push(capability, method, Reply::Return(Ok(value)))
    }

    pub fn always(&self, capability: &str, method: &str, reply: Reply) -> &Self {
        self.always
            .lock()
            .unwrap()
            .insert((capability.to_string(), method.to_string()), reply);
        self
    }

    pub fn always_ok(&self, capability: &str, method: &str, value: Value) -> &Self {
        self.always(capability, method, Reply::Return(Ok(value)))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, capability: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.capability == capability)
            .collect()
    }

    /// Capabilities in call order.
    pub fn call_sequence(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.capability).collect()
    }
}

#[async_trait]
impl ToolCaller for ScriptedCaller {
    async fn call(
        &self,
        capability: &str,
        method: &str,
        params: Value,
        _timeout: Duration,
    ) -> Result<Value, CallError> {
        self.calls.lock().unwrap().push(RecordedCall {
            capability: capability.to_string(),
            method: method.to_string(),
            params,
        });

        let key = (capability.to_string(), method.to_string());
        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        let reply = queued.or_else(|| self.always.lock().unwrap().get(&key).cloned());

        match reply {
            Some(Reply::Return(result)) => result,
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(CallError::malformed(
                capability,
                format!("no scripted reply for {}.{}", capability, method),
            )),
        }
    }
}

/// Decider reply in the directive wire shape.
pub fn directive(action: &str, target: Option<&str>, confidence: f64) -> Value {
    json!({
        "action": action,
        "target": target,
        "instructions": format!("{} {}", action.to_lowercase(), target.unwrap_or("")).trim().to_string(),
        "confidence": confidence,
        "reasoning": "scripted"
    })
}

/// Agent reply with `status: done` and the given delta.
pub fn done(delta: Value) -> Value {
    json!({"status": "done", "delta": delta})
}
