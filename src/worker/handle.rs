//! One live worker: its channel, the in-flight request table and the
//! background reader that resolves pending calls.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::channel::{ChannelError, FrameReader, FrameWriter, Received};
use super::protocol::{RemoteErrorBody, WorkerMessage, WorkerRequest};
use crate::observer::Observer;

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// No response within the call timeout. The id is abandoned, never reused.
    Timeout(Duration),
    /// The process exited or the channel faulted; the handle is dead.
    WorkerCrashed(String),
    /// The worker answered with an error envelope.
    Remote(RemoteErrorBody),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Timeout(after) => write!(f, "no response after {:?}", after),
            InvokeError::WorkerCrashed(reason) => write!(f, "worker crashed: {}", reason),
            InvokeError::Remote(body) => write!(f, "{}: {}", body.kind, body.message),
        }
    }
}

impl std::error::Error for InvokeError {}

type Slot = oneshot::Sender<Result<Value, InvokeError>>;

/// Correlation id -> pending result slot. Every id leaves the table exactly once.
#[derive(Default)]
struct PendingTable {
    slots: HashMap<u64, Slot>,
    closed: Option<String>,
}

impl PendingTable {
    fn register(&mut self, id: u64) -> Result<oneshot::Receiver<Result<Value, InvokeError>>, InvokeError> {
        if let Some(reason) = &self.closed {
            return Err(InvokeError::WorkerCrashed(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        Ok(rx)
    }

    /// Returns false if the id is unknown (already timed out or never issued).
    fn resolve(&mut self, id: u64, result: Result<Value, InvokeError>) -> bool {
        match self.slots.remove(&id) {
            Some(slot) => {
                let _ = slot.send(result);
                true
            }
            None => false,
        }
    }

    fn abandon(&mut self, id: u64) -> bool {
        self.slots.remove(&id).is_some()
    }

    fn fail_all(&mut self, reason: &str) {
        if self.closed.is_none() {
            self.closed = Some(reason.to_string());
        }
        for (_, slot) in self.slots.drain() {
            let _ = slot.send(Err(InvokeError::WorkerCrashed(reason.to_string())));
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct WorkerHandle {
    capability: String,
    writer: tokio::sync::Mutex<FrameWriter<BoxedWriter>>,
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    io_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Builds a handle over any byte stream pair and starts its reader task.
    ///
    /// `io_timeout` bounds every channel read and write.
    pub fn from_streams<R, W>(
        capability: &str,
        reader: R,
        writer: W,
        io_timeout: Duration,
        observer: Arc<dyn Observer>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let alive = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(read_loop(
            capability.to_string(),
            FrameReader::new(reader),
            Arc::clone(&pending),
            Arc::clone(&alive),
            io_timeout,
            observer,
        ));

        Self {
            capability: capability.to_string(),
            writer: tokio::sync::Mutex::new(FrameWriter::new(Box::new(writer) as BoxedWriter)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            io_timeout,
            reader: Mutex::new(Some(task)),
            child: tokio::sync::Mutex::new(None),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Attaches the child process so `shutdown` can kill and reap it.
    pub fn with_child(mut self, child: Child, shutdown_timeout: Duration) -> Self {
        self.child = tokio::sync::Mutex::new(Some(child));
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Number of calls currently waiting for a response.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.table().slots.len()
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn invoke(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        if !self.is_alive() {
            let reason = self
                .table()
                .closed
                .clone()
                .unwrap_or_else(|| "worker is not running".to_string());
            return Err(InvokeError::WorkerCrashed(reason));
        }

        // One deadline covers the writer lock, the write and the response.
        let deadline = Instant::now() + timeout;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.table().register(id)?;

        let request = WorkerRequest {
            id,
            method: method.to_string(),
            params,
        };
        let Ok(mut writer) = tokio::time::timeout_at(deadline, self.writer.lock()).await else {
            self.table().abandon(id);
            tracing::debug!(capability = %self.capability, id, method, "call timed out waiting to write");
            return Err(InvokeError::Timeout(timeout));
        };
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .min(self.io_timeout);
        let sent = writer.send(&request, budget).await;
        drop(writer);

        match sent {
            Ok(()) => {}
            Err(ChannelError::Timeout(_)) if budget < self.io_timeout => {
                // A partial line may be on the wire; nothing after it can be framed.
                self.mark_dead(&format!("call deadline passed while writing request {}", id));
                return Err(InvokeError::Timeout(timeout));
            }
            Err(e) => {
                let reason = format!("failed to send request {}: {}", id, e);
                self.mark_dead(&reason);
                return Err(InvokeError::WorkerCrashed(reason));
            }
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(InvokeError::WorkerCrashed(
                "pending slot dropped without a result".to_string(),
            )),
            Err(_) => {
                if !self.table().abandon(id) {
                    // The reader resolved the slot between the deadline and the abandon.
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                tracing::debug!(
                    capability = %self.capability,
                    id,
                    method,
                    "call timed out, slot abandoned"
                );
                Err(InvokeError::Timeout(timeout))
            }
        }
    }

    fn mark_dead(&self, reason: &str) {
        if self.close(reason) {
            tracing::warn!(capability = %self.capability, reason, "worker marked dead");
        }
    }

    /// Fails every pending slot and stops the reader. Returns whether the
    /// handle was still alive.
    fn close(&self, reason: &str) -> bool {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.table().fail_all(reason);
        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = reader.as_ref() {
            task.abort();
        }
        was_alive
    }

    /// Fails outstanding calls, stops the reader, then kills and reaps the child.
    pub async fn shutdown(&self) {
        if self.close("worker shut down") {
            tracing::debug!(capability = %self.capability, "shutting down worker");
        }

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        let pid = child.id();
        if let Err(e) = child.start_kill() {
            tracing::debug!(capability = %self.capability, error = %e, "kill failed");
        }
        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(capability = %self.capability, ?pid, %status, "worker exited")
            }
            Ok(Err(e)) => {
                tracing::warn!(capability = %self.capability, ?pid, error = %e, "failed to reap worker")
            }
            Err(_) => tracing::warn!(
                capability = %self.capability,
                ?pid,
                "worker did not exit within {:?}",
                self.shutdown_timeout
            ),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = reader.as_ref() {
            task.abort();
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    capability: String,
    mut reader: FrameReader<R>,
    pending: Arc<Mutex<PendingTable>>,
    alive: Arc<AtomicBool>,
    io_timeout: Duration,
    observer: Arc<dyn Observer>,
) {
    let table = || pending.lock().unwrap_or_else(PoisonError::into_inner);

    let reason = loop {
        match reader.receive(io_timeout).await {
            Received::Message(WorkerMessage::Response { id, result }) => {
                if !table().resolve(id, Ok(result)) {
                    tracing::debug!(%capability, id, "discarding late or unknown response");
                }
            }
            Received::Message(WorkerMessage::Error { id, error }) => {
                if !table().resolve(id, Err(InvokeError::Remote(error))) {
                    tracing::debug!(%capability, id, "discarding late or unknown error envelope");
                }
            }
            Received::Message(WorkerMessage::Notification(notification)) => {
                observer.record_notification(
                    &capability,
                    &notification.notification,
                    &notification.payload,
                );
            }
            Received::Malformed(detail) => {
                tracing::warn!(%capability, %detail, "skipping malformed worker output");
            }
            Received::Timeout => {
                if !table().slots.is_empty() {
                    break format!("no output for {:?} with requests in flight", io_timeout);
                }
            }
            Received::EndOfStream => break "worker closed its output".to_string(),
            Received::Failed(e) => break format!("read failed: {}", e),
        }
    };

    alive.store(false, Ordering::SeqCst);
    tracing::warn!(%capability, %reason, "worker channel faulted");
    table().fail_all(&reason);
}

#[cfg(test)]
#[path = "tests/handle_tests.rs"]
mod tests;
