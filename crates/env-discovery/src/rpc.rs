//! JSON-RPC connection to the discovery worker process.
//!
//! One background task owns the worker's stdout: it reads every frame as soon
//! as it arrives and routes responses to the waiting request and
//! notifications to every subscriber. Subscribers get unbounded channels so a
//! fast burst of `environment` notifications is buffered rather than dropped
//! while the consumer is busy.
//!
//! When the worker's output ends (crash, exit, or an unreadable frame) every
//! in-flight request fails and the connection is marked closed; owners are
//! expected to drop it and spawn a new one.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, error, info, log, warn};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::DiscoveryError;
use crate::framing;
use crate::protocol::{Incoming, IncomingMessage, Notification, RequestMessage};

type PendingReply = oneshot::Sender<Result<Value, DiscoveryError>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why the read side stopped.
#[derive(Debug, Clone)]
enum CloseReason {
    Exited,
    Malformed(String),
}

impl CloseReason {
    fn to_error(&self) -> DiscoveryError {
        match self {
            CloseReason::Exited => DiscoveryError::WorkerExited,
            CloseReason::Malformed(message) => DiscoveryError::Protocol(message.clone()),
        }
    }
}

/// State shared between the connection handle and its reader task.
struct Shared {
    pending: StdMutex<HashMap<u64, PendingReply>>,
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<Notification>>>,
    closed: AtomicBool,
}

impl Shared {
    fn dispatch(&self, body: &[u8]) {
        let message = match serde_json::from_slice::<IncomingMessage>(body)
            .and_then(IncomingMessage::classify)
        {
            Ok(message) => message,
            Err(e) => {
                // Framing is intact, so the stream is still usable.
                warn!("[rpc] Skipping unreadable message from worker: {}", e);
                return;
            }
        };

        match message {
            Incoming::Response { id, outcome } => {
                let waiter = self.pending.lock().unwrap().remove(&id);
                match waiter {
                    Some(tx) => {
                        let result = outcome.map_err(|e| DiscoveryError::Worker {
                            code: e.code,
                            message: e.message,
                        });
                        let _ = tx.send(result);
                    }
                    None => debug!("[rpc] Response for unknown or abandoned request {}", id),
                }
            }
            Incoming::Notification(Notification::Log(message)) => {
                log!(message.level.to_log_level(), "[worker] {}", message.message);
            }
            Incoming::Notification(Notification::Telemetry(data)) => {
                debug!("[worker] telemetry: {}", data);
            }
            Incoming::Notification(Notification::Other { method, .. }) => {
                debug!("[rpc] Ignoring notification {:?}", method);
            }
            Incoming::Notification(notification) => {
                let mut subscribers = self.subscribers.lock().unwrap();
                subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
            }
            Incoming::Request { id, method } => {
                debug!("[rpc] Ignoring worker request {} ({})", id, method);
            }
        }
    }

    fn close(&self, reason: CloseReason) {
        let waiters: Vec<PendingReply> = {
            let mut pending = self.pending.lock().unwrap();
            self.closed.store(true, Ordering::SeqCst);
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(reason.to_error()));
        }
        self.subscribers.lock().unwrap().clear();
    }
}

/// A live connection to one worker process.
pub struct RpcConnection {
    writer: Mutex<BoxedWriter>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
    child: StdMutex<Option<Child>>,
}

impl RpcConnection {
    /// Launch `<worker> server` and connect to its stdio.
    pub fn spawn(worker: &Path) -> Result<Self, DiscoveryError> {
        info!("[rpc] Starting discovery worker {:?}", worker);

        let mut child = Command::new(worker)
            .arg("server")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DiscoveryError::Spawn {
                path: worker.to_path_buf(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DiscoveryError::Protocol("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DiscoveryError::Protocol("worker stdout unavailable".to_string()))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[worker:stderr] {}", line);
                }
            })
        });

        let mut connection = Self::from_streams(stdout, stdin);
        connection.stderr_task = stderr_task;
        *connection.child.lock().unwrap() = Some(child);
        Ok(connection)
    }

    /// Connect over arbitrary streams. Used for in-process workers and tests.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            pending: StdMutex::new(HashMap::new()),
            subscribers: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let reason = loop {
                match framing::recv_message(&mut reader).await {
                    Ok(Some(body)) => reader_shared.dispatch(&body),
                    Ok(None) => {
                        info!("[rpc] Worker closed its output stream");
                        break CloseReason::Exited;
                    }
                    Err(e) => {
                        error!("[rpc] Failed to read from worker: {}", e);
                        break CloseReason::Malformed(e.to_string());
                    }
                }
            };
            reader_shared.close(reason);
        });

        Self {
            writer: Mutex::new(Box::new(BufWriter::new(writer))),
            shared,
            next_id: AtomicU64::new(1),
            reader_task,
            stderr_task: None,
            child: StdMutex::new(None),
        }
    }

    /// Whether the read side has stopped. A closed connection never recovers.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Receive every notification that arrives from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_closed() {
            self.shared.subscribers.lock().unwrap().push(tx);
        }
        rx
    }

    /// Send a request and wait for its response.
    pub async fn request<P, R>(
        &self,
        method: &str,
        params: &P,
        cancel: &CancellationToken,
    ) -> Result<R, DiscoveryError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(DiscoveryError::WorkerExited);
            }
            pending.insert(id, tx);
        }

        let message = RequestMessage::new(id, method, serde_json::to_value(params)?);
        let body = serde_json::to_vec(&message)?;
        debug!("[rpc] -> {} (id {})", method, id);

        let sent = {
            let mut writer = self.writer.lock().await;
            framing::send_message(&mut *writer, &body).await
        };
        if let Err(e) = sent {
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(DiscoveryError::Transport(e));
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.shared.pending.lock().unwrap().remove(&id);
                debug!("[rpc] {} (id {}) cancelled", method, id);
                return Err(DiscoveryError::Cancelled);
            }
            reply = rx => reply.map_err(|_| DiscoveryError::WorkerExited)?,
        };

        let value = outcome?;
        debug!("[rpc] <- {} (id {})", method, id);
        serde_json::from_value(value)
            .map_err(|e| DiscoveryError::Protocol(format!("invalid {} result: {}", method, e)))
    }

    /// Stop the reader and kill the worker process.
    pub fn kill(&self) {
        self.reader_task.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().unwrap().take() {
            if let Err(e) = child.start_kill() {
                warn!("[rpc] Failed to kill discovery worker: {}", e);
            }
        }
        self.shared.close(CloseReason::Exited);
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.kill();
    }
}
