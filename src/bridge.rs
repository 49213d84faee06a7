//! Request/response bridge to background execution contexts.
//!
//! A context is a pool of worker tasks fed from one shared queue. The bridge
//! stamps each request with a monotonically increasing id, parks the caller
//! on a oneshot in the outstanding-call table and lets a router task match
//! replies back by id. The bridge is constructed once and shared by `Arc`;
//! nothing about it is global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::engine::DocumentEngine;
use crate::error::{classify, names, ErrorContext, RawError};
use crate::worker::{self, ContextMessage, Operation, RequestId, WorkOutput, WorkPayload, WorkResult, WorkUnit};
use crate::AppError;

pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

type Reply = Result<WorkOutput, AppError>;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub workers: usize,
    /// Caller-side deadline for a single call.
    pub call_timeout: Duration,
    /// How long `shutdown` waits for workers to notice cancellation.
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            call_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

struct Pending {
    reply: oneshot::Sender<Reply>,
    on_progress: Option<ProgressFn>,
}

type CallTable = Arc<Mutex<HashMap<RequestId, Pending>>>;

struct Context {
    token: CancellationToken,
    send_to_workers: async_channel::Sender<WorkUnit>,
    tasks: Vec<JoinHandle<()>>,
}

/// A dispatched call waiting for its reply.
pub struct Call {
    pub id: RequestId,
    reply: oneshot::Receiver<Reply>,
}

pub struct WorkerBridge {
    engine: Arc<dyn DocumentEngine>,
    config: BridgeConfig,
    next_id: AtomicU64,
    pending: CallTable,
    context: Mutex<Option<Context>>,
    /// Serializes `shutdown` and the restarts.
    lifecycle: tokio::sync::Mutex<()>,
}

impl WorkerBridge {
    /// Creates the bridge and starts its first execution context.
    pub fn new(engine: Arc<dyn DocumentEngine>, config: BridgeConfig) -> Self {
        let pending: CallTable = Arc::new(Mutex::new(HashMap::new()));
        let context = spawn_context(&engine, &config, &pending);
        Self {
            engine,
            config,
            next_id: AtomicU64::new(1),
            pending,
            context: Mutex::new(Some(context)),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.context
            .lock()
            .as_ref()
            .is_some_and(|ctx| !ctx.token.is_cancelled())
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    /// Runs `operation` off the caller's task and waits for the terminal reply.
    pub async fn invoke(
        &self,
        operation: Operation,
        payload: WorkPayload,
        on_progress: Option<ProgressFn>,
    ) -> Result<WorkOutput, AppError> {
        let call = self.dispatch(operation, payload, on_progress)?;
        self.wait(call, &CancellationToken::new()).await
    }

    /// Like [`invoke`](Self::invoke) but gives up when `cancel` fires. The
    /// worker is not interrupted; its eventual reply is dropped.
    pub async fn invoke_cancellable(
        &self,
        operation: Operation,
        payload: WorkPayload,
        on_progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<WorkOutput, AppError> {
        if cancel.is_cancelled() {
            return Err(classify(
                &RawError::cancelled("cancelled before dispatch"),
                Some(ErrorContext::Worker),
            ));
        }
        let call = self.dispatch(operation, payload, on_progress)?;
        self.wait(call, cancel).await
    }

    /// Registers the call and queues it for the context. Fire and forget.
    pub fn dispatch(
        &self,
        operation: Operation,
        payload: WorkPayload,
        on_progress: Option<ProgressFn>,
    ) -> Result<Call, AppError> {
        let context = self.context.lock();
        let sender = match context.as_ref() {
            Some(ctx) if !ctx.token.is_cancelled() => ctx.send_to_workers.clone(),
            _ => return Err(context_unavailable("execution context is not running")),
        };
        drop(context);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();
        self.pending.lock().insert(id, Pending { reply, on_progress });

        if sender.try_send(WorkUnit { id, operation, payload }).is_err() {
            self.pending.lock().remove(&id);
            return Err(context_unavailable("execution context stopped accepting work"));
        }
        trace!(request_id = id, ?operation, "dispatched");
        Ok(Call { id, reply: receiver })
    }

    pub async fn wait(&self, call: Call, cancel: &CancellationToken) -> Result<WorkOutput, AppError> {
        let Call { id, reply } = call;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.cancel(id);
                Err(classify(&RawError::cancelled(format!("request {id} cancelled")), Some(ErrorContext::Worker)))
            }
            result = timeout(self.config.call_timeout, reply) => match result {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(context_unavailable("call dropped without a reply")),
                Err(_) => {
                    self.pending.lock().remove(&id);
                    warn!(request_id = id, timeout = ?self.config.call_timeout, "call timed out");
                    Err(classify(
                        &RawError::timeout(format!("no reply to request {id} within {:?}", self.config.call_timeout)),
                        Some(ErrorContext::Worker),
                    ))
                }
            }
        }
    }

    /// Stops waiting for `id`. Returns false if the call was not outstanding.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.pending.lock().remove(&id) {
            Some(pending) => {
                debug!(request_id = id, "call cancelled");
                let _ = pending.reply.send(Err(classify(
                    &RawError::cancelled(format!("request {id} cancelled")),
                    Some(ErrorContext::Worker),
                )));
                true
            }
            None => false,
        }
    }

    /// Stops the current context and rejects everything still outstanding.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_context().await;
    }

    /// Replaces the context with a fresh one.
    pub async fn restart(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_context().await;
        self.install_context();
    }

    /// Restarts only if the context is down. Concurrent callers see a single
    /// restart; the rest return false.
    pub async fn restart_if_faulted(&self) -> bool {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            return false;
        }
        self.stop_context().await;
        self.install_context();
        true
    }

    async fn stop_context(&self) {
        let context = self.context.lock().take();
        let Some(context) = context else {
            return;
        };
        context.token.cancel();
        reject_all(&self.pending, "execution context shut down");
        if timeout(self.config.shutdown_grace, join_all(context.tasks)).await.is_err() {
            warn!("execution context did not stop within {:?}", self.config.shutdown_grace);
        }
        info!("Execution context stopped.");
    }

    fn install_context(&self) {
        let context = spawn_context(&self.engine, &self.config, &self.pending);
        // A replaced context must not reach reject_all on the shared table.
        if let Some(replaced) = self.context.lock().replace(context) {
            replaced.token.cancel();
        }
        info!("Execution context restarted.");
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        if let Some(context) = self.context.get_mut().take() {
            context.token.cancel();
        }
    }
}

fn context_unavailable(message: &str) -> AppError {
    classify(&RawError::named(names::WORKER, message), Some(ErrorContext::Worker))
}

fn spawn_context(engine: &Arc<dyn DocumentEngine>, config: &BridgeConfig, pending: &CallTable) -> Context {
    let token = CancellationToken::new();
    let (send_to_workers, recv_from_bridge) = async_channel::unbounded::<WorkUnit>();
    let (send_to_router, recv_from_workers) = mpsc::unbounded_channel::<ContextMessage>();

    let mut tasks = Vec::with_capacity(config.workers + 1);
    for _ in 0..config.workers.max(1) {
        let token = token.clone();
        let engine = engine.clone();
        let recv_from_bridge = recv_from_bridge.clone();
        let send_to_router = send_to_router.clone();
        tasks.push(tokio::spawn(
            async move {
                worker::start(token, engine, recv_from_bridge, send_to_router).await;
            }
            .instrument(info_span!("worker")),
        ));
    }
    drop(send_to_router);

    tasks.push(tokio::spawn(
        route(token.clone(), recv_from_workers, pending.clone()).instrument(info_span!("router")),
    ));

    Context {
        token,
        send_to_workers,
        tasks,
    }
}

async fn route(
    token: CancellationToken,
    mut recv_from_workers: mpsc::UnboundedReceiver<ContextMessage>,
    pending: CallTable,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Router Cancelled");
                break;
            },
            msg = recv_from_workers.recv() => {
                match msg {
                    None => {
                        error!("All workers exited, context lost");
                        token.cancel();
                        reject_all(&pending, "all workers exited");
                        break;
                    },
                    Some(ContextMessage::Fault(reason)) => {
                        error!(message = "Execution context fault", reason = %reason);
                        token.cancel();
                        reject_all(&pending, &reason);
                        break;
                    },
                    Some(ContextMessage::Reply(result)) => deliver(&pending, result),
                }
            }
        }
    }
}

fn deliver(pending: &CallTable, result: WorkResult) {
    let id = result.id();
    match result {
        WorkResult::Progress { payload, .. } => {
            let callback = match pending.lock().get(&id) {
                Some(call) => call.on_progress.clone(),
                None => {
                    warn!(request_id = id, "progress for unknown request ignored");
                    return;
                }
            };
            if let Some(callback) = callback {
                callback(payload.percentage);
            }
        }
        WorkResult::Result { payload, .. } => match pending.lock().remove(&id) {
            Some(call) => {
                let _ = call.reply.send(Ok(payload));
            }
            None => warn!(request_id = id, "result for unknown or settled request ignored"),
        },
        WorkResult::Error { payload, .. } => match pending.lock().remove(&id) {
            Some(call) => {
                let raw = RawError::from(payload);
                let _ = call.reply.send(Err(classify(&raw, Some(ErrorContext::Worker))));
            }
            None => warn!(request_id = id, "error for unknown or settled request ignored"),
        },
    }
}

fn reject_all(pending: &CallTable, reason: &str) {
    let drained: Vec<(RequestId, Pending)> = pending.lock().drain().collect();
    if drained.is_empty() {
        return;
    }
    warn!(count = drained.len(), reason, "rejecting outstanding calls");
    for (id, call) in drained {
        let raw = RawError::named(names::WORKER, format!("request {id} lost: {reason}"));
        let _ = call.reply.send(Err(classify(&raw, Some(ErrorContext::Worker))));
    }
}
