use std::sync::Arc;

use async_channel::Receiver;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::engine::DocumentEngine;
use crate::error::{names, RawError};
use crate::ProcessingOptions;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Merge,
    Compress,
    Validate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPayload {
    pub buffers: Vec<Bytes>,
    pub options: ProcessingOptions,
}

/// Request sent to an execution context: `{id, type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub operation: Operation,
    pub payload: WorkPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOutput {
    pub data: Bytes,
    pub pages_processed: u32,
    pub warnings: Vec<String>,
    pub engine: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: Option<String>,
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl From<RawError> for ErrorPayload {
    fn from(err: RawError) -> Self {
        Self {
            name: err.name,
            code: err.code,
            status: err.status,
            message: err.message,
        }
    }
}

impl From<ErrorPayload> for RawError {
    fn from(payload: ErrorPayload) -> Self {
        RawError {
            name: payload.name,
            code: payload.code,
            status: payload.status,
            message: payload.message,
        }
    }
}

/// Response from an execution context: `{id, type, payload}` where `type` is
/// `progress`, `result` or `error`. Only `result` and `error` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkResult {
    Progress { id: RequestId, payload: ProgressPayload },
    Result { id: RequestId, payload: WorkOutput },
    Error { id: RequestId, payload: ErrorPayload },
}

impl WorkResult {
    pub fn id(&self) -> RequestId {
        match self {
            WorkResult::Progress { id, .. }
            | WorkResult::Result { id, .. }
            | WorkResult::Error { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkResult::Progress { .. })
    }
}

#[derive(Debug)]
pub enum ContextMessage {
    Reply(WorkResult),
    /// The context itself broke; nothing it holds will be answered.
    Fault(String),
}

pub async fn start(
    cancel_token: CancellationToken,
    engine: Arc<dyn DocumentEngine>,
    recv_from_bridge: Receiver<WorkUnit>,
    send_to_bridge: UnboundedSender<ContextMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            unit = recv_from_bridge.recv() => {
                match unit {
                    Err(err) => {
                        debug!(message = "Work queue closed, exiting", error = ?err);
                        break;
                    },
                    Ok(unit) => {
                        if let Err(fault) = process(engine.clone(), unit, &send_to_bridge).await {
                            error!(message = "Worker fault", error = %fault);
                            // Nobody is left to tell if the bridge is gone too.
                            let _ = send_to_bridge.send(ContextMessage::Fault(fault));
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
}

#[instrument(skip_all, fields(request_id = unit.id, operation = ?unit.operation))]
async fn process(
    engine: Arc<dyn DocumentEngine>,
    unit: WorkUnit,
    send_to_bridge: &UnboundedSender<ContextMessage>,
) -> Result<(), String> {
    let id = unit.id;
    let progress_tx = send_to_bridge.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut report = |percentage: u8| {
            let _ = progress_tx.send(ContextMessage::Reply(WorkResult::Progress {
                id,
                payload: ProgressPayload { percentage },
            }));
        };
        engine.run(unit.operation, &unit.payload, &mut report)
    })
    .await;

    let reply = match outcome {
        Ok(Ok(output)) => WorkResult::Result { id, payload: output },
        Ok(Err(err)) => {
            debug!(message = "Operation failed", error = %err);
            let err = if err.name.is_none() {
                err.with_name(names::PROCESSING)
            } else {
                err
            };
            WorkResult::Error { id, payload: err.into() }
        }
        Err(join_err) => return Err(format!("engine panicked on request {id}: {join_err}")),
    };

    send_to_bridge
        .send(ContextMessage::Reply(reply))
        .map_err(|_| "bridge is gone".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PassthroughEngine;
    use tokio::sync::mpsc;

    #[test]
    fn wire_schema_is_stable() {
        let unit = WorkUnit {
            id: 7,
            operation: Operation::Validate,
            payload: WorkPayload {
                buffers: vec![],
                options: ProcessingOptions::default(),
            },
        };
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["type"], "validate");
        assert!(json["payload"].is_object());

        let progress = WorkResult::Progress {
            id: 7,
            payload: ProgressPayload { percentage: 40 },
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["id"], 7);
        assert_eq!(json["payload"]["percentage"], 40);

        let error: WorkResult = serde_json::from_str(
            r#"{"id":9,"type":"error","payload":{"name":"ProcessingError","code":null,"message":"bad"}}"#,
        )
        .unwrap();
        assert_eq!(error.id(), 9);
        assert!(error.is_terminal());
    }

    #[test]
    fn error_payload_keeps_the_status() {
        let raw = RawError::validation("too big").with_status(413);
        let json = serde_json::to_value(ErrorPayload::from(raw)).unwrap();
        assert_eq!(json["status"], 413);

        let payload: ErrorPayload = serde_json::from_value(json).unwrap();
        let back = RawError::from(payload);
        assert_eq!(back.status, Some(413));
        assert_eq!(back.name.as_deref(), Some(names::VALIDATION));
    }

    #[tokio::test]
    async fn worker_answers_and_stops_on_cancel() {
        let token = CancellationToken::new();
        let (send_unit, recv_unit) = async_channel::unbounded();
        let (send_reply, mut recv_reply) = mpsc::unbounded_channel();
        let worker = tokio::spawn(start(
            token.clone(),
            Arc::new(PassthroughEngine),
            recv_unit,
            send_reply,
        ));

        send_unit
            .send(WorkUnit {
                id: 1,
                operation: Operation::Validate,
                payload: WorkPayload {
                    buffers: vec![Bytes::from_static(b"not a pdf")],
                    options: ProcessingOptions::default(),
                },
            })
            .await
            .unwrap();

        match recv_reply.recv().await.unwrap() {
            ContextMessage::Reply(WorkResult::Error { id, payload }) => {
                assert_eq!(id, 1);
                assert_eq!(payload.name.as_deref(), Some(names::VALIDATION));
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        token.cancel();
        worker.await.unwrap();
    }
}
