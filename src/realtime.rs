//! Per-job push channel with reconnect, backoff and jitter.
//!
//! The transport sits behind [`Connector`]. A connector yields a stream of
//! text frames; the channel parses them, hands them to the subscriber and
//! closes itself as soon as a terminal status arrives. An abnormal end of
//! the stream schedules a reconnect until the attempt cap is reached, at
//! which point a network error is surfaced once and the channel stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::error::{classify, codes, names, ErrorContext, RawError};
use crate::remote::{RemoteBackend, RemoteStatus, StatusResponse};
use crate::retry::{backoff_delay, with_jitter_factor};
use crate::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub job_id: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub progress: f64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl ChannelMessage {
    pub fn percentage(&self) -> u8 {
        self.progress.clamp(0.0, 100.0).round() as u8
    }
}

impl From<StatusResponse> for ChannelMessage {
    fn from(status: StatusResponse) -> Self {
        Self {
            job_id: status.job_id,
            status: status.status,
            progress: status.progress,
            message: None,
            error: status.error,
            result: None,
        }
    }
}

pub type MessageStream = BoxStream<'static, Result<String, RawError>>;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, job_id: &str) -> Result<MessageStream, RawError>;
}

/// WebSocket transport: `{base_url}/ws/processing/{job_id}`.
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, job_id: &str) -> Result<MessageStream, RawError> {
        let url = format!("{}/ws/processing/{}", self.base_url, job_id);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        debug!(%url, "websocket connected");
        let frames = socket.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(_) => None,
                Err(err) => Some(Err(RawError::from(err))),
            }
        });
        Ok(frames.boxed())
    }
}

/// Status polling dressed up as a push channel, for services without a
/// WebSocket endpoint. The stream ends after a terminal status.
pub struct PollingConnector {
    backend: Arc<dyn RemoteBackend>,
    every: Duration,
}

impl PollingConnector {
    pub fn new(backend: Arc<dyn RemoteBackend>, every: Duration) -> Self {
        Self { backend, every }
    }
}

#[async_trait]
impl Connector for PollingConnector {
    async fn connect(&self, job_id: &str) -> Result<MessageStream, RawError> {
        // Fail the connect itself if the service is unreachable.
        let first = self.backend.status(job_id).await?;
        let backend = self.backend.clone();
        let every = self.every;
        let job_id = job_id.to_string();

        let polls = stream::unfold(Some(first), move |state| {
            let backend = backend.clone();
            let job_id = job_id.clone();
            async move {
                let status = match state? {
                    status if status.status.is_terminal() => {
                        return Some((encode(status), None));
                    }
                    status => status,
                };
                let frame = encode(status);
                sleep(every).await;
                match backend.status(&job_id).await {
                    Ok(next) => Some((frame, Some(next))),
                    Err(err) => Some((Err(err), None)),
                }
            }
        });
        Ok(polls.boxed())
    }
}

fn encode(status: StatusResponse) -> Result<String, RawError> {
    serde_json::to_string(&ChannelMessage::from(status))
        .map_err(|err| RawError::named(names::PROCESSING, err.to_string()))
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed connections before giving up.
    pub max_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        with_jitter_factor(backoff_delay(self.base_delay, attempt, self.max_delay))
    }
}

pub struct ChannelHandle {
    pub id: u64,
    pub job_id: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.task.is_finished()
    }

    /// Waits for the channel task to wind down.
    pub async fn closed(&mut self) {
        let _ = (&mut self.task).await;
    }
}

pub struct RealtimeChannel {
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    next_handle: AtomicU64,
}

enum Closed {
    Local,
    Terminal,
    Abnormal(RawError),
}

impl RealtimeChannel {
    pub fn new(connector: Arc<dyn Connector>, config: ChannelConfig) -> Self {
        Self {
            connector,
            config,
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn open<M, E>(&self, job_id: &str, on_message: M, on_error: E) -> ChannelHandle
    where
        M: Fn(ChannelMessage) + Send + Sync + 'static,
        E: FnOnce(AppError) + Send + 'static,
    {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let task = tokio::spawn(
            run(
                self.connector.clone(),
                self.config.clone(),
                job_id.to_string(),
                token.clone(),
                on_message,
                on_error,
            )
            .instrument(info_span!("channel", channel_id = id, job_id = %job_id)),
        );
        ChannelHandle {
            id,
            job_id: job_id.to_string(),
            token,
            task,
        }
    }

    /// Idempotent; also cancels a pending reconnect.
    pub fn close(&self, handle: &ChannelHandle) {
        if !handle.token.is_cancelled() {
            debug!(channel_id = handle.id, job_id = %handle.job_id, "closing channel");
            handle.token.cancel();
        }
    }
}

async fn run<M, E>(
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
    job_id: String,
    token: CancellationToken,
    on_message: M,
    on_error: E,
) where
    M: Fn(ChannelMessage) + Send + Sync + 'static,
    E: FnOnce(AppError) + Send + 'static,
{
    let mut attempts = 0u32;
    loop {
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            connected = connector.connect(&job_id) => connected,
        };

        let failure = match connected {
            Ok(mut frames) => {
                attempts = 0;
                debug!("channel open");
                match pump(&mut frames, &job_id, &token, &on_message).await {
                    Closed::Local => return,
                    Closed::Terminal => {
                        debug!("terminal status received, closing channel");
                        token.cancel();
                        return;
                    }
                    Closed::Abnormal(err) => err,
                }
            }
            Err(err) => err,
        };

        attempts += 1;
        if attempts >= config.max_attempts {
            error!(attempts, error = %failure, "giving up on channel");
            let raw = RawError::named(
                names::NETWORK,
                format!("realtime channel lost after {attempts} attempts: {}", failure.message),
            )
            .with_code(codes::NETWORK);
            token.cancel();
            on_error(classify(&raw, Some(ErrorContext::Realtime)));
            return;
        }

        let delay = config.reconnect_delay(attempts);
        warn!(attempts, ?delay, error = %failure, "channel dropped, reconnecting");
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

async fn pump<M>(frames: &mut MessageStream, job_id: &str, token: &CancellationToken, on_message: &M) -> Closed
where
    M: Fn(ChannelMessage),
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => return Closed::Local,
            frame = frames.next() => frame,
        };
        let text = match frame {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Closed::Abnormal(err),
            None => return Closed::Abnormal(RawError::new("connection closed by peer").with_code(codes::RESET)),
        };
        let message: ChannelMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "unparseable channel message ignored");
                continue;
            }
        };
        if message.job_id != job_id {
            trace!(other = %message.job_id, "message for another job ignored");
            continue;
        }
        let terminal = message.status.is_terminal();
        on_message(message);
        if terminal {
            return Closed::Terminal;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::oneshot;

    /// Each connect pops the next scripted outcome; when the script runs out
    /// every connect fails.
    struct ScriptedConnector {
        script: Mutex<VecDeque<Result<Vec<Result<String, RawError>>, RawError>>>,
        connects: AtomicU32,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Result<Vec<Result<String, RawError>>, RawError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                connects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _job_id: &str) -> Result<MessageStream, RawError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front();
            match next {
                Some(Ok(frames)) => Ok(stream::iter(frames).boxed()),
                Some(Err(err)) => Err(err),
                None => Err(RawError::new("refused").with_code(codes::REFUSED)),
            }
        }
    }

    fn frame(status: &str, progress: u8) -> Result<String, RawError> {
        Ok(format!(r#"{{"job_id":"job-1","status":"{status}","progress":{progress}}}"#))
    }

    fn config() -> ChannelConfig {
        ChannelConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_failed_connects() {
        let connector = ScriptedConnector::new(vec![]);
        let channel = RealtimeChannel::new(connector.clone(), config());
        let (tx, rx) = oneshot::channel();

        let mut handle = channel.open("job-1", |_| {}, move |err| {
            let _ = tx.send(err);
        });

        let err = rx.await.unwrap();
        assert_eq!(err.kind, ErrorKind::Network);
        handle.closed().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_closes_locally() {
        let connector = ScriptedConnector::new(vec![Ok(vec![
            frame("processing", 20),
            frame("processing", 60),
            frame("completed", 100),
            frame("processing", 99),
        ])]);
        let channel = RealtimeChannel::new(connector.clone(), config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut handle = channel.open("job-1", move |msg| sink.lock().push(msg.percentage()), |_| {
            panic!("no error expected")
        });
        handle.closed().await;

        assert!(handle.is_closed());
        assert_eq!(*seen.lock(), vec![20, 60, 100]);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_the_attempt_counter() {
        let refused = || Err(RawError::new("refused").with_code(codes::REFUSED));
        // Without the reset the dropped connection plus three refusals would
        // push the count past the cap.
        let mut script = vec![refused(), refused(), refused(), refused()];
        script.push(Ok(vec![frame("processing", 10)]));
        script.extend([refused(), refused(), refused()]);
        script.push(Ok(vec![frame("processing", 50), frame("failed", 50)]));

        let connector = ScriptedConnector::new(script);
        let channel = RealtimeChannel::new(connector.clone(), config());
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();

        let mut handle = channel.open("job-1", move |msg| sink.lock().push(msg.status), |err| {
            panic!("unexpected give-up: {err}")
        });
        handle.closed().await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 9);
        assert_eq!(
            *statuses.lock(),
            vec![RemoteStatus::Processing, RemoteStatus::Processing, RemoteStatus::Failed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let connector = ScriptedConnector::new(vec![]);
        let channel = RealtimeChannel::new(
            connector.clone(),
            ChannelConfig {
                base_delay: Duration::from_secs(10),
                ..config()
            },
        );
        let mut handle = channel.open("job-1", |_| {}, |_| panic!("closed channels stay quiet"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        channel.close(&handle);
        channel.close(&handle);
        handle.closed().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_and_foreign_frames_are_skipped() {
        let connector = ScriptedConnector::new(vec![Ok(vec![
            Ok("not json".to_string()),
            Ok(r#"{"job_id":"job-2","status":"completed","progress":100}"#.to_string()),
            frame("completed", 100),
        ])]);
        let channel = RealtimeChannel::new(connector, config());
        let count = Arc::new(AtomicU32::new(0));
        let sink = count.clone();

        let mut handle = channel.open(
            "job-1",
            move |msg| {
                assert_eq!(msg.job_id, "job-1");
                sink.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        );
        handle.closed().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconnect_delay_is_capped_and_jittered() {
        let config = config();
        for attempt in 1..=10 {
            let delay = config.reconnect_delay(attempt);
            let nominal = backoff_delay(config.base_delay, attempt, config.max_delay);
            assert!(delay >= nominal.mul_f64(0.5));
            assert!(delay <= nominal.mul_f64(1.5));
        }
    }
}
