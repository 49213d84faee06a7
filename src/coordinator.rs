//! Top-level job state machine.
//!
//! A single server task owns the job table. Callers talk to it through a
//! cloneable [`JobCoordinator`] handle; every job run is a separate task
//! that reports back over a channel, tagged with its run number so reports
//! from a superseded run (before a retry) are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::bridge::{ProgressFn, WorkerBridge};
use crate::chunked::{Chunk, ChunkedStreamProcessor, Phase, StreamOptions, StreamProgress, DEFAULT_CHUNK_SIZE};
use crate::engine::count_pages;
use crate::error::{classify, names, ErrorContext, RawError};
use crate::realtime::{ChannelMessage, RealtimeChannel};
use crate::remote::{RemoteBackend, RemoteStatus};
use crate::retry::{retry_cancellable, RetryPolicy};
use crate::validation::{self, ValidationRules};
use crate::worker::{Operation, WorkPayload};
use crate::{
    AppError, ExecutionTarget, InputFile, Job, JobId, JobKind, JobOutput, ProcessingOptions, ProgressEvent,
    ProgressUpdate, Stage,
};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Inputs above this size go to the remote service when one is configured.
    pub local_limit: u64,
    /// Local compress inputs above this size are streamed in chunks.
    pub stream_threshold: u64,
    pub stream: StreamOptions,
    pub validation: ValidationRules,
    pub remote_retry: RetryPolicy,
    pub chunk_retry: RetryPolicy,
    pub poll_interval: Duration,
    pub max_batch: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local_limit: 20 * 1024 * 1024,
            stream_threshold: DEFAULT_CHUNK_SIZE as u64,
            stream: StreamOptions::default(),
            validation: ValidationRules::default(),
            remote_retry: RetryPolicy::default(),
            chunk_retry: RetryPolicy::new(2, Duration::from_millis(200)),
            poll_interval: Duration::from_millis(500),
            max_batch: 10,
        }
    }
}

/// Collaborators the coordinator drives. Any of them may be absent; the
/// execution target is picked from what is available.
#[derive(Clone, Default)]
pub struct Services {
    pub bridge: Option<Arc<WorkerBridge>>,
    pub streamer: ChunkedStreamProcessor,
    pub remote: Option<Arc<dyn RemoteBackend>>,
    pub channel: Option<Arc<RealtimeChannel>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} is not in a retryable state")]
    NotRetryable(JobId),
    #[error("batch of {0} files exceeds the limit of {1}")]
    BatchTooLarge(usize, usize),
    #[error("coordinator has stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    Queued(JobId),
    Started(JobId, ExecutionTarget),
    Progress(ProgressEvent),
    Completed(JobId),
    Failed(JobId, AppError),
    Cleared(Vec<JobId>),
}

impl JobEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobEvent::Queued(id)
            | JobEvent::Started(id, _)
            | JobEvent::Completed(id)
            | JobEvent::Failed(id, _) => Some(id),
            JobEvent::Progress(event) => Some(&event.job_id),
            JobEvent::Cleared(_) => None,
        }
    }
}

enum Request {
    Submit {
        file: InputFile,
        kind: JobKind,
        options: ProcessingOptions,
        reply: oneshot::Sender<JobId>,
    },
    Status {
        job_id: JobId,
        reply: oneshot::Sender<Option<Job>>,
    },
    List {
        reply: oneshot::Sender<Vec<Job>>,
    },
    Cancel {
        job_id: JobId,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    Retry {
        job_id: JobId,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    ClearTerminal {
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Debug)]
enum WorkMessage {
    JobStarted {
        job_id: JobId,
        run: u64,
        target: ExecutionTarget,
    },
    Progress {
        job_id: JobId,
        run: u64,
        event: ProgressEvent,
    },
    JobCompleted {
        job_id: JobId,
        run: u64,
        output: Box<JobOutput>,
    },
    JobFailed {
        job_id: JobId,
        run: u64,
        error: AppError,
    },
}

#[derive(Clone)]
pub struct JobCoordinator {
    send_to_server: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<JobEvent>,
    max_batch: usize,
}

impl JobCoordinator {
    /// Spawns the server task. It stops when `cancel_token` fires or every
    /// handle is dropped; running jobs are cancelled on the way out.
    pub fn start(
        cancel_token: CancellationToken,
        config: CoordinatorConfig,
        services: Services,
    ) -> (Self, JoinHandle<()>) {
        let (send_to_server, recv_from_client) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let max_batch = config.max_batch;
        let server = Server::new(cancel_token, config, services, events.clone());
        let join_handle = tokio::spawn(server.serve(recv_from_client).instrument(info_span!("coordinator")));
        (
            Self {
                send_to_server,
                events,
                max_batch,
            },
            join_handle,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Always yields a job id; a submission that fails validation becomes an
    /// already-failed job.
    pub async fn submit(
        &self,
        file: InputFile,
        kind: JobKind,
        options: ProcessingOptions,
    ) -> Result<JobId, CoordinatorError> {
        self.request(|reply| Request::Submit {
            file,
            kind,
            options,
            reply,
        })
        .await
    }

    pub async fn submit_batch(
        &self,
        files: Vec<InputFile>,
        kind: JobKind,
        options: ProcessingOptions,
    ) -> Result<Vec<JobId>, CoordinatorError> {
        if files.len() > self.max_batch {
            return Err(CoordinatorError::BatchTooLarge(files.len(), self.max_batch));
        }
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            ids.push(self.submit(file, kind, options.clone()).await?);
        }
        Ok(ids)
    }

    pub async fn status(&self, job_id: &str) -> Result<Job, CoordinatorError> {
        let job_id = job_id.to_string();
        self.request(|reply| Request::Status {
            job_id: job_id.clone(),
            reply,
        })
        .await?
        .ok_or(CoordinatorError::NotFound(job_id))
    }

    pub async fn jobs(&self) -> Result<Vec<Job>, CoordinatorError> {
        self.request(|reply| Request::List { reply }).await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), CoordinatorError> {
        self.request(|reply| Request::Cancel {
            job_id: job_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn retry(&self, job_id: &str) -> Result<(), CoordinatorError> {
        self.request(|reply| Request::Retry {
            job_id: job_id.to_string(),
            reply,
        })
        .await?
    }

    /// Drops every completed or failed job; returns how many were removed.
    pub async fn clear_terminal(&self) -> Result<usize, CoordinatorError> {
        self.request(|reply| Request::ClearTerminal { reply }).await
    }

    /// Waits until the job reaches a terminal state and returns it.
    pub async fn wait_terminal(&self, job_id: &str) -> Result<Job, CoordinatorError> {
        let mut events = self.subscribe();
        loop {
            let job = self.status(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            loop {
                match events.recv().await {
                    Ok(JobEvent::Completed(id)) | Ok(JobEvent::Failed(id, _)) if id == job_id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(CoordinatorError::Stopped),
                }
            }
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.send_to_server
            .send(make(reply))
            .map_err(|_| CoordinatorError::Stopped)?;
        response.await.map_err(|_| CoordinatorError::Stopped)
    }
}

struct Entry {
    job: Job,
    source: InputFile,
    options: ProcessingOptions,
    run: u64,
    cancel: CancellationToken,
}

struct Server {
    shutdown: CancellationToken,
    config: Arc<CoordinatorConfig>,
    services: Arc<Services>,
    jobs: HashMap<JobId, Entry>,
    send_to_server: mpsc::UnboundedSender<WorkMessage>,
    recv_from_runs: Option<mpsc::UnboundedReceiver<WorkMessage>>,
    events: broadcast::Sender<JobEvent>,
}

impl Server {
    fn new(
        shutdown: CancellationToken,
        config: CoordinatorConfig,
        services: Services,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        let (send_to_server, recv_from_runs) = mpsc::unbounded_channel();
        Self {
            shutdown,
            config: Arc::new(config),
            services: Arc::new(services),
            jobs: HashMap::new(),
            send_to_server,
            recv_from_runs: Some(recv_from_runs),
            events,
        }
    }

    async fn serve(mut self, mut recv_from_client: mpsc::UnboundedReceiver<Request>) {
        let Some(mut recv_from_runs) = self.recv_from_runs.take() else {
            return;
        };
        loop {
            tokio::select! {
                // Handle cancellation
                _ = self.shutdown.cancelled() => {
                    debug!("Coordinator Cancelled");
                    break;
                },
                // Handle reports from job runs
                Some(msg) = recv_from_runs.recv() => self.on_work_message(msg),
                // Handle requests from clients
                req = recv_from_client.recv() => {
                    match req {
                        None => {
                            debug!("All coordinator handles dropped, exiting");
                            break;
                        },
                        Some(req) => self.on_request(req),
                    }
                }
            }
        }

        for entry in self.jobs.values() {
            entry.cancel.cancel();
        }
        info!("Coordinator stopped.");
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn on_request(&mut self, req: Request) {
        match req {
            Request::Submit {
                file,
                kind,
                options,
                reply,
            } => {
                let job_id = self.submit(file, kind, options);
                let _ = reply.send(job_id);
            }
            Request::Status { job_id, reply } => {
                let _ = reply.send(self.jobs.get(&job_id).map(|entry| entry.job.clone()));
            }
            Request::List { reply } => {
                let mut jobs: Vec<Job> = self.jobs.values().map(|entry| entry.job.clone()).collect();
                jobs.sort_by_key(|job| job.created_at);
                let _ = reply.send(jobs);
            }
            Request::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel(&job_id));
            }
            Request::Retry { job_id, reply } => {
                let _ = reply.send(self.retry(&job_id));
            }
            Request::ClearTerminal { reply } => {
                let _ = reply.send(self.clear_terminal());
            }
        }
    }

    fn submit(&mut self, file: InputFile, kind: JobKind, options: ProcessingOptions) -> JobId {
        let mut job = Job::new(kind, file.descriptor());
        let job_id = job.id.clone();
        debug!(job_id = %job_id, filename = %file.name, size = file.size(), %kind, "Requested job");

        if let Err(raw) = validation::validate(&file, kind, &options, &self.config.validation) {
            let error = classify(&raw, Some(ErrorContext::Validation));
            info!(job_id = %job_id, error = %error, "Rejected job");
            job.fail(error.clone());
            self.insert(job, file, options);
            self.emit(JobEvent::Failed(job_id.clone(), error));
            return job_id;
        }

        self.insert(job, file, options);
        self.emit(JobEvent::Queued(job_id.clone()));
        self.dispatch(&job_id);
        job_id
    }

    fn insert(&mut self, job: Job, source: InputFile, options: ProcessingOptions) {
        self.jobs.insert(
            job.id.clone(),
            Entry {
                job,
                source,
                options,
                run: 0,
                cancel: self.shutdown.child_token(),
            },
        );
    }

    fn dispatch(&mut self, job_id: &str) {
        let Some(entry) = self.jobs.get_mut(job_id) else {
            return;
        };
        entry.run += 1;
        entry.cancel = self.shutdown.child_token();

        let run = Run {
            job_id: job_id.to_string(),
            run: entry.run,
            kind: entry.job.kind,
            source: entry.source.clone(),
            options: entry.options.clone(),
            cancel: entry.cancel.clone(),
            config: self.config.clone(),
            services: self.services.clone(),
            send_to_server: self.send_to_server.clone(),
        };
        let span = info_span!("job", job_id = %job_id, run = entry.run);
        tokio::spawn(run.execute().instrument(span));
    }

    fn cancel(&mut self, job_id: &str) -> Result<(), CoordinatorError> {
        let entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoordinatorError::NotFound(job_id.to_string()))?;
        if entry.job.status.is_terminal() {
            return Ok(());
        }
        entry.cancel.cancel();
        let error = classify(&RawError::cancelled("cancelled by request"), None);
        entry.job.fail(error.clone());
        info!(job_id = %job_id, "Cancelled job");
        self.emit(JobEvent::Failed(job_id.to_string(), error));
        Ok(())
    }

    fn retry(&mut self, job_id: &str) -> Result<(), CoordinatorError> {
        let entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoordinatorError::NotFound(job_id.to_string()))?;
        if !entry.job.requeue() {
            return Err(CoordinatorError::NotRetryable(job_id.to_string()));
        }
        info!(job_id = %job_id, attempt = entry.job.attempt, "Retrying job");
        self.emit(JobEvent::Queued(job_id.to_string()));
        self.dispatch(job_id);
        Ok(())
    }

    fn clear_terminal(&mut self) -> usize {
        let cleared: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, entry)| entry.job.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &cleared {
            self.jobs.remove(id);
        }
        debug!(count = cleared.len(), "Cleared terminal jobs");
        let count = cleared.len();
        if count > 0 {
            self.emit(JobEvent::Cleared(cleared));
        }
        count
    }

    fn on_work_message(&mut self, msg: WorkMessage) {
        let (job_id, run) = match &msg {
            WorkMessage::JobStarted { job_id, run, .. }
            | WorkMessage::Progress { job_id, run, .. }
            | WorkMessage::JobCompleted { job_id, run, .. }
            | WorkMessage::JobFailed { job_id, run, .. } => (job_id.clone(), *run),
        };
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            trace!(job_id = %job_id, "report for cleared job ignored");
            return;
        };
        if entry.run != run {
            trace!(job_id = %job_id, run, current = entry.run, "report from superseded run ignored");
            return;
        }

        let event = match msg {
            WorkMessage::JobStarted { target, .. } => {
                if !entry.job.start(target) {
                    return;
                }
                debug!(job_id = %job_id, ?target, "Starting job");
                JobEvent::Started(job_id, target)
            }
            WorkMessage::Progress { event, .. } => match entry.job.record_progress(event.percentage) {
                ProgressUpdate::Advanced => JobEvent::Progress(event),
                ProgressUpdate::Unchanged | ProgressUpdate::Stale => return,
            },
            WorkMessage::JobCompleted { output, .. } => {
                if !entry.job.complete(*output) {
                    return;
                }
                info!(job_id = %job_id, duration = ?entry.job.duration(), "Completed job");
                JobEvent::Completed(job_id)
            }
            WorkMessage::JobFailed { error, .. } => {
                if !entry.job.fail(error.clone()) {
                    return;
                }
                info!(job_id = %job_id, error = %error, retryable = error.retryable, "Failed job");
                JobEvent::Failed(job_id, error)
            }
        };
        self.emit(event);
    }
}

fn choose_target(config: &CoordinatorConfig, services: &Services, kind: JobKind, size: u64) -> Option<ExecutionTarget> {
    let local = kind.runs_locally() && services.bridge.is_some();
    let remote = services.remote.is_some();
    if local && (size <= config.local_limit || !remote) {
        Some(ExecutionTarget::Local)
    } else if remote {
        Some(ExecutionTarget::Remote)
    } else {
        None
    }
}

fn worth_retrying(err: &AppError) -> bool {
    err.retryable && !err.is_cancelled()
}

/// One dispatch of a job. Owns everything it needs; talks to the server
/// only through `send_to_server`.
struct Run {
    job_id: JobId,
    run: u64,
    kind: JobKind,
    source: InputFile,
    options: ProcessingOptions,
    cancel: CancellationToken,
    config: Arc<CoordinatorConfig>,
    services: Arc<Services>,
    send_to_server: mpsc::UnboundedSender<WorkMessage>,
}

impl Run {
    async fn execute(self) {
        let size = self.source.size() + self.options.merge_with.iter().map(InputFile::size).sum::<u64>();
        let outcome = match choose_target(&self.config, &self.services, self.kind, size) {
            _ if self.cancel.is_cancelled() => Err(self.cancelled()),
            Some(target) => {
                self.send(WorkMessage::JobStarted {
                    job_id: self.job_id.clone(),
                    run: self.run,
                    target,
                });
                match target {
                    ExecutionTarget::Local => self.run_local().await,
                    ExecutionTarget::Remote => self.run_remote().await,
                }
            }
            None => Err(classify(
                &RawError::named(
                    names::PROCESSING,
                    format!("no execution target available for {}", self.kind),
                ),
                None,
            )),
        };

        let msg = match outcome {
            Ok(output) => WorkMessage::JobCompleted {
                job_id: self.job_id.clone(),
                run: self.run,
                output: Box::new(output),
            },
            Err(error) => WorkMessage::JobFailed {
                job_id: self.job_id.clone(),
                run: self.run,
                error,
            },
        };
        self.send(msg);
    }

    fn send(&self, msg: WorkMessage) {
        if self.send_to_server.send(msg).is_err() {
            debug!("Coordinator gone, dropping job report");
        }
    }

    fn report(&self, mut event: ProgressEvent) {
        // 100 is reserved for completion.
        event.percentage = event.percentage.min(99);
        self.send(WorkMessage::Progress {
            job_id: self.job_id.clone(),
            run: self.run,
            event,
        });
    }

    fn cancelled(&self) -> AppError {
        classify(&RawError::cancelled("job run cancelled"), None)
    }

    /// Maps a worker's 0-100 into `floor..floor+span` of the job.
    fn worker_progress(&self, floor: u8, span: u8) -> ProgressFn {
        let send_to_server = self.send_to_server.clone();
        let job_id = self.job_id.clone();
        let run = self.run;
        Arc::new(move |percentage: u8| {
            let scaled = floor as u32 + (percentage.min(100) as u32 * span as u32) / 100;
            let event = ProgressEvent::new(job_id.clone(), Stage::Processing, (scaled as u8).min(99));
            let _ = send_to_server.send(WorkMessage::Progress {
                job_id: job_id.clone(),
                run,
                event,
            });
        })
    }

    async fn run_local(&self) -> Result<JobOutput, AppError> {
        let bridge = self.services.bridge.clone().ok_or_else(|| {
            classify(&RawError::named(names::WORKER, "no worker bridge configured"), None)
        })?;
        if !bridge.is_running() && bridge.restart_if_faulted().await {
            warn!("Execution context was down, restarted");
        }
        self.report(ProgressEvent::new(self.job_id.clone(), Stage::Validation, 5));

        if self.kind == JobKind::Compress && self.source.size() > self.config.stream_threshold {
            return self.compress_streamed(bridge).await;
        }

        let operation = match self.kind {
            JobKind::Merge => Operation::Merge,
            JobKind::Validate => Operation::Validate,
            _ => Operation::Compress,
        };
        let mut buffers = vec![self.source.data.clone()];
        if self.kind == JobKind::Merge {
            buffers.extend(self.options.merge_with.iter().map(|file| file.data.clone()));
        }
        let payload = WorkPayload {
            buffers,
            options: self.options.clone(),
        };
        let output = bridge
            .invoke_cancellable(operation, payload, Some(self.worker_progress(10, 80)), &self.cancel)
            .await?;

        self.report(ProgressEvent::new(self.job_id.clone(), Stage::Saving, 95));
        Ok(JobOutput {
            data: Some(output.data),
            pages_processed: output.pages_processed,
            warnings: output.warnings,
            engine_used: Some(output.engine),
            detail: None,
            download_url: None,
        })
    }

    async fn compress_streamed(&self, bridge: Arc<WorkerBridge>) -> Result<JobOutput, AppError> {
        let options = self.options.clone();
        let cancel = self.cancel.clone();
        let policy = self.config.chunk_retry.clone();
        let engine = bridge.engine_name().to_string();

        let operation = move |chunk: Chunk| {
            let bridge = bridge.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            let policy = policy.clone();
            async move {
                let index = chunk.index;
                retry_cancellable(
                    || {
                        let bridge = bridge.clone();
                        let cancel = cancel.clone();
                        let payload = WorkPayload {
                            buffers: vec![chunk.data.clone()],
                            options: options.clone(),
                        };
                        async move {
                            bridge
                                .invoke_cancellable(Operation::Compress, payload, None, &cancel)
                                .await
                                .map(|output| output.data)
                        }
                    },
                    &policy,
                    worth_retrying,
                    |attempt, err| warn!(chunk = index, attempt, error = %err, "Chunk failed, retrying"),
                    &cancel,
                )
                .await
            }
        };

        let job_id = self.job_id.clone();
        let on_progress = |progress: StreamProgress| {
            let stage = match progress.phase {
                Phase::Reading => Stage::Loading,
                Phase::Processing => Stage::Processing,
                Phase::Combining => Stage::Saving,
            };
            let event = ProgressEvent::new(job_id.clone(), stage, progress.percentage)
                .with_items(progress.chunk_index as u32 + 1, progress.total_chunks as u32)
                .with_bytes(progress.bytes_done, progress.bytes_total);
            self.report(event);
        };

        let data = self
            .services
            .streamer
            .process(self.source.data.clone(), operation, &self.config.stream, on_progress, &self.cancel)
            .await?;

        Ok(JobOutput {
            pages_processed: count_pages(&data),
            data: Some(data),
            warnings: Vec::new(),
            engine_used: Some(engine),
            detail: None,
            download_url: None,
        })
    }

    async fn run_remote(&self) -> Result<JobOutput, AppError> {
        let remote = self.services.remote.clone().ok_or_else(|| {
            classify(&RawError::named(names::PROCESSING, "no remote service configured"), None)
        })?;
        let policy = &self.config.remote_retry;

        self.report(ProgressEvent::new(self.job_id.clone(), Stage::Loading, 1));
        let upload = retry_cancellable(
            || async {
                remote
                    .upload(&self.source, self.kind, &self.options)
                    .await
                    .map_err(|raw| classify(&raw, Some(ErrorContext::Upload)))
            },
            policy,
            worth_retrying,
            |attempt, err| warn!(attempt, error = %err, "Upload failed, retrying"),
            &self.cancel,
        )
        .await?;
        let remote_id = upload.job_id;
        debug!(remote_job_id = %remote_id, "Uploaded");
        self.report(ProgressEvent::new(self.job_id.clone(), Stage::Loading, 10));

        let terminal = match &self.services.channel {
            Some(channel) => self.follow_channel(channel, &remote_id).await?,
            None => self.poll_status(remote.as_ref(), &remote_id).await?,
        };
        if terminal.status != RemoteStatus::Completed {
            let reason = terminal
                .error
                .unwrap_or_else(|| format!("remote job ended as {:?}", terminal.status));
            return Err(classify(
                &RawError::named(names::PROCESSING, reason),
                Some(ErrorContext::Status),
            ));
        }

        self.report(ProgressEvent::new(self.job_id.clone(), Stage::Saving, 95));
        let detail = retry_cancellable(
            || async {
                remote
                    .result(&remote_id)
                    .await
                    .map_err(|raw| classify(&raw, Some(ErrorContext::Status)))
            },
            policy,
            worth_retrying,
            |attempt, err| warn!(attempt, error = %err, "Result fetch failed, retrying"),
            &self.cancel,
        )
        .await?;
        let data = retry_cancellable(
            || async {
                remote
                    .download(&remote_id)
                    .await
                    .map_err(|raw| classify(&raw, Some(ErrorContext::Download)))
            },
            policy,
            worth_retrying,
            |attempt, err| warn!(attempt, error = %err, "Download failed, retrying"),
            &self.cancel,
        )
        .await?;

        Ok(JobOutput {
            data: Some(data),
            pages_processed: detail.result.pages_processed,
            warnings: detail.result.warnings.clone(),
            engine_used: Some(detail.result.engine_used.clone()),
            download_url: detail.download_url.clone(),
            detail: Some(detail),
        })
    }

    async fn follow_channel(&self, channel: &RealtimeChannel, remote_id: &str) -> Result<ChannelMessage, AppError> {
        let (send_to_run, mut recv_from_channel) = mpsc::unbounded_channel();
        let send_error = send_to_run.clone();
        let handle = channel.open(
            remote_id,
            move |msg| {
                let _ = send_to_run.send(Ok(msg));
            },
            move |err| {
                let _ = send_error.send(Err(err));
            },
        );

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                next = recv_from_channel.recv() => Some(next),
            };
            match next {
                None => break Err(self.cancelled()),
                Some(Some(Ok(msg))) if msg.status.is_terminal() => break Ok(msg),
                Some(Some(Ok(msg))) => {
                    let mut event = ProgressEvent::new(self.job_id.clone(), Stage::Processing, msg.percentage());
                    event.current_item = msg.message.clone();
                    self.report(event);
                }
                Some(Some(Err(err))) => break Err(err),
                Some(None) => {
                    break Err(classify(
                        &RawError::named(names::NETWORK, "realtime channel ended without a terminal status"),
                        Some(ErrorContext::Realtime),
                    ))
                }
            }
        };
        channel.close(&handle);
        outcome
    }

    async fn poll_status(&self, remote: &dyn RemoteBackend, remote_id: &str) -> Result<ChannelMessage, AppError> {
        loop {
            let status = retry_cancellable(
                || async {
                    remote
                        .status(remote_id)
                        .await
                        .map_err(|raw| classify(&raw, Some(ErrorContext::Status)))
                },
                &self.config.remote_retry,
                worth_retrying,
                |attempt, err| warn!(attempt, error = %err, "Status poll failed, retrying"),
                &self.cancel,
            )
            .await?;
            let msg = ChannelMessage::from(status);
            if msg.status.is_terminal() {
                return Ok(msg);
            }
            self.report(ProgressEvent::new(self.job_id.clone(), Stage::Processing, msg.percentage()));

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                _ = sleep(self.config.poll_interval) => {}
            }
        }
    }
}
