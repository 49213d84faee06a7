use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use docflow::bridge::{BridgeConfig, WorkerBridge};
use docflow::chunked::{ChunkedStreamProcessor, StreamOptions};
use docflow::engine::PassthroughEngine;
use docflow::realtime::{ChannelConfig, RealtimeChannel, WsConnector};
use docflow::remote::{RemoteBackend, RemoteClient, RemoteConfig};
use docflow::telemetry;
use docflow::{
    CoordinatorConfig, InputFile, JobCoordinator, JobEvent, JobKind, ProcessingOptions, Quality, Services, Status,
};

const MIB: u64 = 1024 * 1024;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'k',
        long = "kind",
        value_enum,
        help = "Operation to run on every input",
        default_value = "compress"
    )]
    kind: JobKind,

    #[arg(required = true, help = "Input documents; for merge the first is primary")]
    files: Vec<PathBuf>,

    #[arg(short = 'q', long = "quality", value_enum, default_value = "medium")]
    quality: Quality,

    #[arg(long = "compression_level", help = "Compression level, 1-9")]
    compression_level: Option<u8>,

    #[arg(short = 'r', long = "remote_url", help = "Remote processing service, e.g. http://127.0.0.1:8080/api")]
    remote_url: Option<String>,

    #[arg(long = "ws_url", help = "Realtime status channel, e.g. ws://127.0.0.1:8080")]
    ws_url: Option<String>,

    #[arg(short = 'n', long = "workers", help = "Number of background workers", default_value = "2")]
    workers: usize,

    #[arg(long = "call_timeout", help = "Seconds before a worker call times out", default_value = "120")]
    call_timeout: u64,

    #[arg(long = "chunk_size", help = "Chunk size in MiB for streamed inputs", default_value = "5")]
    chunk_size: u64,

    #[arg(long = "max_concurrency", help = "Chunks processed in parallel", default_value = "2")]
    max_concurrency: usize,

    #[arg(long = "max_memory", help = "In-flight memory ceiling in MiB", default_value = "256")]
    max_memory: u64,

    #[arg(long = "local_limit", help = "Largest input in MiB run locally when a remote is available", default_value = "20")]
    local_limit: u64,

    #[arg(short = 'o', long = "output_dir", help = "Where completed outputs are written", default_value = "./out")]
    output_dir: PathBuf,

    #[arg(long = "jaeger", help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces")]
    jaeger: Option<String>,
}

fn services(config: &ConfigContext) -> Result<Services, Error> {
    let bridge = WorkerBridge::new(
        Arc::new(PassthroughEngine),
        BridgeConfig {
            workers: config.workers,
            call_timeout: Duration::from_secs(config.call_timeout),
            ..Default::default()
        },
    );
    let remote = match &config.remote_url {
        Some(base_url) => {
            let client = RemoteClient::new(RemoteConfig {
                base_url: base_url.clone(),
                ..Default::default()
            })?;
            Some(Arc::new(client) as Arc<dyn RemoteBackend>)
        }
        None => None,
    };
    let channel = config
        .ws_url
        .as_ref()
        .map(|url| Arc::new(RealtimeChannel::new(Arc::new(WsConnector::new(url.clone())), ChannelConfig::default())));

    Ok(Services {
        bridge: Some(Arc::new(bridge)),
        streamer: ChunkedStreamProcessor::new(),
        remote,
        channel,
    })
}

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let coordinator_config = CoordinatorConfig {
        local_limit: config.local_limit * MIB,
        stream_threshold: config.chunk_size * MIB,
        stream: StreamOptions {
            chunk_size: (config.chunk_size * MIB) as usize,
            max_concurrency: config.max_concurrency,
            max_memory: (config.max_memory * MIB) as usize,
            ..Default::default()
        },
        ..Default::default()
    };
    let services = services(&config)?;
    let bridge = services.bridge.clone();
    let (coordinator, server) = JobCoordinator::start(cancel_token.clone(), coordinator_config, services);
    let mut events = coordinator.subscribe();

    let mut inputs = Vec::with_capacity(config.files.len());
    for path in &config.files {
        inputs.push(InputFile::from_path(path).await?);
    }
    let options = ProcessingOptions {
        quality: config.quality,
        compression_level: config.compression_level,
        ..Default::default()
    };

    let job_ids = if config.kind == JobKind::Merge {
        if inputs.len() < 2 {
            bail!("merge needs at least two input files");
        }
        let primary = inputs.remove(0);
        let options = ProcessingOptions {
            merge_with: inputs,
            ..options
        };
        vec![coordinator.submit(primary, config.kind, options).await?]
    } else {
        coordinator.submit_batch(inputs, config.kind, options).await?
    };
    debug!(count = job_ids.len(), "Done submitting jobs");

    let mut remaining = job_ids.len();
    while remaining > 0 {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Client Cancelled");
                break;
            },
            event = events.recv() => {
                match event {
                    Ok(JobEvent::Progress(progress)) => {
                        info!(job_id = %progress.job_id, stage = ?progress.stage, percentage = progress.percentage, "Progress");
                    },
                    Ok(JobEvent::Completed(job_id)) => {
                        remaining -= 1;
                        info!(%job_id, "Completed");
                    },
                    Ok(JobEvent::Failed(job_id, err)) => {
                        remaining -= 1;
                        error!(%job_id, kind = %err.kind, message = %err.user_message, "Failed");
                    },
                    Ok(event) => debug!(?event, "Event"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped events"),
                    Err(RecvError::Closed) => {
                        debug!("Coordinator closed unexpectedly, exiting");
                        break;
                    }
                }
            }
        }
    }

    tokio::fs::create_dir_all(&config.output_dir).await?;
    let mut completed = 0;
    let jobs = match coordinator.jobs().await {
        Ok(jobs) => jobs,
        Err(err) => {
            warn!(error = %err, "No job summary available");
            Vec::new()
        }
    };
    for job in jobs {
        match job.status {
            Status::Completed => {
                completed += 1;
                if let Some(data) = job.result.as_ref().and_then(|output| output.data.as_ref()) {
                    let target = config.output_dir.join(format!("{}-{}", job.kind, job.input.filename));
                    tokio::fs::write(&target, data).await?;
                    println!("{} {} -> {}", job.kind, job.input.filename, target.display());
                }
            }
            status => {
                let reason = job.error.as_ref().map(|err| err.user_message.clone()).unwrap_or_default();
                println!("{} {} {:?}: {}", job.kind, job.input.filename, status, reason);
            }
        }
    }
    println!("{completed}/{} jobs completed", job_ids.len());

    cancel_token.cancel();
    println!("Waiting for coordinator to shutdown...");
    server.await?;
    if let Some(bridge) = bridge {
        bridge.shutdown().await;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigContext::parse();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "docflow=debug");
    }

    telemetry::init(config.jaeger.as_deref())?;

    let token = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); signal_token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); signal_token.cancel()},
        }
    });

    let app = tokio::spawn(setup(token, config));
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
