//! Bounded-concurrency processing of large inputs.
//!
//! A run goes through four stages: slice the input into ordered chunks,
//! process them under a counting semaphore, watch memory while they run and
//! finally combine the results in index order. Any failure, including a
//! cancellation or memory abort, discards everything produced so far.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::error::{classify, names, ErrorContext, RawError};
use crate::AppError;

pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    /// Abort threshold for the memory probe, in bytes.
    pub max_memory: usize,
    /// Pause after each slice so other tasks get scheduled.
    pub slice_pause: Duration,
    pub memory_check_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrency: 2,
            max_memory: 256 * 1024 * 1024,
            slice_pause: Duration::from_millis(1),
            memory_check_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub total_chunks: usize,
    pub offset: usize,
    pub data: Bytes,
    pub is_last: bool,
}

/// Splits `input` into ordered, gap-free chunks of at most `chunk_size`
/// bytes. An empty input yields a single empty chunk.
pub fn slice(input: &Bytes, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let total_chunks = input.len().div_ceil(chunk_size).max(1);
    (0..total_chunks)
        .map(|index| {
            let offset = index * chunk_size;
            let end = (offset + chunk_size).min(input.len());
            Chunk {
                index,
                total_chunks,
                offset,
                data: input.slice(offset..end),
                is_last: index + 1 == total_chunks,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reading,
    Processing,
    Combining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProgress {
    pub phase: Phase,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Overall run progress: reading 0-10, processing 10-90, combining 90-100.
    pub percentage: u8,
}

impl StreamProgress {
    fn new(phase: Phase, done: usize, total: usize, bytes_done: usize, bytes_total: usize) -> Self {
        let (floor, span) = match phase {
            Phase::Reading => (0, 10),
            Phase::Processing => (10, 80),
            Phase::Combining => (90, 10),
        };
        let fraction = if total == 0 { 1.0 } else { done as f64 / total as f64 };
        Self {
            phase,
            chunk_index: done.saturating_sub(1),
            total_chunks: total,
            bytes_done: bytes_done as u64,
            bytes_total: bytes_total as u64,
            percentage: (floor as f64 + span as f64 * fraction).round() as u8,
        }
    }
}

/// Source of the memory figure the watchdog compares against `max_memory`.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> usize;

    /// Best-effort attempt to give memory back before the probe is re-read.
    fn reclaim(&self) {}
}

/// Bytes currently held by the run: chunks being processed plus results
/// waiting to be combined.
#[derive(Debug, Default)]
pub struct InFlightBytes(AtomicUsize);

impl InFlightBytes {
    fn hold(&self, bytes: usize) {
        self.0.fetch_add(bytes, Ordering::SeqCst);
    }

    fn release(&self, bytes: usize) {
        self.0.fetch_sub(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for InFlightBytes {
    fn sample(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryTrip {
    used: usize,
    limit: usize,
}

#[derive(Default, Clone)]
pub struct ChunkedStreamProcessor {
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl ChunkedStreamProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `probe` instead of the run's own in-flight byte count.
    pub fn with_probe(probe: Arc<dyn MemoryProbe>) -> Self {
        Self { probe: Some(probe) }
    }

    pub async fn process<F, Fut, P>(
        &self,
        input: Bytes,
        operation: F,
        options: &StreamOptions,
        on_progress: P,
        cancel: &CancellationToken,
    ) -> Result<Bytes, AppError>
    where
        F: Fn(Chunk) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, AppError>> + Send + 'static,
        P: Fn(StreamProgress),
    {
        let in_flight = Arc::new(InFlightBytes::default());
        let probe: Arc<dyn MemoryProbe> = match &self.probe {
            Some(probe) => probe.clone(),
            None => in_flight.clone(),
        };

        let abort = cancel.child_token();
        let tripped = Arc::new(OnceLock::new());
        let monitor = tokio::spawn(watch_memory(
            probe,
            options.max_memory,
            options.memory_check_interval,
            abort.clone(),
            tripped.clone(),
        ));

        let result = self
            .run(input, operation, options, &on_progress, &abort, &in_flight)
            .await;
        monitor.abort();

        if let Some(trip) = tripped.get() {
            let MemoryTrip { used, limit } = *trip;
            return Err(classify(
                &RawError::named(
                    names::MEMORY_EXCEEDED,
                    format!("memory usage {used} bytes exceeds limit of {limit} bytes"),
                ),
                Some(ErrorContext::Stream),
            ));
        }
        result
    }

    async fn run<F, Fut, P>(
        &self,
        input: Bytes,
        operation: F,
        options: &StreamOptions,
        on_progress: &P,
        abort: &CancellationToken,
        in_flight: &Arc<InFlightBytes>,
    ) -> Result<Bytes, AppError>
    where
        F: Fn(Chunk) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, AppError>> + Send + 'static,
        P: Fn(StreamProgress),
    {
        let bytes_total = input.len();

        // Slice
        let mut chunks = Vec::new();
        let mut bytes_read = 0;
        for chunk in slice(&input, options.chunk_size) {
            checkpoint(abort, "reading")?;
            bytes_read += chunk.data.len();
            let total = chunk.total_chunks;
            chunks.push(chunk);
            on_progress(StreamProgress::new(Phase::Reading, chunks.len(), total, bytes_read, bytes_total));
            pause(options.slice_pause).await;
        }
        checkpoint(abort, "reading")?;
        let total_chunks = chunks.len();
        debug!(total_chunks, bytes_total, "input sliced");

        // Bound
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency.max(1)));
        let operation = Arc::new(operation);
        let mut tasks = JoinSet::new();
        for chunk in chunks {
            let semaphore = semaphore.clone();
            let operation = operation.clone();
            let abort = abort.clone();
            let in_flight = in_flight.clone();
            tasks.spawn(async move {
                let index = chunk.index;
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| classify(&RawError::cancelled("semaphore closed"), Some(ErrorContext::Stream)))?;
                checkpoint(&abort, "processing")?;
                let held = chunk.data.len();
                in_flight.hold(held);
                let result = operation(chunk).await;
                in_flight.release(held);
                let output = result?;
                in_flight.hold(output.len());
                Ok::<_, AppError>((index, output))
            });
        }

        let mut results: Vec<Option<Bytes>> = vec![None; total_chunks];
        let mut done = 0;
        let mut bytes_done = 0;
        while done < total_chunks {
            let joined = tokio::select! {
                biased;
                _ = abort.cancelled() => return Err(cancelled("processing")),
                joined = tasks.join_next() => joined,
            };
            let (index, output) = match joined {
                Some(Ok(Ok(pair))) => pair,
                Some(Ok(Err(err))) => {
                    warn!(error = %err, "chunk failed, aborting run");
                    return Err(err);
                }
                Some(Err(join_err)) => {
                    error!(error = %join_err, "chunk task died");
                    return Err(classify(
                        &RawError::named(names::PROCESSING, format!("chunk task died: {join_err}")),
                        Some(ErrorContext::Stream),
                    ));
                }
                None => break,
            };
            done += 1;
            bytes_done += output.len();
            results[index] = Some(output);
            on_progress(StreamProgress::new(Phase::Processing, done, total_chunks, bytes_done, bytes_total));
        }

        // Combine
        checkpoint(abort, "combining")?;
        let mut combined = BytesMut::with_capacity(bytes_done);
        for (index, part) in results.into_iter().enumerate() {
            let part = part.ok_or_else(|| {
                classify(
                    &RawError::named(names::PROCESSING, format!("chunk {index} produced no result")),
                    Some(ErrorContext::Stream),
                )
            })?;
            combined.extend_from_slice(&part);
            in_flight.release(part.len());
            on_progress(StreamProgress::new(
                Phase::Combining,
                index + 1,
                total_chunks,
                combined.len(),
                bytes_done,
            ));
        }
        Ok(combined.freeze())
    }
}

fn cancelled(stage: &str) -> AppError {
    classify(
        &RawError::cancelled(format!("stream run cancelled while {stage}")),
        Some(ErrorContext::Stream),
    )
}

fn checkpoint(abort: &CancellationToken, stage: &str) -> Result<(), AppError> {
    if abort.is_cancelled() {
        return Err(cancelled(stage));
    }
    Ok(())
}

async fn pause(duration: Duration) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else {
        sleep(duration).await;
    }
}

async fn watch_memory(
    probe: Arc<dyn MemoryProbe>,
    limit: usize,
    every: Duration,
    abort: CancellationToken,
    tripped: Arc<OnceLock<MemoryTrip>>,
) {
    let mut ticker = interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = abort.cancelled() => break,
            _ = ticker.tick() => {
                if probe.sample() <= limit {
                    continue;
                }
                debug!(limit, "memory over limit, reclaiming");
                probe.reclaim();
                tokio::task::yield_now().await;
                let used = probe.sample();
                if used > limit {
                    warn!(used, limit, "memory limit exceeded, aborting stream run");
                    let _ = tripped.set(MemoryTrip { used, limit });
                    abort.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    const MIB: usize = 1024 * 1024;

    fn options(chunk_size: usize, max_concurrency: usize) -> StreamOptions {
        StreamOptions {
            chunk_size,
            max_concurrency,
            slice_pause: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn twelve_mib_makes_three_chunks() {
        let input = Bytes::from(vec![7u8; 12 * MIB]);
        let chunks = slice(&input, 5 * MIB);

        assert_eq!(chunks.len(), 3);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);
        assert!(chunks.iter().all(|c| c.total_chunks == 3));
        let last: Vec<bool> = chunks.iter().map(|c| c.is_last).collect();
        assert_eq!(last, vec![false, false, true]);
        assert_eq!(chunks[2].index, 2);
        assert_eq!(chunks[2].offset, 10 * MIB);
    }

    #[test]
    fn empty_input_is_one_empty_chunk() {
        let chunks = slice(&Bytes::new(), 5 * MIB);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_last);
        assert!(chunks[0].data.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_completion_order_still_combines_in_order() {
        let input = Bytes::from((0..=255u8).cycle().take(1000).collect::<Vec<_>>());
        let processor = ChunkedStreamProcessor::new();

        // Earlier chunks finish later.
        let out = processor
            .process(
                input.clone(),
                |chunk: Chunk| async move {
                    let wait = (chunk.total_chunks - chunk.index) as u64;
                    sleep(Duration::from_millis(wait * 10)).await;
                    Ok(chunk.data)
                },
                &options(64, 4),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out, input);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());

        ChunkedStreamProcessor::new()
            .process(
                Bytes::from(vec![1u8; 100]),
                move |chunk: Chunk| {
                    let (active, peak) = (a.clone(), p.clone());
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(chunk.data)
                    }
                },
                &options(10, 2),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn single_chunk_goes_through_every_phase() {
        let phases = Mutex::new(Vec::new());
        let out = ChunkedStreamProcessor::new()
            .process(
                Bytes::from_static(b"tiny"),
                |chunk: Chunk| async move { Ok(chunk.data) },
                &options(MIB, 1),
                |p| phases.lock().push((p.phase, p.percentage)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(out, Bytes::from_static(b"tiny"));
        assert_eq!(
            *phases.lock(),
            vec![(Phase::Reading, 10), (Phase::Processing, 90), (Phase::Combining, 100)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_chunk_fails_the_run() {
        let result = ChunkedStreamProcessor::new()
            .process(
                Bytes::from(vec![0u8; 30]),
                |chunk: Chunk| async move {
                    if chunk.index == 1 {
                        Err(classify(&RawError::named(names::PROCESSING, "bad chunk"), None))
                    } else {
                        Ok(chunk.data)
                    }
                },
                &options(10, 1),
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.details.cause, "bad chunk");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_produces_nothing() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let result = ChunkedStreamProcessor::new()
            .process(
                Bytes::from(vec![0u8; 50]),
                move |chunk: Chunk| {
                    let (trigger, counter) = (trigger.clone(), counter.clone());
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        trigger.cancel();
                        Ok(chunk.data)
                    }
                },
                &options(10, 1),
                |_| {},
                &token,
            )
            .await;

        assert!(result.unwrap_err().is_cancelled());
        // Sequential run: the first chunk cancels, later chunks never start.
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    struct FixedProbe {
        used: usize,
        reclaimed: AtomicUsize,
    }

    impl MemoryProbe for FixedProbe {
        fn sample(&self) -> usize {
            self.used
        }

        fn reclaim(&self) {
            self.reclaimed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn memory_abort_discards_output() {
        let probe = Arc::new(FixedProbe {
            used: 64 * MIB,
            reclaimed: AtomicUsize::new(0),
        });
        let processor = ChunkedStreamProcessor::with_probe(probe.clone());
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = emitted.clone();

        let result = processor
            .process(
                Bytes::from(vec![0u8; 40]),
                |chunk: Chunk| async move {
                    sleep(Duration::from_millis(50)).await;
                    Ok(chunk.data)
                },
                &StreamOptions {
                    max_memory: 32 * MIB,
                    ..options(10, 2)
                },
                move |p| {
                    if p.phase == Phase::Combining {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_memory_exceeded());
        assert_eq!(err.kind, ErrorKind::Processing);
        assert!(probe.reclaimed.load(Ordering::SeqCst) >= 1);
        assert_eq!(emitted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_proxy_trips_on_large_chunks() {
        let result = ChunkedStreamProcessor::new()
            .process(
                Bytes::from(vec![0u8; 4096]),
                |chunk: Chunk| async move {
                    sleep(Duration::from_millis(500)).await;
                    Ok(chunk.data)
                },
                &StreamOptions {
                    max_memory: 1024,
                    memory_check_interval: Duration::from_millis(10),
                    ..options(2048, 2)
                },
                |_| {},
                &CancellationToken::new(),
            )
            .await;

        assert!(result.unwrap_err().is_memory_exceeded());
    }

    proptest! {
        #[test]
        fn output_matches_sequential_for_any_completion_order(
            data in proptest::collection::vec(any::<u8>(), 0..400),
            chunk_size in 1usize..64,
            concurrency in 1usize..5,
            delays in proptest::collection::vec(0u64..20, 1..32),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let input = Bytes::from(data);
            let expected: Vec<u8> = input.iter().map(|b| b.wrapping_add(1)).collect();
            let delays = Arc::new(delays);

            let out = runtime.block_on(async {
                ChunkedStreamProcessor::new()
                    .process(
                        input,
                        move |chunk: Chunk| {
                            let delay = delays[chunk.index % delays.len()];
                            async move {
                                sleep(Duration::from_millis(delay)).await;
                                Ok(Bytes::from(
                                    chunk.data.iter().map(|b| b.wrapping_add(1)).collect::<Vec<_>>(),
                                ))
                            }
                        },
                        &options(chunk_size, concurrency),
                        |_| {},
                        &CancellationToken::new(),
                    )
                    .await
            });

            prop_assert_eq!(out.unwrap().to_vec(), expected);
        }
    }
}
