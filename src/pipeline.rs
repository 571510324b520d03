//! Worker pool feeding samples through a bounded queue.
//!
//! Workers pull the next window from the shared sampler, build the sample and
//! push it onto a bounded channel; a full channel blocks producers. With zero
//! workers everything runs inline on the consumer's thread.
//!
//! Grid sampling is delivered in emission order (reordered by sequence number
//! on the consumer side). Workers never run more than `prefetch + num_workers`
//! sequence numbers ahead of the last delivered sample, so one slow window
//! holds back the pool instead of filling the reorder buffer. Random and
//! stratified sampling are delivered as they complete.
//!
//! A panic while building a sample is caught on the worker and ends the
//! stream with [`Error::WorkerPanicked`].
//!
//! Dropping the stream cancels it: the receiver is closed, workers notice on
//! their next send or pull and exit after the window in hand.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::augment::build_all;
use crate::batch::{BatchAssembler, Batches, Sample};
use crate::dataset::SampleEngine;
use crate::error::{Error, Result, SampleError, SampleFailure};
use crate::geometry::BoundingBox;
use crate::sampler::SamplerKind;

type Outcome = (u64, std::result::Result<Sample, SampleFailure>);

/// What a worker hands to the consumer.
enum Message {
    Outcome(Outcome),
    Panicked { seq: u64 },
}

/// Run counters shared between the pipeline and its consumer.
#[derive(Debug, Default)]
pub struct RunStats {
    emitted: AtomicU64,
    skipped_index: AtomicU64,
    skipped_reprojection: AtomicU64,
    skipped_source_io: AtomicU64,
}

/// Serializable view of [`RunStats`] plus reader counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatsSnapshot {
    pub samples_emitted: u64,
    pub skipped_index: u64,
    pub skipped_reprojection: u64,
    pub skipped_source_io: u64,
    pub physical_reads: u64,
    pub cache_hits: u64,
    pub cache_coalesced: u64,
}

impl RunStatsSnapshot {
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped_index + self.skipped_reprojection + self.skipped_source_io
    }
}

impl RunStats {
    fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, failure: &SampleFailure) {
        let counter = match failure.error {
            SampleError::Index(_) => &self.skipped_index,
            SampleError::Reprojection(_) => &self.skipped_reprojection,
            SampleError::SourceIo(_) => &self.skipped_source_io,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, engine: &SampleEngine) -> RunStatsSnapshot {
        let cache = engine.reader().cache_stats();
        RunStatsSnapshot {
            samples_emitted: self.emitted.load(Ordering::Relaxed),
            skipped_index: self.skipped_index.load(Ordering::Relaxed),
            skipped_reprojection: self.skipped_reprojection.load(Ordering::Relaxed),
            skipped_source_io: self.skipped_source_io.load(Ordering::Relaxed),
            physical_reads: engine.reader().physical_reads(),
            cache_hits: cache.hits,
            cache_coalesced: cache.coalesced,
        }
    }
}

/// Pool settings, normally taken from [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub num_workers: usize,
    pub prefetch: usize,
    pub max_consecutive_failures: usize,
}

impl PipelineOptions {
    #[must_use]
    pub fn from_engine(engine: &SampleEngine) -> Self {
        let cfg = engine.config();
        Self {
            num_workers: cfg.num_workers,
            prefetch: cfg.prefetch_depth(),
            max_consecutive_failures: cfg.max_consecutive_failures.max(1),
        }
    }
}

/// Sampler plus sequence bookkeeping, behind one lock.
struct SharedSampler {
    sampler: SamplerKind,
    next_seq: u64,
    /// Sequence numbers handed out may not reach `delivered + window`.
    window: Option<u64>,
    delivered: u64,
}

impl SharedSampler {
    fn new(sampler: SamplerKind, window: Option<u64>) -> Self {
        Self {
            sampler,
            next_seq: 0,
            window,
            delivered: 0,
        }
    }

    fn has_room(&self) -> bool {
        self.window.map_or(true, |window| self.next_seq < self.delivered + window)
    }

    fn next(&mut self) -> Option<(u64, BoundingBox)> {
        let bbox = self.sampler.next()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        Some((seq, bbox))
    }
}

/// The shared sampler and the condvar workers park on while the window is full.
struct Feed {
    shared: Mutex<SharedSampler>,
    room: Condvar,
}

impl Feed {
    fn new(shared: SharedSampler) -> Self {
        Self {
            shared: Mutex::new(shared),
            room: Condvar::new(),
        }
    }

    /// Next window to sample; blocks while the window is full. `None` once
    /// the sampler is exhausted or the stream is cancelled.
    fn claim(&self, cancel: &AtomicBool) -> Option<(u64, BoundingBox)> {
        let mut shared = self.shared.lock();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            if shared.has_room() {
                return shared.next();
            }
            self.room.wait(&mut shared);
        }
    }

    /// Everything below `delivered` has reached the consumer.
    fn release(&self, delivered: u64) {
        self.shared.lock().delivered = delivered;
        self.room.notify_all();
    }

    /// Wake every parked worker so it can observe cancellation.
    fn wake_all(&self) {
        let _shared = self.shared.lock();
        self.room.notify_all();
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Build one sample, turning a panic into [`Message::Panicked`].
fn run_sample(engine: &SampleEngine, seq: u64, bbox: BoundingBox) -> Message {
    let result = panic::catch_unwind(AssertUnwindSafe(|| engine.sample(bbox)));
    match result {
        Ok(outcome) => Message::Outcome((
            seq,
            outcome.map(|mut sample| {
                sample.meta.seq = seq;
                sample
            }),
        )),
        Err(payload) => {
            error!(seq, bbox = %bbox, reason = panic_reason(payload.as_ref()), "Sampling panicked");
            Message::Panicked { seq }
        }
    }
}

fn worker_loop(engine: &SampleEngine, feed: &Feed, cancel: &AtomicBool, tx: &Sender<Message>) {
    while let Some((seq, bbox)) = feed.claim(cancel) {
        let message = run_sample(engine, seq, bbox);
        let panicked = matches!(message, Message::Panicked { .. });
        if tx.send(message).is_err() || panicked {
            break;
        }
    }
}

enum Producer {
    Inline {
        engine: Arc<SampleEngine>,
        sampler: SharedSampler,
    },
    Workers {
        rx: Option<Receiver<Message>>,
        feed: Arc<Feed>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Stream of samples for one epoch.
///
/// Yields `Ok(sample)`, non-fatal `Err(Error::Sample(..))` for each dropped
/// sample, and at most one fatal error after which it ends.
pub struct SampleStream {
    engine: Arc<SampleEngine>,
    producer: Producer,
    cancel: Arc<AtomicBool>,
    stats: Arc<RunStats>,
    ordered: bool,
    reorder: BTreeMap<u64, std::result::Result<Sample, SampleFailure>>,
    next_seq: u64,
    consecutive_failures: usize,
    max_consecutive_failures: usize,
    finished: bool,
}

impl SampleStream {
    /// Start producing samples from `sampler`.
    ///
    /// # Errors
    /// Returns an error if a worker thread cannot be spawned.
    pub fn spawn(engine: Arc<SampleEngine>, sampler: SamplerKind, options: PipelineOptions) -> Result<Self> {
        let ordered = sampler.is_ordered();
        let cancel = Arc::new(AtomicBool::new(false));
        let window = (ordered && options.num_workers > 0)
            .then(|| u64::try_from(options.prefetch.max(1) + options.num_workers).unwrap_or(u64::MAX));
        let shared = SharedSampler::new(sampler, window);
        info!(
            policy = ?shared.sampler.policy(),
            workers = options.num_workers,
            prefetch = options.prefetch,
            "Starting sample stream"
        );

        let producer = if options.num_workers == 0 {
            Producer::Inline {
                engine: Arc::clone(&engine),
                sampler: shared,
            }
        } else {
            let (tx, rx) = bounded(options.prefetch.max(1));
            let feed = Arc::new(Feed::new(shared));
            let mut handles = Vec::with_capacity(options.num_workers);
            for i in 0..options.num_workers {
                let worker_engine = Arc::clone(&engine);
                let worker_feed = Arc::clone(&feed);
                let worker_cancel = Arc::clone(&cancel);
                let worker_tx = tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("geosample-worker-{i}"))
                    .spawn(move || worker_loop(&worker_engine, &worker_feed, &worker_cancel, &worker_tx))
                    .map_err(|e| {
                        cancel.store(true, Ordering::Relaxed);
                        feed.wake_all();
                        crate::error::ConfigError::new(format!("cannot spawn worker: {e}"))
                    })?;
                handles.push(handle);
            }
            Producer::Workers {
                rx: Some(rx),
                feed,
                handles,
            }
        };

        Ok(Self {
            engine,
            producer,
            cancel,
            stats: Arc::new(RunStats::default()),
            ordered,
            reorder: BTreeMap::new(),
            next_seq: 0,
            consecutive_failures: 0,
            max_consecutive_failures: options.max_consecutive_failures.max(1),
            finished: false,
        })
    }

    #[must_use]
    pub fn stats(&self) -> RunStatsSnapshot {
        self.stats.snapshot(&self.engine)
    }

    /// Stop producing. Windows already in flight finish; nothing further is read.
    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.finished = true;
        if let Producer::Workers { rx, feed, handles } = &mut self.producer {
            feed.wake_all();
            // closing the channel unblocks producers waiting on a full queue
            drop(rx.take());
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }

    /// Next outcome in delivery order, `None` when production is over.
    fn pull(&mut self) -> Option<Result<Outcome>> {
        let item = self.receive();
        if let (Some(Ok(_)), Producer::Workers { feed, .. }) = (&item, &self.producer) {
            if self.ordered {
                feed.release(self.next_seq);
            }
        }
        item
    }

    fn receive(&mut self) -> Option<Result<Outcome>> {
        if self.ordered {
            if let Some(outcome) = self.reorder.remove(&self.next_seq) {
                self.next_seq += 1;
                return Some(Ok((self.next_seq - 1, outcome)));
            }
        }
        match &mut self.producer {
            Producer::Inline { engine, sampler } => {
                let (seq, bbox) = sampler.next()?;
                match run_sample(engine, seq, bbox) {
                    Message::Outcome(outcome) => Some(Ok(outcome)),
                    Message::Panicked { .. } => Some(Err(Error::WorkerPanicked)),
                }
            }
            Producer::Workers { rx, handles, .. } => {
                let receiver = rx.as_ref()?;
                loop {
                    match receiver.recv() {
                        Ok(Message::Panicked { seq }) => {
                            debug!(seq, "Worker reported a panic");
                            return Some(Err(Error::WorkerPanicked));
                        }
                        Ok(Message::Outcome((seq, outcome))) if !self.ordered || seq == self.next_seq => {
                            self.next_seq = seq + 1;
                            return Some(Ok((seq, outcome)));
                        }
                        Ok(Message::Outcome((seq, outcome))) => {
                            self.reorder.insert(seq, outcome);
                        }
                        Err(_) => {
                            // every worker has exited
                            drop(rx.take());
                            let panicked = handles.drain(..).map(JoinHandle::join).filter(|r| r.is_err()).count();
                            if panicked > 0 {
                                return Some(Err(Error::WorkerPanicked));
                            }
                            // flush what is left in order
                            let (seq, outcome) = self.reorder.pop_first()?;
                            self.next_seq = seq + 1;
                            return Some(Ok((seq, outcome)));
                        }
                    }
                }
            }
        }
    }
}

impl Iterator for SampleStream {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Result<Sample>> {
        if self.finished {
            return None;
        }
        let (seq, outcome) = match self.pull() {
            Some(Ok(item)) => item,
            Some(Err(fatal)) => {
                self.cancel();
                return Some(Err(fatal));
            }
            None => {
                self.finished = true;
                info!(stats = ?self.stats(), "Sample stream finished");
                return None;
            }
        };

        match outcome {
            Ok(sample) => {
                self.consecutive_failures = 0;
                self.stats.record_emitted();
                Some(Ok(sample))
            }
            Err(failure) => {
                self.stats.record_failure(&failure);
                warn!(seq, bbox = %failure.bbox, error = %failure.error, "Skipping sample");
                if let SampleError::SourceIo(last) = &failure.error {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.max_consecutive_failures {
                        let err = Error::TooManyFailures {
                            consecutive: self.consecutive_failures,
                            last: last.clone(),
                        };
                        self.cancel();
                        return Some(Err(err));
                    }
                }
                Some(Err(Error::Sample(failure)))
            }
        }
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Sample stream dropped before completion");
        }
        self.cancel();
    }
}

/// Engine plus batching: the interface handed to a training loop.
pub struct Pipeline {
    engine: Arc<SampleEngine>,
    options: PipelineOptions,
}

impl Pipeline {
    #[must_use]
    pub fn new(engine: SampleEngine) -> Self {
        let options = PipelineOptions::from_engine(&engine);
        Self {
            engine: Arc::new(engine),
            options,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<SampleEngine> {
        &self.engine
    }

    /// Samples for one epoch.
    ///
    /// # Errors
    /// Returns a [`ConfigError`](crate::error::ConfigError) if the sampler
    /// cannot be built for this corpus.
    pub fn samples(&self) -> Result<SampleStream> {
        let sampler = self.engine.sampler()?;
        SampleStream::spawn(Arc::clone(&self.engine), sampler, self.options)
    }

    /// Assembler matching the engine's output shape and augmentation settings.
    ///
    /// # Errors
    /// Returns a [`ConfigError`](crate::error::ConfigError) for an invalid augmentation.
    pub fn assembler(&self) -> Result<BatchAssembler> {
        let cfg = self.engine.config();
        Ok(BatchAssembler::new(
            cfg.batch_size,
            self.engine.tile_shape(),
            self.engine.bands(),
            self.engine.has_labels(),
        )
        .with_augmentations(build_all(&cfg.augmentations)?)
        .with_one_hot(cfg.one_hot_classes)
        .with_seed(cfg.seed))
    }

    /// Batches for one epoch.
    ///
    /// # Errors
    /// See [`samples`](Self::samples) and [`assembler`](Self::assembler).
    pub fn batches(&self) -> Result<Batches<SampleStream>> {
        Ok(self.assembler()?.batches(self.samples()?))
    }
}
