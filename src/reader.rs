//! Cached, deadline-bounded access to native source windows.
//!
//! With a deadline configured, physical reads run on a fixed pool of reader
//! threads. A read that misses its deadline keeps its pool thread until the
//! source returns; each source may hold at most
//! [`MAX_STALLED_READS_PER_SOURCE`] such threads, further reads of a stalled
//! source fail fast with [`SourceIoKind::Timeout`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use ndarray::Array3;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace, warn};

use crate::align::ReadWindow;
use crate::error::{SourceIoError, SourceIoKind};
use crate::geometry::PixelWindow;
use crate::source::{SourceId, SourceReader};
use crate::tile_cache::{CacheStats, TileCache};

/// Timed-out reads a single source may keep on the reader pool.
pub const MAX_STALLED_READS_PER_SOURCE: usize = 2;

/// Reader pool size when none is configured.
pub const DEFAULT_READ_THREADS: usize = 4;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const ABANDONED: u8 = 3;

/// Lifecycle of one pooled read, shared by the caller and the pool job.
struct ReadTicket {
    state: AtomicU8,
    stalled: Arc<AtomicUsize>,
}

impl ReadTicket {
    /// Called by the job before reading; false if the caller already gave up.
    fn start(&self) -> bool {
        if self
            .state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
        self.stalled.fetch_sub(1, Ordering::AcqRel);
        false
    }

    /// Called by the job after reading.
    fn finish(&self) {
        if self.state.swap(FINISHED, Ordering::AcqRel) == ABANDONED {
            self.stalled.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Called by the caller on timeout; false if the job finished meanwhile.
    fn abandon(&self) -> bool {
        self.stalled.fetch_add(1, Ordering::AcqRel);
        let abandoned = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s == QUEUED || s == RUNNING).then_some(ABANDONED)
            })
            .is_ok();
        if !abandoned {
            self.stalled.fetch_sub(1, Ordering::AcqRel);
        }
        abandoned
    }
}

type PooledResult = std::thread::Result<Result<Array3<f32>, SourceIoError>>;

/// Reads native windows through a shared [`TileCache`].
///
/// Readers are registered in the same order as the sources in the
/// [`SpatialIndex`](crate::index::SpatialIndex), so a [`SourceId`] addresses both.
pub struct TileReader {
    readers: Vec<Arc<dyn SourceReader>>,
    stalled: Vec<Arc<AtomicUsize>>,
    cache: TileCache,
    timeout: Option<Duration>,
    read_threads: usize,
    pool: OnceLock<Result<ThreadPool, String>>,
    physical_reads: AtomicU64,
}

impl TileReader {
    #[must_use]
    pub fn new(cache_capacity: usize, timeout: Option<Duration>) -> Self {
        Self {
            readers: Vec::new(),
            stalled: Vec::new(),
            cache: TileCache::new(cache_capacity),
            timeout,
            read_threads: DEFAULT_READ_THREADS,
            pool: OnceLock::new(),
            physical_reads: AtomicU64::new(0),
        }
    }

    /// Size of the pool that serves deadline-bounded reads.
    #[must_use]
    pub fn with_read_threads(mut self, threads: usize) -> Self {
        self.read_threads = threads.max(1);
        self
    }

    /// Register a reader; returns the id it answers to.
    pub fn register(&mut self, reader: Arc<dyn SourceReader>) -> SourceId {
        self.readers.push(reader);
        self.stalled.push(Arc::new(AtomicUsize::new(0)));
        SourceId(self.readers.len() - 1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    #[must_use]
    pub fn read_threads(&self) -> usize {
        self.read_threads
    }

    /// Reads of `id` that missed their deadline and have not returned yet.
    #[must_use]
    pub fn stalled_reads(&self, id: SourceId) -> usize {
        self.stalled.get(id.0).map_or(0, |n| n.load(Ordering::Acquire))
    }

    /// Native pixels for a read plan, `[bands, rows, cols]`.
    ///
    /// # Errors
    /// Returns a [`SourceIoError`] if the source is unknown, the window is
    /// empty, the read fails, or it exceeds the configured deadline.
    pub fn read(&self, plan: &ReadWindow) -> Result<Arc<Array3<f32>>, SourceIoError> {
        self.read_window(plan.source, plan.window)
    }

    /// Native pixels of `window` in source `id`.
    ///
    /// # Errors
    /// See [`read`](Self::read).
    pub fn read_window(&self, id: SourceId, window: PixelWindow) -> Result<Arc<Array3<f32>>, SourceIoError> {
        let reader = self.readers.get(id.0).ok_or_else(|| {
            SourceIoError::new(SourceIoKind::Open, id.to_string(), "no reader registered").with_source(id)
        })?;
        if window.is_empty() {
            return Err(SourceIoError::new(
                SourceIoKind::OutOfBounds,
                reader.location(),
                format!("empty window {window}"),
            )
            .with_source(id));
        }

        self.cache
            .get_or_load((id, window), || self.read_physical(id, reader, window))
            .map_err(|e| e.with_source(id))
    }

    fn pool(&self) -> Result<&ThreadPool, SourceIoError> {
        self.pool
            .get_or_init(|| {
                ThreadPoolBuilder::new()
                    .num_threads(self.read_threads)
                    .thread_name(|i| format!("geosample-read-{i}"))
                    .build()
                    .map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| SourceIoError::new(SourceIoKind::Open, "reader pool", e.clone()))
    }

    fn read_physical(
        &self,
        id: SourceId,
        reader: &Arc<dyn SourceReader>,
        window: PixelWindow,
    ) -> Result<Array3<f32>, SourceIoError> {
        let Some(timeout) = self.timeout else {
            self.physical_reads.fetch_add(1, Ordering::Relaxed);
            trace!(source = %id, window = %window, "Physical read");
            return reader.read_window(&window);
        };

        let stalled = self
            .stalled
            .get(id.0)
            .ok_or_else(|| SourceIoError::new(SourceIoKind::Open, id.to_string(), "no reader registered"))?;
        let outstanding = stalled.load(Ordering::Acquire);
        if outstanding >= MAX_STALLED_READS_PER_SOURCE {
            return Err(SourceIoError::new(
                SourceIoKind::Timeout,
                reader.location(),
                format!("source stalled: {outstanding} earlier reads still outstanding"),
            ));
        }

        self.physical_reads.fetch_add(1, Ordering::Relaxed);
        trace!(source = %id, window = %window, "Physical read");

        let ticket = Arc::new(ReadTicket {
            state: AtomicU8::new(QUEUED),
            stalled: Arc::clone(stalled),
        });
        let (tx, rx) = bounded::<PooledResult>(1);
        let job_reader = Arc::clone(reader);
        let job_ticket = Arc::clone(&ticket);
        self.pool()?.spawn(move || {
            if !job_ticket.start() {
                return;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| job_reader.read_window(&window)));
            job_ticket.finish();
            if tx.send(result).is_err() {
                trace!(window = %window, "Read returned after its deadline");
            }
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => unwrap_pooled(result),
            Err(RecvTimeoutError::Timeout) => {
                if !ticket.abandon() {
                    // finished between the deadline and the hand-off
                    return rx.recv().map_or_else(|_| Err(lost(reader)), unwrap_pooled);
                }
                warn!(source = %id, window = %window, timeout_ms = timeout.as_millis(), "Read deadline exceeded");
                Err(SourceIoError::new(
                    SourceIoKind::Timeout,
                    reader.location(),
                    format!("read of {window} exceeded {}ms", timeout.as_millis()),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!(source = %id, window = %window, "Read job dropped without a result");
                Err(lost(reader))
            }
        }
    }

    /// Reads that reached a [`SourceReader`], i.e. cache misses not served by coalescing.
    #[must_use]
    pub fn physical_reads(&self) -> u64 {
        self.physical_reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// A panic inside a pooled read continues on the calling thread.
fn unwrap_pooled(result: PooledResult) -> Result<Array3<f32>, SourceIoError> {
    match result {
        Ok(read) => read,
        Err(payload) => panic::resume_unwind(payload),
    }
}

fn lost(reader: &Arc<dyn SourceReader>) -> SourceIoError {
    SourceIoError::new(SourceIoKind::Decode, reader.location(), "read job exited without a result")
}
