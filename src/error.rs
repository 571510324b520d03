//! Error taxonomy for the sampling engine.
//!
//! Errors split into two classes:
//!
//! - **Fatal**: [`ConfigError`], [`ShapeError`], run-level escalation
//!   ([`Error::TooManyFailures`]) and worker panics. These stop the pipeline.
//! - **Per-sample**: [`IndexError`], [`ReprojectionError`], [`SourceIoError`].
//!   These are caught at the worker boundary, counted in [`RunStats`](crate::pipeline::RunStats)
//!   and the sample is dropped.

use std::path::PathBuf;

use thiserror::Error;

use crate::geometry::{BoundingBox, Crs};
use crate::source::SourceId;

pub type Result<T> = std::result::Result<T, Error>;

/// Invalid configuration, detected at startup.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A spatial query the index refuses to answer.
#[derive(Debug, Clone, Error)]
pub enum IndexError {
    #[error("query CRS {query} differs from index CRS {index}; reproject the query first")]
    CrsMismatch { index: Crs, query: Crs },
    #[error("invalid bounding box {0}: min exceeds max")]
    InvalidBox(BoundingBox),
    #[error("no {role} source intersects {bbox}")]
    NoSources { bbox: BoundingBox, role: &'static str },
    #[error("spatial index is empty")]
    Empty,
}

/// Coordinates could not be carried between two CRSs.
#[derive(Debug, Clone, Error)]
#[error("cannot reproject {from} -> {to}: {reason}")]
pub struct ReprojectionError {
    pub from: Crs,
    pub to: Crs,
    pub reason: String,
}

impl ReprojectionError {
    pub fn new(from: Crs, to: Crs, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
        }
    }
}

/// Category of a failed source read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceIoKind {
    Open,
    Decode,
    Unsupported,
    Timeout,
    OutOfBounds,
}

impl std::fmt::Display for SourceIoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Decode => "decode",
            Self::Unsupported => "unsupported",
            Self::Timeout => "timeout",
            Self::OutOfBounds => "out of bounds",
        };
        f.write_str(s)
    }
}

/// Unreadable or corrupt source data.
///
/// Cloneable so a single coalesced read can report the same failure to every waiter.
#[derive(Debug, Clone, Error)]
#[error("{kind} error reading {location}: {message}")]
pub struct SourceIoError {
    pub kind: SourceIoKind,
    pub location: String,
    pub message: String,
    pub source_id: Option<SourceId>,
}

impl SourceIoError {
    pub fn new(kind: SourceIoKind, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
            message: message.into(),
            source_id: None,
        }
    }

    pub fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::new(SourceIoKind::Open, path.display().to_string(), err.to_string())
    }

    pub fn tiff(path: &std::path::Path, err: &tiff::TiffError) -> Self {
        Self::new(SourceIoKind::Decode, path.display().to_string(), err.to_string())
    }

    #[must_use]
    pub fn with_source(mut self, id: SourceId) -> Self {
        self.source_id = Some(id);
        self
    }
}

/// Image and label arrays disagree with the configured output shape.
///
/// Always a bug in grid resolution or resampling, never a transient failure.
#[derive(Debug, Clone, Error)]
#[error("{what} shape mismatch at {bbox}: expected {expected:?}, found {found:?}")]
pub struct ShapeError {
    pub what: &'static str,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
    pub bbox: BoundingBox,
}

/// Per-sample failure category.
#[derive(Debug, Clone, Error)]
pub enum SampleError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Reprojection(#[from] ReprojectionError),
    #[error(transparent)]
    SourceIo(#[from] SourceIoError),
}

/// A dropped sample: the query that produced it and why.
#[derive(Debug, Clone, Error)]
#[error("sample at {bbox} dropped: {error}")]
pub struct SampleFailure {
    pub bbox: BoundingBox,
    pub error: SampleError,
}

impl SampleFailure {
    pub fn new(bbox: BoundingBox, error: impl Into<SampleError>) -> Self {
        Self {
            bbox,
            error: error.into(),
        }
    }

    #[must_use]
    pub fn is_source_io(&self) -> bool {
        matches!(self.error, SampleError::SourceIo(_))
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Reprojection(#[from] ReprojectionError),
    #[error(transparent)]
    SourceIo(#[from] SourceIoError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Sample(#[from] SampleFailure),
    #[error("{consecutive} consecutive source read failures; last: {last}")]
    TooManyFailures {
        consecutive: usize,
        last: SourceIoError,
    },
    #[error("sampling worker panicked")]
    WorkerPanicked,
    #[error("failed to read config {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },
}

impl Error {
    /// Whether this error stops the pipeline.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Index(_) | Self::Reprojection(_) | Self::SourceIo(_) | Self::Sample(_)
        )
    }
}

impl From<SampleError> for Error {
    fn from(e: SampleError) -> Self {
        match e {
            SampleError::Index(e) => Self::Index(e),
            SampleError::Reprojection(e) => Self::Reprojection(e),
            SampleError::SourceIo(e) => Self::SourceIo(e),
        }
    }
}
