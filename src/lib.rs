//! Buffer robot telemetry in memory, record it to MATLAB (`.mat`) files.
//!
//! The entry point is the [`BufferManager`]: a registry of named channels,
//! each backed by a bounded ring buffer of time-stamped samples. Producers
//! call [`push`](BufferManager::push) at control-loop rates; a background
//! thread (or a manual [`save`](BufferManager::save)) drains every channel
//! with enough data and writes a single MAT-5 file per flush. Ring buffers
//! overwrite their oldest samples when full, so a push never waits on disk.
//!
//! Channel paths use `::` as a separator and become nested structs in the
//! output file: pushing to `motors::left::encoder` produces
//! `log.motors.left.encoder` in MATLAB.
//!
//! ```no_run
//! use telemat::{BufferConfig, BufferManager, ChannelInfo};
//!
//! fn main() -> telemat::TelematResult<()> {
//!     let mut config = BufferConfig::default();
//!     config.filename = "telemetry_log".to_string();
//!     config.n_samples = 1000;
//!     config.channels = vec![ChannelInfo::new("encoders", [6])];
//!
//!     let manager = BufferManager::with_config(config)?;
//!     manager.push([0.0, 0.1, 0.2, 0.3, 0.4, 0.5], "encoders")?;
//!     let written = manager.save(true)?;
//!     println!("wrote {}", written.display());
//!     Ok(())
//! }
//! ```
//!
//! The [`mat`] module stands on its own for writing (and reading back) the
//! subset of the MAT-5 container format used by the recorder.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod manager;
pub mod mat;
pub mod tree;
pub mod value;

pub use buffer::{Record, RingBuffer};
pub use channel::ChannelInfo;
pub use config::{BufferConfig, MatFileVersion};
pub use manager::{BufferManager, SaveReason};
pub use tree::TreeNode;
pub use value::Value;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while buffering or recording telemetry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TelematError {
    /// The configured file name is empty; there is nowhere to flush to.
    #[error("the configured filename is empty")]
    EmptyFileName,

    /// The configured output directory did not exist and could not be created.
    #[error("could not create the output directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: io::Error,
    },

    /// A channel path was empty, or one of its `::`-separated segments was.
    #[error("channel path `{0}` is empty or contains an empty segment")]
    EmptyChannelPath(String),

    /// A channel with the same path (or a leaf on its prefix) already exists.
    #[error("channel `{0}` already exists")]
    DuplicateChannel(String),

    /// A channel was declared with no dimensions, or with a zero dimension.
    #[error("channel `{channel}` has invalid dimensions {dimensions:?}")]
    InvalidDimensions {
        channel: String,
        dimensions: Vec<usize>,
    },

    /// A push addressed a channel that was never registered.
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    /// A push presented a different element type than the channel's first
    /// push did. The record is dropped; the channel keeps its type.
    #[error("type mismatch on channel `{channel}`: expected {expected}, got {actual}")]
    TypeMismatch {
        channel: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A numeric push had a different element count than the channel's
    /// declared shape. The record is dropped.
    #[error("shape mismatch on channel `{channel}`: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        channel: String,
        expected: usize,
        actual: usize,
    },

    /// The periodic flusher thread has already been started.
    #[error("the periodic save thread is already running")]
    FlusherAlreadyRunning,

    /// No channel was eligible for the flush; nothing was written.
    #[error("no channel has enough data to write")]
    NothingToWrite,

    /// The computed output file name collides with an existing file.
    /// This can happen when the file index resolution is coarser than the
    /// flush cadence; the next flush picks a fresh index.
    #[error("output file {0} already exists")]
    FileAlreadyExists(PathBuf),

    /// The configured MAT file version cannot be written.
    #[error("MAT file version {0:?} is not supported for writing")]
    UnsupportedMatVersion(MatFileVersion),

    /// The input is not a little-endian MAT-5 file.
    #[error("not a MAT-5 file")]
    BadMatHeader,

    /// The MAT file uses a construct outside the subset this library emits.
    #[error("unsupported MAT construct: {0}")]
    UnsupportedMatFile(&'static str),

    /// A [`mat::MatVar`] violates its own shape invariants.
    #[error("malformed MAT variable: {0}")]
    MalformedVariable(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary (de)serialization error: {0}")]
    Binrw(#[from] binrw::Error),
}

pub type TelematResult<T> = Result<T, TelematError>;
