//! Manager configuration and its JSON codec.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelInfo;
use crate::TelematResult;

/// The on-disk MAT container version to request.
///
/// `V5`, `Default`, and `Undefined` all select MAT-5. `V7_3` falls back to
/// MAT-5 with a warning; `V4` is refused at write time (see
/// [`mat::WriteOptions::version`](crate::mat::WriteOptions::version)).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatFileVersion {
    #[serde(rename = "undefined")]
    Undefined,
    #[serde(rename = "v4")]
    V4,
    #[serde(rename = "v5")]
    V5,
    #[serde(rename = "v7_3")]
    V7_3,
    #[default]
    #[serde(rename = "default")]
    Default,
}

/// Everything a [`BufferManager`](crate::BufferManager) can be configured
/// with. Serializes to JSON with these exact field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Robot name stamped into every output file.
    pub yarp_robot_name: String,
    /// Free-form descriptions stamped into every output file as a cell
    /// array, when non-empty.
    pub description_list: Vec<String>,
    /// Directory the files are written into; created at configure time when
    /// missing. Empty means the current directory.
    pub path: String,
    /// Base name of the output files; also the name of the top-level MAT
    /// variable. Must be non-empty to configure or flush.
    pub filename: String,
    /// Ring-buffer capacity of every channel.
    pub n_samples: usize,
    /// Seconds between periodic flushes.
    pub save_period: f64,
    /// Minimum buffered sample count for a channel to join a non-forced
    /// flush. A threshold above `n_samples` forces every flush.
    pub data_threshold: usize,
    /// Perform one final forced flush when the manager is dropped.
    pub auto_save: bool,
    /// Start the periodic flusher at configure time.
    pub save_periodically: bool,
    /// Channels registered at configure time.
    pub channels: Vec<ChannelInfo>,
    /// Compress output variables with zlib.
    pub enable_compression: bool,
    /// `"time_since_epoch"` to index files by the clock value, or a
    /// strftime-style pattern evaluated against local time.
    pub file_indexing: String,
    pub mat_file_version: MatFileVersion,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            yarp_robot_name: String::new(),
            description_list: Vec::new(),
            path: String::new(),
            filename: "telemetry_log".to_string(),
            n_samples: 0,
            save_period: 0.010,
            data_threshold: 0,
            auto_save: false,
            save_periodically: false,
            channels: Vec::new(),
            enable_compression: false,
            file_indexing: "time_since_epoch".to_string(),
            mat_file_version: MatFileVersion::Default,
        }
    }
}

impl BufferConfig {
    /// Reads a configuration from a JSON file. Channels get their derived
    /// fields normalized, so a configuration with omitted `elements_names`
    /// loads with synthesized ones.
    pub fn from_json_file(path: impl AsRef<Path>) -> TelematResult<Self> {
        let file = File::open(path)?;
        let mut config: BufferConfig = serde_json::from_reader(BufReader::new(file))?;
        for channel in &mut config.channels {
            channel.normalize()?;
        }
        Ok(config)
    }

    /// Writes the configuration to a JSON file.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> TelematResult<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}
