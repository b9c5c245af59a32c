//! The buffer manager: channel registry, producer API, flushing.

use std::fmt::Write as _;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Local;
use log::{debug, error, trace, warn};

use crate::channel::{make_encoder, ChannelBuffer, ChannelInfo};
use crate::config::BufferConfig;
use crate::mat::{self, MatVar};
use crate::tree::TreeNode;
use crate::value::Value;
use crate::{MatFileVersion, TelematError, TelematResult};

/// Whether a save callback fires for a periodic flush or for the final one
/// on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    Periodic,
    LastCall,
}

/// The injectable time source: seconds since the epoch as a double.
pub type ClockFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Invoked after every successful flush with the written path and the
/// reason. The return value is logged and otherwise ignored.
pub type SaveCallback = Box<dyn Fn(&Path, SaveReason) -> bool + Send + Sync>;

fn default_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct FlushState {
    should_stop: bool,
}

/// State shared with the periodic flusher thread.
struct Shared {
    tree: RwLock<TreeNode<Arc<ChannelBuffer>>>,
    config: Mutex<BufferConfig>,
    /// The flush lock: serializes flushes with each other and with
    /// structural changes (configure, channel registration, resizes). The
    /// paired condvar wakes the flusher for shutdown.
    flush: Mutex<FlushState>,
    flush_cv: Condvar,
    clock: RwLock<ClockFn>,
    save_callback: RwLock<Option<SaveCallback>>,
}

/// Manages the buffers associated to the channels of the telemetry.
///
/// One manager holds any number of channels; `n_samples` is shared by all of
/// them while each channel carries its own shape and element type. Producers
/// [`push`](Self::push) concurrently; a flush (manual, periodic, or the
/// `auto_save` one at drop) drains every channel with enough data into a
/// single MAT file. See the crate docs for an overview.
pub struct BufferManager {
    shared: Arc<Shared>,
    save_thread: Option<JoinHandle<()>>,
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager {
    /// An empty manager: no channels, no flusher thread, zero capacity.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: RwLock::new(TreeNode::new()),
                config: Mutex::new(BufferConfig::default()),
                flush: Mutex::new(FlushState { should_stop: false }),
                flush_cv: Condvar::new(),
                clock: RwLock::new(Arc::new(default_clock)),
                save_callback: RwLock::new(None),
            }),
            save_thread: None,
        }
    }

    /// Constructs and configures in one step.
    pub fn with_config(config: BufferConfig) -> TelematResult<Self> {
        let mut manager = Self::new();
        manager.configure(config)?;
        Ok(manager)
    }

    /// Applies a configuration: resizes existing channels to the new
    /// `n_samples`, registers the configured channels, starts the periodic
    /// flusher when asked, and creates the output directory when missing.
    ///
    /// On a failed channel registration the manager keeps the channels
    /// registered so far and returns the error (no rollback).
    pub fn configure(&mut self, config: BufferConfig) -> TelematResult<()> {
        if config.filename.is_empty() {
            return Err(TelematError::EmptyFileName);
        }

        {
            let _flush = self.shared.flush.lock().unwrap();

            self.shared.set_capacity_locked(config.n_samples);

            let mut stored = self.shared.config.lock().unwrap();
            let registered = std::mem::take(&mut stored.channels);
            *stored = config.clone();
            stored.channels = registered;
            drop(stored);

            for channel in config.channels {
                self.shared.add_channel_locked(channel)?;
            }
        }

        if config.save_periodically && self.save_thread.is_none() {
            self.enable_periodic_save(config.save_period)?;
        }

        if !config.path.is_empty() {
            let path = Path::new(&config.path);
            if !path.exists() {
                fs::create_dir_all(path).map_err(|source| TelematError::CreateDirectory {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Starts the periodic flusher with the given period in seconds.
    /// Fails if it is already running.
    pub fn enable_periodic_save(&mut self, save_period: f64) -> TelematResult<()> {
        if self.save_thread.is_some() {
            return Err(TelematError::FlusherAlreadyRunning);
        }
        {
            let mut config = self.shared.config.lock().unwrap();
            config.save_periodically = true;
            config.save_period = save_period;
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("telemat-flusher".to_string())
            .spawn(move || shared.periodic_save())?;
        self.save_thread = Some(handle);
        Ok(())
    }

    /// A copy of the current configuration, channels included.
    pub fn get_config(&self) -> BufferConfig {
        self.shared.config.lock().unwrap().clone()
    }

    /// Registers a channel with an empty ring buffer of the current
    /// capacity. The channel also joins the configuration, so a later
    /// [`get_config`](Self::get_config) reproduces the full set.
    pub fn add_channel(&self, channel: ChannelInfo) -> TelematResult<()> {
        let _flush = self.shared.flush.lock().unwrap();
        self.shared.add_channel_locked(channel)
    }

    /// Registers several channels, stopping at the first failure.
    pub fn add_channels(
        &self,
        channels: impl IntoIterator<Item = ChannelInfo>,
    ) -> TelematResult<()> {
        let _flush = self.shared.flush.lock().unwrap();
        for channel in channels {
            self.shared.add_channel_locked(channel)?;
        }
        Ok(())
    }

    /// Pushes a sample stamped with the configured clock.
    pub fn push(&self, value: impl Into<Value>, channel: &str) -> TelematResult<()> {
        let now = Arc::clone(&*self.shared.clock.read().unwrap());
        self.push_with_ts(value, now(), channel)
    }

    /// Pushes a sample with an explicit timestamp.
    ///
    /// The channel must exist. The value must match the element type bound
    /// by the channel's first push, and numeric values must carry exactly
    /// the declared number of elements; offending records are dropped with a
    /// warning and the error is returned.
    pub fn push_with_ts(
        &self,
        value: impl Into<Value>,
        ts: f64,
        channel: &str,
    ) -> TelematResult<()> {
        let value = value.into();
        let leaf = self
            .shared
            .tree
            .read()
            .unwrap()
            .get_leaf(channel)
            .map(Arc::clone);
        let Some(leaf) = leaf else {
            error!("push to unknown channel `{channel}`");
            return Err(TelematError::UnknownChannel(channel.to_string()));
        };

        if let Some(count) = value.element_count() {
            if count != leaf.elements {
                let err = TelematError::ShapeMismatch {
                    channel: channel.to_string(),
                    expected: leaf.elements,
                    actual: count,
                };
                warn!("{err}, dropping the sample");
                return Err(err);
            }
        }

        let mut state = leaf.state.lock().unwrap();
        match state.type_tag {
            Some(expected) if expected != value.type_name() => {
                let err = TelematError::TypeMismatch {
                    channel: channel.to_string(),
                    expected,
                    actual: value.type_name(),
                };
                warn!("{err}, dropping the sample");
                return Err(err);
            }
            Some(_) => {}
            None => {
                state.type_tag = Some(value.type_name());
                state.encode = Some(make_encoder(&value, leaf.info.dimensions.clone()));
            }
        }
        state.buffer.push_back(crate::Record {
            timestamp: ts,
            value,
        });
        Ok(())
    }

    /// Drains every eligible channel into one MAT file and returns its path.
    ///
    /// With `force_all` (or whenever `data_threshold > n_samples`) every
    /// non-empty channel is eligible; otherwise only channels holding at
    /// least `data_threshold` samples. Empty channels never participate.
    /// When no channel is eligible, returns
    /// [`NothingToWrite`](TelematError::NothingToWrite) and leaves the
    /// filesystem untouched.
    pub fn save(&self, force_all: bool) -> TelematResult<PathBuf> {
        let _flush = self.shared.flush.lock().unwrap();
        self.shared.save_with_flush_held(force_all)
    }

    /// Sets the base name of the output files.
    pub fn set_file_name(&self, filename: impl Into<String>) {
        self.shared.config.lock().unwrap().filename = filename.into();
    }

    /// Sets the directory the output files are written into.
    pub fn set_default_path(&self, path: impl Into<String>) {
        self.shared.config.lock().unwrap().path = path.into();
    }

    /// Enables or disables zlib compression of the output variables.
    pub fn enable_compression(&self, enable: bool) {
        self.shared.config.lock().unwrap().enable_compression = enable;
    }

    /// Sets the descriptions stamped into every output file.
    pub fn set_description_list(&self, description_list: Vec<String>) {
        self.shared.config.lock().unwrap().description_list = description_list;
    }

    /// Changes every channel's buffer capacity, keeping the newest samples.
    pub fn resize(&self, n_samples: usize) {
        let _flush = self.shared.flush.lock().unwrap();
        self.shared.set_capacity_locked(n_samples);
    }

    /// Alias of [`resize`](Self::resize).
    pub fn set_capacity(&self, n_samples: usize) {
        self.resize(n_samples);
    }

    /// Replaces the time source used to stamp pushes and to index files.
    pub fn set_clock(&self, clock: impl Fn() -> f64 + Send + Sync + 'static) {
        *self.shared.clock.write().unwrap() = Arc::new(clock);
    }

    /// Registers a callback invoked after every successful flush.
    pub fn set_save_callback(
        &self,
        callback: impl Fn(&Path, SaveReason) -> bool + Send + Sync + 'static,
    ) {
        *self.shared.save_callback.write().unwrap() = Some(Box::new(callback));
    }

    /// An indented rendering of the channel tree, for debugging.
    pub fn tree_view(&self) -> String {
        self.shared.tree.read().unwrap().to_string()
    }
}

impl Drop for BufferManager {
    /// Stops the flusher and, when `auto_save` is set, performs one final
    /// forced flush, invoking the save callback with
    /// [`SaveReason::LastCall`].
    fn drop(&mut self) {
        if let Some(handle) = self.save_thread.take() {
            {
                let mut flush = self.shared.flush.lock().unwrap();
                flush.should_stop = true;
                self.shared.flush_cv.notify_one();
            }
            if handle.join().is_err() {
                warn!("the periodic save thread panicked");
            }
        }
        if self.shared.config.lock().unwrap().auto_save {
            match self.save(true) {
                Ok(path) => self.shared.run_save_callback(&path, SaveReason::LastCall),
                Err(TelematError::NothingToWrite) => {
                    debug!("nothing left to save at teardown")
                }
                Err(e) => warn!("the final save failed: {e}"),
            }
        }
    }
}

impl Shared {
    /// Registers a channel. Caller holds the flush lock.
    fn add_channel_locked(&self, mut channel: ChannelInfo) -> TelematResult<()> {
        let elements = channel.normalize()?;
        let capacity = self.config.lock().unwrap().n_samples;
        let buffer = Arc::new(ChannelBuffer::new(channel.clone(), elements, capacity));
        self.tree.write().unwrap().add_leaf(&channel.name, buffer)?;
        self.config.lock().unwrap().channels.push(channel);
        Ok(())
    }

    /// Applies a new capacity to every channel. Caller holds the flush lock.
    fn set_capacity_locked(&self, n_samples: usize) {
        self.tree.read().unwrap().visit_leaves(&mut |leaf| {
            leaf.state.lock().unwrap().buffer.set_capacity(n_samples);
        });
        self.config.lock().unwrap().n_samples = n_samples;
    }

    /// The flusher thread: a predicate-guarded timed wait on the flush
    /// condvar, so it both survives spurious wakeups and exits promptly on
    /// shutdown.
    fn periodic_save(self: Arc<Self>) {
        let mut flush = self.flush.lock().unwrap();
        loop {
            let period = Duration::from_secs_f64(
                self.config.lock().unwrap().save_period.max(f64::EPSILON),
            );
            let (guard, timeout) = self
                .flush_cv
                .wait_timeout_while(flush, period, |state| !state.should_stop)
                .unwrap();
            flush = guard;
            if flush.should_stop {
                return;
            }
            if !timeout.timed_out() {
                continue;
            }
            if self.tree.read().unwrap().is_empty() {
                continue;
            }
            match self.save_with_flush_held(false) {
                Ok(path) => self.run_save_callback(&path, SaveReason::Periodic),
                Err(TelematError::NothingToWrite) => {
                    trace!("periodic save skipped, no channel above the threshold")
                }
                Err(e) => warn!("periodic save failed: {e}"),
            }
        }
    }

    fn run_save_callback(&self, path: &Path, reason: SaveReason) {
        if let Some(callback) = self.save_callback.read().unwrap().as_ref() {
            let ok = callback(path, reason);
            trace!("save callback for {} returned {ok}", path.display());
        }
    }

    /// The flush proper. Caller holds the flush lock.
    fn save_with_flush_held(&self, force_all: bool) -> TelematResult<PathBuf> {
        let config = self.config.lock().unwrap().clone();
        if config.filename.is_empty() {
            return Err(TelematError::EmptyFileName);
        }
        // Refuse unwritable versions before draining any channel or
        // touching the filesystem.
        if config.mat_file_version == MatFileVersion::V4 {
            return Err(TelematError::UnsupportedMatVersion(config.mat_file_version));
        }
        let force_all = force_all || config.data_threshold > config.n_samples;

        let mut fields: Vec<(String, MatVar)> = Vec::new();
        if !config.description_list.is_empty() {
            let descriptions = config
                .description_list
                .iter()
                .map(|s| MatVar::string(s.as_str()))
                .collect();
            fields.push((
                "description_list".to_string(),
                MatVar::cell_column(descriptions),
            ));
        }
        fields.push((
            "yarp_robot_name".to_string(),
            MatVar::string(&config.yarp_robot_name),
        ));
        let fixed_fields = fields.len();

        {
            let tree = self.tree.read().unwrap();
            for (name, node) in tree.children() {
                if let Some(var) = collect_node(name, node, force_all, config.data_threshold) {
                    fields.push((name.to_string(), var));
                }
            }
        }
        if fields.len() == fixed_fields {
            return Err(TelematError::NothingToWrite);
        }

        let index = self.file_index(&config);
        let file_path = Path::new(&config.path).join(format!("{}_{index}.mat", config.filename));
        if file_path.exists() {
            return Err(TelematError::FileAlreadyExists(file_path));
        }

        let file = fs::File::create(&file_path)?;
        let mut writer = mat::WriteOptions::new()
            .compression(config.enable_compression)
            .version(config.mat_file_version)
            .create(BufWriter::new(file))?;
        let log = MatVar::scalar_struct(fields);
        writer.write_var(&config.filename, &log)?;
        writer.finish()?;
        Ok(file_path)
    }

    /// Renders the file index: the raw clock value for `time_since_epoch`,
    /// otherwise the configured strftime pattern against local time.
    fn file_index(&self, config: &BufferConfig) -> String {
        let now = Arc::clone(&*self.clock.read().unwrap());
        if config.file_indexing == "time_since_epoch" {
            return format!("{:.6}", now());
        }
        let mut rendered = String::new();
        match write!(rendered, "{}", Local::now().format(&config.file_indexing)) {
            Ok(()) => rendered,
            Err(_) => {
                warn!(
                    "invalid file_indexing pattern `{}`, falling back to the clock",
                    config.file_indexing
                );
                format!("{:.6}", now())
            }
        }
    }
}

/// Builds the output variable for one tree node: the per-channel struct on
/// leaves, a nested struct of eligible children on interior nodes. `None`
/// when the whole subtree has nothing to contribute.
fn collect_node(
    name: &str,
    node: &TreeNode<Arc<ChannelBuffer>>,
    force_all: bool,
    data_threshold: usize,
) -> Option<MatVar> {
    if let Some(leaf) = node.value() {
        return collect_channel(name, leaf, force_all, data_threshold);
    }
    let mut fields = Vec::new();
    for (child_name, child) in node.children() {
        if let Some(var) = collect_node(child_name, child, force_all, data_threshold) {
            fields.push((child_name.to_string(), var));
        }
    }
    if fields.is_empty() {
        None
    } else {
        Some(MatVar::scalar_struct(fields))
    }
}

/// Drains one channel into its output struct, clearing the ring buffer.
/// Skips (and leaves untouched) empty and under-threshold channels.
fn collect_channel(
    name: &str,
    channel: &ChannelBuffer,
    force_all: bool,
    data_threshold: usize,
) -> Option<MatVar> {
    let mut state = channel.state.lock().unwrap();
    if state.buffer.is_empty() {
        debug!("channel `{}` holds no data, skipping", channel.info.name);
        return None;
    }
    if !force_all && state.buffer.len() < data_threshold {
        debug!(
            "channel `{}` holds {} of {} samples, skipping",
            channel.info.name,
            state.buffer.len(),
            data_threshold
        );
        return None;
    }

    let num_instants = state.buffer.len();
    let encode = state.encode.as_ref()?;
    let data = encode(&state.buffer);
    let timestamps: Vec<f64> = state.buffer.iter().map(|r| r.timestamp).collect();
    state.buffer.clear();
    drop(state);

    let mut dimensions: Vec<u64> = channel.info.dimensions.iter().map(|&d| d as u64).collect();
    dimensions.push(num_instants as u64);
    let elements_names = channel
        .info
        .elements_names
        .iter()
        .map(|s| MatVar::string(s.as_str()))
        .collect();

    Some(MatVar::scalar_struct(vec![
        ("data".to_string(), data),
        ("dimensions".to_string(), MatVar::row(dimensions)),
        (
            "elements_names".to_string(),
            MatVar::cell_row(elements_names),
        ),
        ("name".to_string(), MatVar::string(name)),
        ("timestamps".to_string(), MatVar::row(timestamps)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_index_uses_the_injected_clock() {
        let manager = BufferManager::new();
        manager.set_clock(|| 1234.5);
        let config = BufferConfig::default();
        assert_eq!(manager.shared.file_index(&config), "1234.500000");
    }

    #[test]
    fn file_index_renders_strftime_patterns() {
        let manager = BufferManager::new();
        let config = BufferConfig {
            file_indexing: "%Y".to_string(),
            ..BufferConfig::default()
        };
        let index = manager.shared.file_index(&config);
        assert_eq!(index.len(), 4);
        assert!(index.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let manager = BufferManager::new();
        assert!(matches!(
            manager.push(1.0f64, "nope"),
            Err(TelematError::UnknownChannel(_))
        ));
    }

    #[test]
    fn type_is_fixed_by_the_first_push() {
        let mut manager = BufferManager::new();
        let mut config = BufferConfig::default();
        config.n_samples = 4;
        config.channels = vec![ChannelInfo::new("one", [1])];
        manager.configure(config).unwrap();

        manager.push_with_ts(1.0f64, 0.0, "one").unwrap();
        assert!(matches!(
            manager.push_with_ts(2i32, 1.0, "one"),
            Err(TelematError::TypeMismatch { .. })
        ));
        manager.push_with_ts(3.0f64, 2.0, "one").unwrap();
    }

    #[test]
    fn numeric_shape_is_checked() {
        let manager = BufferManager::new();
        manager.resize(4);
        manager.add_channel(ChannelInfo::new("pair", [2])).unwrap();
        assert!(matches!(
            manager.push_with_ts([1.0f64; 3], 0.0, "pair"),
            Err(TelematError::ShapeMismatch { .. })
        ));
        manager.push_with_ts([1.0f64, 2.0], 0.0, "pair").unwrap();
    }

    #[test]
    fn configure_rejects_an_empty_filename() {
        let mut manager = BufferManager::new();
        let config = BufferConfig {
            filename: String::new(),
            ..BufferConfig::default()
        };
        assert!(matches!(
            manager.configure(config),
            Err(TelematError::EmptyFileName)
        ));
    }

    #[test]
    fn add_channel_extends_the_config() {
        let manager = BufferManager::new();
        manager.add_channel(ChannelInfo::new("a::b", [1])).unwrap();
        manager.add_channel(ChannelInfo::new("c", [2])).unwrap();
        let config = manager.get_config();
        let names: Vec<&str> = config.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a::b", "c"]);
        assert!(matches!(
            manager.add_channel(ChannelInfo::new("a::b", [1])),
            Err(TelematError::DuplicateChannel(_))
        ));
    }

    #[test]
    fn reconfigure_keeps_previously_registered_channels() {
        let mut manager = BufferManager::new();
        manager.add_channel(ChannelInfo::new("old", [1])).unwrap();
        let mut config = BufferConfig::default();
        config.n_samples = 8;
        config.channels = vec![ChannelInfo::new("new", [1])];
        manager.configure(config).unwrap();

        let names: Vec<String> = manager
            .get_config()
            .channels
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(names, vec!["old", "new"]);
        manager.push_with_ts(1.0f64, 0.0, "old").unwrap();
        manager.push_with_ts(1.0f64, 0.0, "new").unwrap();
    }

    #[test]
    fn mat4_save_is_refused_before_draining() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = BufferManager::new();
        let mut config = BufferConfig::default();
        config.path = dir.path().to_string_lossy().into_owned();
        config.n_samples = 4;
        config.mat_file_version = MatFileVersion::V4;
        config.channels = vec![ChannelInfo::new("one", [1])];
        manager.configure(config).unwrap();

        manager.push_with_ts(1.0f64, 0.0, "one").unwrap();
        assert!(matches!(
            manager.save(true),
            Err(TelematError::UnsupportedMatVersion(MatFileVersion::V4))
        ));

        // The refused save drained nothing: switching to MAT-5 still finds
        // the buffered sample.
        let mut v5 = manager.get_config();
        v5.mat_file_version = MatFileVersion::V5;
        v5.channels.clear();
        manager.configure(v5).unwrap();
        assert!(manager.save(true).is_ok());
    }

    #[test]
    fn resize_applies_to_existing_buffers() {
        let manager = BufferManager::new();
        manager.resize(5);
        manager.add_channel(ChannelInfo::new("one", [1])).unwrap();
        for i in 0..5 {
            manager.push_with_ts(i as f64, i as f64, "one").unwrap();
        }
        manager.resize(2);
        let leaf = manager
            .shared
            .tree
            .read()
            .unwrap()
            .get_leaf("one")
            .map(Arc::clone)
            .unwrap();
        let state = leaf.state.lock().unwrap();
        assert_eq!(state.buffer.len(), 2);
        let kept: Vec<f64> = state.buffer.iter().map(|r| r.timestamp).collect();
        assert_eq!(kept, vec![3.0, 4.0]);
    }
}
