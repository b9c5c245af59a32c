mod common;

use common::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;
use telemat::{BufferConfig, BufferManager, ChannelInfo, SaveReason};

#[test]
fn periodic_flushes_respect_the_data_threshold() -> Result<()> {
    let dir = tempdir()?;
    let mut config = BufferConfig::default();
    config.filename = "buffer_manager_test_periodic".to_string();
    config.path = dir.path().to_string_lossy().into_owned();
    config.n_samples = 20;
    config.data_threshold = 10;
    config.save_period = 0.05;
    config.save_periodically = true;
    config.channels = vec![
        ChannelInfo::new("one", [1]),
        ChannelInfo::new("two", [1]),
    ];

    let periodic_saves = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&periodic_saves);
    {
        let manager = BufferManager::with_config(config)?;
        manager.set_save_callback(move |_, reason| {
            if reason == SaveReason::Periodic {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            true
        });

        for i in 0..40 {
            manager.push(i, "one")?;
            manager.push(i + 1, "two")?;
            thread::sleep(Duration::from_millis(5));
        }
        // Leave the flusher a couple more periods to drain the tail.
        thread::sleep(Duration::from_millis(150));
    }

    let files = mat_files_in(dir.path())?;
    assert!(
        !files.is_empty(),
        "the flusher should have written at least one file"
    );
    assert!(periodic_saves.load(Ordering::SeqCst) >= files.len());

    // Every recorded channel had reached the threshold at its tick.
    for file in &files {
        let (_, log) = read_only_var(file)?;
        for name in ["one", "two"] {
            if let Some(channel) = log.field(name) {
                let (dims, _) = numeric(field(channel, "data")?)?;
                assert!(
                    *dims.last().unwrap() >= 10,
                    "{name} was flushed with only {} samples",
                    dims.last().unwrap()
                );
            }
        }
    }
    Ok(())
}

#[test]
fn the_flusher_cannot_be_started_twice() -> Result<()> {
    let dir = tempdir()?;
    let mut config = BufferConfig::default();
    config.filename = "twice".to_string();
    config.path = dir.path().to_string_lossy().into_owned();
    config.save_period = 10.0;
    config.save_periodically = true;

    let mut manager = BufferManager::with_config(config)?;
    assert!(manager.enable_periodic_save(10.0).is_err());
    Ok(())
}

#[test]
fn shutdown_interrupts_a_long_save_period() -> Result<()> {
    let dir = tempdir()?;
    let mut config = BufferConfig::default();
    config.filename = "sleepy".to_string();
    config.path = dir.path().to_string_lossy().into_owned();
    config.save_period = 3600.0;
    config.save_periodically = true;

    let manager = BufferManager::with_config(config)?;
    let started = std::time::Instant::now();
    drop(manager);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "teardown must not wait out the save period"
    );
    Ok(())
}
