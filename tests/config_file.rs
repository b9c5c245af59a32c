use anyhow::Result;
use tempfile::tempdir;
use telemat::{BufferConfig, BufferManager, ChannelInfo, MatFileVersion};

#[test]
fn configuration_round_trips_through_json() -> Result<()> {
    let dir = tempdir()?;
    let mut config = BufferConfig::default();
    config.yarp_robot_name = "ergocub".to_string();
    config.description_list = vec!["walking experiment".to_string()];
    config.filename = "walk_log".to_string();
    config.n_samples = 500;
    config.save_period = 2.0;
    config.data_threshold = 50;
    config.auto_save = true;
    config.enable_compression = true;
    config.file_indexing = "%Y_%m_%d_%H_%M_%S".to_string();
    config.mat_file_version = MatFileVersion::V7_3;
    config.channels = vec![
        ChannelInfo::new("joints::position", [6]).with_units_of_measure(["deg"]),
        ChannelInfo::new("joints::velocity", [6]),
    ];
    let path = dir.path().join("buffer_config.json");
    config.to_json_file(&path)?;
    let loaded = BufferConfig::from_json_file(&path)?;

    // Loading normalizes the channels; do the same to the original before
    // comparing.
    let mut expected = config;
    for channel in &mut expected.channels {
        let elements: usize = channel.dimensions.iter().product();
        if channel.elements_names.is_empty() {
            channel.elements_names = (0..elements).map(|i| format!("element_{i}")).collect();
        }
        if channel.units_of_measure.len() == 1 {
            channel.units_of_measure = vec![channel.units_of_measure[0].clone(); elements];
        }
    }
    assert_eq!(loaded, expected);
    Ok(())
}

#[test]
fn a_handwritten_configuration_loads_and_configures() -> Result<()> {
    let dir = tempdir()?;
    let json = r#"{
        "filename": "from_json",
        "n_samples": 8,
        "data_threshold": 2,
        "mat_file_version": "v5",
        "channels": [
            { "name": "one", "dimensions": [2] },
            { "name": "grp::two", "dimensions": [1], "elements_names": ["value"] }
        ]
    }"#;
    let path = dir.path().join("config.json");
    std::fs::write(&path, json)?;

    let mut config = BufferConfig::from_json_file(&path)?;
    assert_eq!(config.filename, "from_json");
    assert_eq!(config.mat_file_version, MatFileVersion::V5);
    assert_eq!(
        config.channels[0].elements_names,
        vec!["element_0", "element_1"]
    );
    assert_eq!(config.channels[1].elements_names, vec!["value"]);

    config.path = dir.path().to_string_lossy().into_owned();
    let manager = BufferManager::with_config(config)?;
    manager.push([1.0f64, 2.0], "one")?;
    manager.push(3.0f64, "grp::two")?;
    manager.save(true)?;
    Ok(())
}

#[test]
fn malformed_json_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json")?;
    assert!(BufferConfig::from_json_file(&path).is_err());
    assert!(BufferConfig::from_json_file(dir.path().join("missing.json")).is_err());
    Ok(())
}
