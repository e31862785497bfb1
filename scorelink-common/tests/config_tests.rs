//! Integration tests for configuration loading and atomic config writes
//!
//! Note: uses serial_test for tests that touch HOME / XDG variables so the
//! default config location does not race between tests.

use scorelink_common::config::{
    load_config, write_toml_config, ExecutionMode, StageSettings, TiePolicyKind, TomlConfig,
};
use serial_test::serial;
use std::env;
use tempfile::TempDir;

#[test]
fn test_explicit_missing_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nope.toml");

    let result = load_config(Some(&missing));
    assert!(result.is_err(), "Explicit config path must exist");
}

#[test]
fn test_explicit_file_is_loaded_and_validated() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("scorelink.toml");
    std::fs::write(
        &path,
        r#"
        [logging]
        level = "debug"

        [matching]
        tolerance_ms = 80.0
        tie_policy = "linear"

        [pipeline]
        mode = "bounded_parallel"
        max_workers = 2

        [pipeline.circuit_breaker]
        failure_threshold = 5
        "#,
    )
    .unwrap();

    let (config, source) = load_config(Some(&path)).unwrap();
    assert_eq!(source.as_deref(), Some(path.as_path()));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.matching.tolerance_ms, 80.0);
    assert_eq!(config.matching.tie_policy, TiePolicyKind::Linear);
    assert_eq!(config.pipeline.mode, ExecutionMode::BoundedParallel);
    assert_eq!(config.pipeline.max_workers, 2);
    assert_eq!(config.pipeline.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.pipeline.circuit_breaker.cooldown_ms, 30_000);
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    std::fs::write(&path, "[pipeline]\nmax_workers = 0\n").unwrap();

    assert!(load_config(Some(&path)).is_err());
}

#[test]
fn test_malformed_toml_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "[matching\ntolerance_ms = ").unwrap();

    let err = load_config(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("Configuration error"));
}

#[test]
#[serial]
fn test_missing_default_file_falls_back_to_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let old_home = env::var_os("HOME");
    let old_xdg = env::var_os("XDG_CONFIG_HOME");
    env::set_var("HOME", temp_dir.path());
    env::set_var("XDG_CONFIG_HOME", temp_dir.path().join("config"));

    let result = load_config(None);

    match old_home {
        Some(v) => env::set_var("HOME", v),
        None => env::remove_var("HOME"),
    }
    match old_xdg {
        Some(v) => env::set_var("XDG_CONFIG_HOME", v),
        None => env::remove_var("XDG_CONFIG_HOME"),
    }

    let (config, source) = result.unwrap();
    assert!(source.is_none());
    assert_eq!(config, TomlConfig::default());
}

#[test]
fn test_write_toml_config_roundtrip_and_no_temp_left() {
    let temp_dir = TempDir::new().unwrap();
    let target = temp_dir.path().join("scorelink.toml");

    let mut config = TomlConfig::default();
    config.matching.tolerance_ms = 42.0;
    config.stages.insert(
        "note_images".to_string(),
        StageSettings {
            command: vec!["render".to_string(), "{id}".to_string()],
            outputs: vec!["{stage_dir}/{id}.svg".to_string()],
            enabled: true,
            ..Default::default()
        },
    );

    write_toml_config(&config, &target).unwrap();

    assert!(target.exists());
    assert!(!temp_dir.path().join("scorelink.toml.tmp").exists());

    let (loaded, _) = load_config(Some(&target)).unwrap();
    assert_eq!(loaded, config);
}
