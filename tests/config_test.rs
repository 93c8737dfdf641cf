//! Configuration layering: defaults, TOML file, LEAKHUNT_* environment, -R token

use leakhunt_core::config::{DEFAULT_RUN, DEFAULT_STAB};
use leakhunt_core::{ClassifierPolicy, ConfigError, LeakConfig};
use serial_test::serial;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const ENV_KEYS: [&str; 4] = [
    "LEAKHUNT_STAB",
    "LEAKHUNT_RUN",
    "LEAKHUNT_REFLOG",
    "LEAKHUNT_POLICY__JITTER",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("leakhunt.toml");
    fs::write(&path, contents).unwrap();
    path
}

#[test]
#[serial]
fn test_load_file_values() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
stab = 2
run = 6
reflog = "leaks.log"

[policy]
zero_numerator = 1
zero_denominator = 2
jitter = 3
"#,
    );

    let config = LeakConfig::load(Some(&path)).unwrap();
    assert_eq!(config.stab, 2);
    assert_eq!(config.run, 6);
    assert_eq!(config.reflog, Some(PathBuf::from("leaks.log")));
    assert_eq!(config.policy.zero_denominator, 2);
    assert_eq!(config.policy.jitter, 3);
}

#[test]
#[serial]
fn test_partial_file_keeps_defaults() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "run = 9\n");

    let config = LeakConfig::load(Some(&path)).unwrap();
    assert_eq!(config.stab, DEFAULT_STAB);
    assert_eq!(config.run, 9);
    assert_eq!(config.reflog, None);
    assert_eq!(config.policy, ClassifierPolicy::default());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "stab = 1\nrun = 3\n");
    std::env::set_var("LEAKHUNT_RUN", "7");
    std::env::set_var("LEAKHUNT_POLICY__JITTER", "2");

    let loaded = LeakConfig::load(Some(&path));
    clear_env();

    let config = loaded.unwrap();
    assert_eq!(config.stab, 1);
    assert_eq!(config.run, 7);
    assert_eq!(config.policy.jitter, 2);
}

#[test]
#[serial]
fn test_explicit_missing_file_is_an_error() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        LeakConfig::load(Some(&missing)),
        Err(ConfigError::LayerError(_))
    ));
}

#[test]
#[serial]
fn test_zero_run_in_file_is_rejected() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "run = 0\n");
    assert!(matches!(
        LeakConfig::load(Some(&path)),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
#[serial]
fn test_token_applies_over_layers() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "stab = 1\nrun = 3\n");
    let mut config = LeakConfig::load(Some(&path)).unwrap();

    config.apply_token(":8").unwrap();
    assert_eq!((config.stab, config.run), (1, 8));

    config.apply_token(":").unwrap();
    assert_eq!((config.stab, config.run), (1, 8));

    assert!(config.apply_token("two:3").is_err());
    assert_eq!(config.repetitions(), 9);
}

#[test]
#[serial]
fn test_saved_config_loads_back() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("saved.toml");
    let config = LeakConfig {
        stab: 0,
        run: DEFAULT_RUN + 1,
        ..LeakConfig::default()
    };

    config.to_file(&path).unwrap();
    let loaded = LeakConfig::load(Some(&path)).unwrap();
    assert_eq!(loaded.stab, 0);
    assert_eq!(loaded.run, DEFAULT_RUN + 1);
    assert_eq!(LeakConfig::from_file(&path).unwrap(), config);
}

#[test]
fn test_from_file_reads_without_layering() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("leakhunt.toml");
    fs::write(&path, "run = 0\n").unwrap();
    assert!(matches!(
        LeakConfig::from_file(&path),
        Err(ConfigError::ValidationError(_))
    ));

    let missing = dir.path().join("absent.toml");
    assert!(matches!(
        LeakConfig::from_file(&missing),
        Err(ConfigError::IoError(_))
    ));
}
