use std::env;
use std::sync::{Mutex, MutexGuard};

use talkgroup_coordinator::app_config::{AppConfig, AppConfigArgs, CONFIG_PATH_ENV, Environment};

use clap::Parser;

// The config path env var is process-wide; tests touching it take this lock.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn build_args(config_path: &str) -> AppConfigArgs {
    AppConfigArgs::parse_from(["test-bin", "--config", config_path])
}

#[test]
fn loads_valid_yaml_config() {
    let _guard = env_lock();
    let mut args = build_args("tests/resources/valid-test-config.yaml");

    let config = AppConfig::from_args(&mut args).unwrap();

    assert_eq!(config.environment, Environment::Development);
    assert_eq!(config.log_level, "info");
    assert_eq!(config.max_simultaneous_speakers, 3);
    assert_eq!(config.default_hold_ms, 3000);
    assert!(config.ducking_enabled);
}

#[test]
fn cli_overrides_yaml_values() {
    let _guard = env_lock();
    unsafe { env::remove_var(CONFIG_PATH_ENV) };

    let mut args = AppConfigArgs::parse_from([
        "test-bin",
        "--config",
        "tests/resources/valid-test-config.yaml",
        "--max-simultaneous-speakers",
        "7",
        "--ducking-enabled",
        "false",
    ]);

    let config = AppConfig::from_args(&mut args).unwrap();

    // CLI should override YAML (priority rule #1)
    assert_eq!(config.max_simultaneous_speakers, 7);
    assert!(!config.ducking_enabled);
}

#[test]
fn env_var_overrides_cli_config_path() {
    let _guard = env_lock();
    // CLI path should be ignored
    unsafe { env::set_var(CONFIG_PATH_ENV, "tests/resources/valid-test-config.yaml") };
    let mut args = build_args("tests/resources/invalid-test-config-missing-field.yaml");

    let config = AppConfig::from_args(&mut args);
    if config.is_err() {
        unsafe { env::remove_var(CONFIG_PATH_ENV) };
        eprintln!("Loaded invalid test file... Check test failed or check valid-test-config.yaml");
        panic!("{:?}", config);
    }
    let config = config.unwrap();
    // It loaded the valid file from ENV instead
    assert_eq!(config.log_level, "info");

    unsafe { env::remove_var(CONFIG_PATH_ENV) };
}

#[test]
fn fails_on_invalid_yaml() {
    let _guard = env_lock();
    unsafe { env::remove_var(CONFIG_PATH_ENV) };

    let mut args = build_args("tests/resources/invalid-test-config-missing-field.yaml");

    let result = AppConfig::from_args(&mut args);

    assert!(result.is_err());
}

#[test]
fn fails_if_file_does_not_exist() {
    let _guard = env_lock();
    unsafe { env::remove_var(CONFIG_PATH_ENV) };

    let mut args = build_args("tests/resources/does-not-exist.yaml");

    let result = AppConfig::from_args(&mut args);
    assert!(result.is_err());
}

#[test]
fn engine_config_carries_response_profile() {
    let _guard = env_lock();
    unsafe { env::remove_var(CONFIG_PATH_ENV) };
    let mut args = build_args("tests/resources/valid-test-config.yaml");
    let config = AppConfig::from_args(&mut args).unwrap();

    let engine = config.engine_config();
    assert_eq!(engine.emergency_response.as_millis(), 50);
    assert_eq!(engine.secondary_response.as_millis(), 100);
    assert_eq!(engine.dynamic_response.as_millis(), 150);
    assert!(engine.enabled);
}
