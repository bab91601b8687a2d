use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;
use std::fs::File;

use clap_serde_derive::{
    ClapSerde,
    clap::{self, Parser},
};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::ducking::EngineConfig;

#[cfg(test)]
const CONFIG_PATH_ENV: &'static str = "TEST_CONFIG_PATH";

#[cfg(not(test))]
pub const CONFIG_PATH_ENV: &'static str = "DMR_CONFIG_PATH";

/// Configuration for the app.
#[derive(Parser, Deserialize, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct AppConfigArgs {
    /// Path pointing to config.yaml
    #[clap(long = "config", default_value = "config.yaml")]
    pub config_path: std::path::PathBuf,

    #[command(flatten)]
    pub config: <AppConfig as ClapSerde>::Opt,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, derive_more::FromStr, PartialEq)]
#[from_str(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
}

#[derive(ClapSerde, Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[clap(short = 'e', long = "environment")]
    pub environment: Environment,

    /// Connection details JSON issued by the provisioning side
    #[clap(long = "connection")]
    #[default(PathBuf::from("connection.json"))]
    pub connection_path: PathBuf,

    /// User preference store, survives restarts
    #[clap(long = "prefs")]
    #[default(PathBuf::from("prefs.json"))]
    pub prefs_path: PathBuf,

    /// Optional log file, appended
    #[clap(long = "log-file")]
    pub log_file: Option<PathBuf>,

    #[clap(short, long)]
    pub log_level: String,

    /// Master switch for priority ducking
    #[clap(long = "ducking-enabled", action = clap::ArgAction::Set)]
    #[default(true)]
    pub ducking_enabled: bool,

    /// How fast victims drop when an emergency channel keys up
    #[clap(long = "emergency-response-ms")]
    #[default(50u64)]
    pub emergency_response_ms: u64,

    #[clap(long = "secondary-response-ms")]
    #[default(100u64)]
    pub secondary_response_ms: u64,

    #[clap(long = "dynamic-response-ms")]
    #[default(150u64)]
    pub dynamic_response_ms: u64,

    /// Fallback hold for rooms that don't carry their own
    #[clap(long = "default-hold-ms")]
    #[default(3000u64)]
    pub default_hold_ms: u64,

    #[clap(long = "max-simultaneous-speakers")]
    #[default(3usize)]
    pub max_simultaneous_speakers: usize,
}

impl std::fmt::Debug for ClapSerdeOptionalAppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClapSerdeOptionalConfig")
            .field("environment", &self.environment)
            .field("connection_path", &self.connection_path)
            .field("prefs_path", &self.prefs_path)
            .field("log_file", &self.log_file)
            .field("log_level", &self.log_level)
            .field("ducking_enabled", &self.ducking_enabled)
            .finish()
    }
}
/// Greeaaaaat...derive doesn't work due to macro shenanigans
impl Clone for ClapSerdeOptionalAppConfig {
    fn clone(&self) -> Self {
        Self {
            environment: self.environment.clone(),
            connection_path: self.connection_path.clone(),
            prefs_path: self.prefs_path.clone(),
            log_file: self.log_file.clone(),
            log_level: self.log_level.clone(),
            ducking_enabled: self.ducking_enabled.clone(),
            emergency_response_ms: self.emergency_response_ms.clone(),
            secondary_response_ms: self.secondary_response_ms.clone(),
            dynamic_response_ms: self.dynamic_response_ms.clone(),
            default_hold_ms: self.default_hold_ms.clone(),
            max_simultaneous_speakers: self.max_simultaneous_speakers.clone(),
        }
    }
}

impl AppConfig {
    /// Config takes priority from:
    /// 1. CLI commands (eg. --log-level debug) will always win despite config.yaml saying otherwise
    /// 2. YAML config from ENV DMR_CONFIG_PATH
    /// 3. YAML config from CLI if no env is provided (--config)
    /// 4. Default config YAML file - ./config.yaml
    pub fn new() -> anyhow::Result<Self> {
        // Parse from real CLI args + env
        let mut args = AppConfigArgs::try_parse()?;
        Self::from_args(&mut args)
    }
    /// Testable constructor: accepts a pre-built AppConfigArgs so tests
    /// can bypass real CLI parsing.
    pub fn from_args(args: &mut AppConfigArgs) -> anyhow::Result<Self> {
        // Environment variable overrides the --config flag
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            args.config_path = path.into();
        }
        match File::open(&args.config_path) {
            Ok(f) => match serde_yaml::from_reader::<_, AppConfig>(BufReader::new(f)) {
                Ok(file_config) => {
                    let cfg = AppConfig::try_from(file_config)?;
                    Ok(cfg.merge(&mut args.config))
                }
                Err(err) => Err(err.into()),
            },
            Err(open_error) => Err(open_error.into()),
        }
    }
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            enabled: self.ducking_enabled,
            emergency_response: Duration::from_millis(self.emergency_response_ms),
            secondary_response: Duration::from_millis(self.secondary_response_ms),
            dynamic_response: Duration::from_millis(self.dynamic_response_ms),
            default_hold: Duration::from_millis(self.default_hold_ms),
            max_simultaneous_speakers: self.max_simultaneous_speakers,
        }
    }
}
