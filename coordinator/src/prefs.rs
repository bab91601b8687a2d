//! User preferences that survive a restart. Session state (talkgroups,
//! speakers, the emergency flag) is deliberately not here; it is rebuilt from
//! the next connection.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_volume() -> f32 {
    1.0
}

fn default_on() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    #[serde(default = "default_on")]
    pub auto_join_static: bool,
    #[serde(default = "default_on")]
    pub emergency_alert_enabled: bool,
    #[serde(default = "default_volume")]
    pub master_volume: f32,
    #[serde(default = "default_on")]
    pub is_ducking_enabled: bool,
    /// Keys written by other builds ride along untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
            auto_join_static: default_on(),
            emergency_alert_enabled: default_on(),
            master_volume: default_volume(),
            is_ducking_enabled: default_on(),
            extra: Map::new(),
        }
    }
}

/// Preferences plus where they live on disk.
#[derive(Debug, Clone)]
pub struct PrefsStore {
    path: PathBuf,
    pub prefs: Preferences,
}

impl PrefsStore {
    /// A missing or unreadable file falls back to defaults; the store is not
    /// allowed to block startup.
    pub fn load(path: &Path) -> Self {
        let prefs = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(prefs) => prefs,
                Err(e) => {
                    tracing::warn!("preference file {:?} is malformed, using defaults: {e}", path);
                    Preferences::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Preferences::default(),
            Err(e) => {
                tracing::warn!("cannot read preference file {:?}, using defaults: {e}", path);
                Preferences::default()
            }
        };
        Self { path: path.to_path_buf(), prefs }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(&self.prefs)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dmroxide-prefs-{name}-{}.json", std::process::id()))
    }

    #[test]
    fn missing_keys_take_defaults() {
        let prefs: Preferences = serde_json::from_str(r#"{"masterVolume": 0.5}"#).unwrap();
        assert_eq!(prefs.master_volume, 0.5);
        assert_eq!(prefs.default_volume, 1.0);
        assert!(prefs.auto_join_static);
        assert!(prefs.is_ducking_enabled);
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let raw = r#"{"masterVolume": 0.25, "futureKnob": {"nested": true}}"#;
        let prefs: Preferences = serde_json::from_str(raw).unwrap();
        let rewritten = serde_json::to_string(&prefs).unwrap();
        let reparsed: Value = serde_json::from_str(&rewritten).unwrap();
        assert_eq!(reparsed["futureKnob"]["nested"], Value::Bool(true));
        assert_eq!(reparsed["masterVolume"], serde_json::json!(0.25));
    }

    #[test]
    fn load_save_round_trip() {
        let path = temp_path("roundtrip");
        let mut store = PrefsStore::load(&path);
        assert_eq!(store.prefs, Preferences::default());
        store.prefs.master_volume = 0.4;
        store.prefs.auto_join_static = false;
        store.save().unwrap();

        let reloaded = PrefsStore::load(&path);
        assert_eq!(reloaded.prefs.master_volume, 0.4);
        assert!(!reloaded.prefs.auto_join_static);
        let _ = std::fs::remove_file(&path);
    }
}
