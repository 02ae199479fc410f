use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Application configuration for persisting user preferences.
#[derive(Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_device")]
    pub last_input: String,
    #[serde(default = "default_device")]
    pub last_output: String,
    #[serde(default)]
    pub last_reference: Option<String>,
    #[serde(default = "default_true")]
    pub aec_enabled: bool,
    #[serde(default = "default_true")]
    pub denoise: bool,
    #[serde(default = "default_true")]
    pub agc: bool,
    #[serde(default)]
    pub vad: bool,
    #[serde(default)]
    pub debug: bool,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            last_input: default_device(),
            last_output: default_device(),
            last_reference: None,
            aec_enabled: true,
            denoise: true,
            agc: true,
            vad: false,
            debug: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from disk, or returns default if not found.
    pub fn load() -> Self {
        if let Some(path) = config_path() {
            if let Ok(content) = fs::read_to_string(path) {
                if let Ok(cfg) = serde_json::from_str(&content) {
                    return cfg;
                }
            }
        }
        Self::default()
    }

    /// Saves configuration to disk in JSON format.
    pub fn save(&self) {
        if let Some(path) = config_path() {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Ok(json) = serde_json::to_string_pretty(self) {
                let _ = fs::write(path, json);
            }
        }
    }
}

fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "echosync", "echosync")
        .map(|dirs| dirs.config_dir().join("config.json"))
}
