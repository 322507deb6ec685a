//! Persistent CLI settings (JSON file in the user config directory).
//!
//! Environment variables win over the file: `COLLOQUY_API_KEY`,
//! `COLLOQUY_ENDPOINT`, `COLLOQUY_MODEL`, `COLLOQUY_VOICE`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const API_KEY_ENV: &str = "COLLOQUY_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CliSettings {
    pub api_key: Option<String>,
    /// Custom live endpoint; `None` uses the built-in default.
    pub endpoint: Option<String>,
    pub model: String,
    pub voice: String,
    pub system_instruction: Option<String>,
    pub enable_search: bool,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
}

impl Default for CliSettings {
    fn default() -> Self {
        let core = colloquy_core::SessionConfig::default();
        Self {
            api_key: None,
            endpoint: None,
            model: core.model,
            voice: core.voice,
            system_instruction: None,
            enable_search: true,
            preferred_input_device: None,
            preferred_output_device: None,
        }
    }
}

impl CliSettings {
    pub fn normalize(&mut self) {
        self.api_key = trimmed(self.api_key.take());
        self.endpoint = trimmed(self.endpoint.take());
        self.system_instruction = self
            .system_instruction
            .take()
            .filter(|s| !s.trim().is_empty());
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());

        let defaults = CliSettings::default();
        if self.model.trim().is_empty() {
            self.model = defaults.model;
        }
        if self.voice.trim().is_empty() {
            self.voice = defaults.voice;
        }
    }

    /// Apply environment overrides on top of the file contents.
    pub fn apply_env(&mut self) {
        if let Some(key) = env_value(API_KEY_ENV) {
            self.api_key = Some(key);
        }
        if let Some(endpoint) = env_value("COLLOQUY_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Some(model) = env_value("COLLOQUY_MODEL") {
            self.model = model;
        }
        if let Some(voice) = env_value("COLLOQUY_VOICE") {
            self.voice = voice;
        }
    }

    pub fn session_config(&self) -> colloquy_core::SessionConfig {
        colloquy_core::SessionConfig {
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_instruction: self.system_instruction.clone(),
            enable_search: self.enable_search,
            preferred_input_device: self.preferred_input_device.clone(),
            preferred_output_device: self.preferred_output_device.clone(),
            ..colloquy_core::SessionConfig::default()
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        })
        .join("colloquy")
        .join("settings.json")
}

pub fn load_settings(path: &Path) -> CliSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<CliSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings.apply_env();
    settings
}
