use crate::domain::models::DeviceTarget;
use crate::infrastructure::bluetooth::protocol;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// Where the turret lives and how to reach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default)]
    pub target_address: Option<String>,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_fallback_channel")]
    pub fallback_channel: u8,
    #[serde(default)]
    pub rfcomm_device_index: u8,
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
    /// Optional `host:port` of a serial bridge, tried after the Bluetooth strategies
    #[serde(default)]
    pub tcp_bridge: Option<String>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            target_address: None,
            target_name: None,
            service_uuid: default_service_uuid(),
            fallback_channel: default_fallback_channel(),
            rfcomm_device_index: 0,
            scan_duration_secs: default_scan_duration_secs(),
            tcp_bridge: None,
        }
    }
}

impl LinkSettings {
    pub fn target(&self) -> DeviceTarget {
        DeviceTarget {
            address: self.target_address.clone(),
            name: self.target_name.clone(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "turret_voice".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_fallback_channel() -> u8 {
    protocol::FALLBACK_CHANNEL
}
fn default_scan_duration_secs() -> u64 {
    12
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub link: LinkSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the platform config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::default_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn default_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("TurretVoice");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)
            .with_context(|| format!("writing {}", self.settings_path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.link.service_uuid, protocol::SERVICE_UUID);
        assert_eq!(settings.link.fallback_channel, 1);
        assert_eq!(settings.log_settings.level, "info");
        assert!(settings.link.target().address.is_none());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let json = r#"{ "link": { "target_address": "00:11:22:33:44:55" } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(
            settings.link.target_address.as_deref(),
            Some("00:11:22:33:44:55")
        );
        assert_eq!(settings.link.scan_duration_secs, 12);
        assert_eq!(settings.log_settings.rotation, "daily");
    }

    #[test]
    fn test_missing_file_yields_defaults_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::load(path.clone());
        assert!(service.get().link.tcp_bridge.is_none());

        service.get_mut().link.tcp_bridge = Some("127.0.0.1:7070".to_string());
        service.save().unwrap();

        let reloaded = SettingsService::load(path);
        assert_eq!(
            reloaded.get().link.tcp_bridge.as_deref(),
            Some("127.0.0.1:7070")
        );
    }
}
