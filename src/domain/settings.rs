use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Diagnostics output. `NUIMO_LOG` / `RUST_LOG` take precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    /// Rolling log file; no file is written when absent
    #[serde(default)]
    pub file: Option<LogFileSettings>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console: true,
            ansi_colors: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFileSettings {
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_prefix")]
    pub prefix: String,
    /// One of `daily`, `hourly`, `minutely`, `never`
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

impl Default for LogFileSettings {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            prefix: default_log_prefix(),
            rotation: default_rotation(),
        }
    }
}

/// Tuning of a controller session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_display_interval")]
    pub default_matrix_display_interval_secs: f64,
    /// Time after which an unacknowledged write-without-response is given up on
    #[serde(default = "default_without_response_timeout_ms")]
    pub write_without_response_timeout_ms: u64,
    #[serde(default = "default_recovery_check_interval_ms")]
    pub write_recovery_check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub read_device_information: bool,
}

impl SessionSettings {
    pub fn write_without_response_timeout(&self) -> Duration {
        Duration::from_millis(self.write_without_response_timeout_ms)
    }

    pub fn write_recovery_check_interval(&self) -> Duration {
        // A zero period would make the recovery ticker panic
        Duration::from_millis(self.write_recovery_check_interval_ms.max(1))
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_matrix_display_interval_secs: default_display_interval(),
            write_without_response_timeout_ms: default_without_response_timeout_ms(),
            write_recovery_check_interval_ms: default_recovery_check_interval_ms(),
            read_device_information: default_true(),
        }
    }
}

/// Discovery registry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Advertised names accepted as controllers
    #[serde(default = "default_device_names")]
    pub device_names: Vec<String>,
    #[serde(default = "default_lost_controller_timeout_ms")]
    pub lost_controller_timeout_ms: u64,
    #[serde(default = "default_lost_controller_check_interval_ms")]
    pub lost_controller_check_interval_ms: u64,
}

impl DiscoverySettings {
    pub fn lost_controller_timeout(&self) -> Duration {
        Duration::from_millis(self.lost_controller_timeout_ms)
    }

    pub fn lost_controller_check_interval(&self) -> Duration {
        Duration::from_millis(self.lost_controller_check_interval_ms.max(1))
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            device_names: default_device_names(),
            lost_controller_timeout_ms: default_lost_controller_timeout_ms(),
            lost_controller_check_interval_ms: default_lost_controller_check_interval_ms(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
/// Next to the settings file when a config directory exists
fn default_log_directory() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("NuimoController").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}
fn default_log_prefix() -> String {
    "nuimo_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_display_interval() -> f64 {
    2.0
}
fn default_without_response_timeout_ms() -> u64 {
    500
}
fn default_recovery_check_interval_ms() -> u64 {
    100
}
fn default_device_names() -> Vec<String> {
    vec!["Nuimo".to_string()]
}
fn default_lost_controller_timeout_ms() -> u64 {
    7000
}
fn default_lost_controller_check_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, defaults if it is missing or unreadable
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("NuimoController");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
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
    fn test_missing_fields_fall_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "session": { "write_without_response_timeout_ms": 250 } }"#)
                .unwrap();
        assert_eq!(settings.session.write_without_response_timeout_ms, 250);
        assert_eq!(settings.session.default_matrix_display_interval_secs, 2.0);
        assert_eq!(settings.session.write_recovery_check_interval_ms, 100);
        assert_eq!(settings.discovery.device_names, vec!["Nuimo".to_string()]);
        assert_eq!(settings.log_settings.level, "info");
        assert!(settings.log_settings.file.is_none());
    }

    #[test]
    fn test_partial_log_file_section() {
        let settings: LogSettings =
            serde_json::from_str(r#"{ "console": false, "file": { "rotation": "hourly" } }"#)
                .unwrap();
        assert!(!settings.console);
        let file = settings.file.unwrap();
        assert_eq!(file.rotation, "hourly");
        assert_eq!(file.prefix, "nuimo_controller");
        assert!(file.directory.ends_with("logs"));
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "nuimo_settings_test_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().discovery.lost_controller_timeout_ms = 3000;
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(reloaded.get().discovery.lost_controller_timeout_ms, 3000);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_unreadable_file_uses_defaults() {
        let service = SettingsService::with_path(PathBuf::from("/nonexistent/dir/settings.json"));
        assert_eq!(service.get().session.write_without_response_timeout_ms, 500);
    }

    #[test]
    fn test_zero_check_interval_is_clamped() {
        let session = SessionSettings {
            write_recovery_check_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(session.write_recovery_check_interval(), Duration::from_millis(1));
    }
}
