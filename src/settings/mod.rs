use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inventory::InventorySettings;
use crate::reconciler::{ReconcilerConfig, RetryPolicy};

/// Used when neither the settings file nor `LIBVIRT_DEFAULT_URI` name a hypervisor
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// Environment variable libvirt itself honours
pub const LIBVIRT_URI_ENV: &str = "LIBVIRT_DEFAULT_URI";

/// Default settings file location: ~/.vmforge/config
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vmforge")
        .join("config")
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to parse settings: {0}")]
    ParseError(String),

    #[error("Failed to write settings: {0}")]
    WriteError(String),

    #[error("Invalid setting {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryOptions {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    pub ssh_user: String,
    /// Port probed to decide a node answers
    pub ssh_port: u16,
}

impl Default for InventoryOptions {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            timeout_secs: 300,
            ssh_user: "root".to_string(),
            ssh_port: 22,
        }
    }
}

/// Operator settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where lifecycle records live; `~` is expanded
    pub state_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub libvirt_uri: Option<String>,
    pub sysfs_root: String,
    pub max_parallel: usize,
    pub call_timeout_secs: u64,
    pub retry: RetrySettings,
    pub inventory: InventoryOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: "~/.vmforge/state".to_string(),
            libvirt_uri: None,
            sysfs_root: "/sys".to_string(),
            max_parallel: 4,
            call_timeout_secs: 120,
            retry: RetrySettings::default(),
            inventory: InventoryOptions::default(),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn parse_settings(content: &str) -> Result<Settings, SettingsError> {
    let settings: Settings =
        serde_yaml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
    settings.check()?;
    Ok(settings)
}

pub fn serialize_settings(settings: &Settings) -> Result<String, SettingsError> {
    serde_yaml::to_string(settings).map_err(|e| SettingsError::WriteError(e.to_string()))
}

/// File value first, then the environment, then the default
pub fn resolve_libvirt_uri(configured: Option<&str>, env: Option<String>) -> String {
    configured
        .map(String::from)
        .or(env.filter(|v| !v.is_empty()))
        .unwrap_or_else(|| DEFAULT_LIBVIRT_URI.to_string())
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

impl Settings {
    fn check(&self) -> Result<(), SettingsError> {
        let invalid = |field: &str, message: &str| SettingsError::Invalid {
            field: field.to_string(),
            message: message.to_string(),
        };
        if self.max_parallel == 0 {
            return Err(invalid("max_parallel", "must be at least 1"));
        }
        if self.call_timeout_secs == 0 {
            return Err(invalid("call_timeout_secs", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "must be a number >= 1.0"));
        }
        if self.inventory.poll_interval_secs == 0 {
            return Err(invalid("inventory.poll_interval_secs", "must be at least 1"));
        }
        Ok(())
    }

    pub fn with_state_dir(mut self, dir: impl Into<String>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_libvirt_uri(mut self, uri: impl Into<String>) -> Self {
        self.libvirt_uri = Some(uri.into());
        self
    }

    pub fn state_dir(&self) -> PathBuf {
        expand_path(&self.state_dir)
    }

    /// Default parent directory for storage pools
    pub fn pool_root(&self) -> PathBuf {
        self.state_dir().join("pools")
    }

    pub fn sysfs_root(&self) -> PathBuf {
        expand_path(&self.sysfs_root)
    }

    /// Hypervisor URI, consulting `LIBVIRT_DEFAULT_URI` when the file sets none
    pub fn libvirt_uri(&self) -> String {
        resolve_libvirt_uri(self.libvirt_uri.as_deref(), std::env::var(LIBVIRT_URI_ENV).ok())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            multiplier: self.retry.multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            max_parallel: self.max_parallel,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn inventory_settings(&self) -> InventorySettings {
        InventorySettings {
            poll_interval: Duration::from_secs(self.inventory.poll_interval_secs),
            timeout: Duration::from_secs(self.inventory.timeout_secs),
        }
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load settings from the default location
pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from(&default_settings_path())
}

/// Load settings from `path`; a missing file means defaults
pub fn load_settings_from(path: &Path) -> Result<Settings, SettingsError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_settings(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load variables from an env file into the process environment
pub fn load_env_file(path: &Path) -> Result<(), SettingsError> {
    dotenvy::from_path(path).map_err(|e| SettingsError::ParseError(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.max_parallel, 4);
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.inventory_settings(), InventorySettings::default());
        assert!(settings.pool_root().ends_with("state/pools"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = parse_settings(
            r#"
state_dir: /var/lib/vmforge
max_parallel: 8
retry:
  max_attempts: 5
inventory:
  ssh_user: rocky
"#,
        )
        .unwrap();
        assert_eq!(settings.state_dir(), PathBuf::from("/var/lib/vmforge"));
        assert_eq!(settings.max_parallel, 8);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_delay_ms, 2_000);
        assert_eq!(settings.inventory.ssh_user, "rocky");
        assert_eq!(settings.inventory.timeout_secs, 300);
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let err = parse_settings("max_parallel: 0").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { ref field, .. } if field == "max_parallel"));
    }

    #[test]
    fn test_libvirt_uri_precedence() {
        assert_eq!(
            resolve_libvirt_uri(Some("qemu+ssh://host/system"), Some("qemu:///session".into())),
            "qemu+ssh://host/system"
        );
        assert_eq!(resolve_libvirt_uri(None, Some("qemu:///session".into())), "qemu:///session");
        assert_eq!(resolve_libvirt_uri(None, Some(String::new())), DEFAULT_LIBVIRT_URI);
        assert_eq!(resolve_libvirt_uri(None, None), DEFAULT_LIBVIRT_URI);
    }

    #[test]
    fn test_tilde_is_expanded() {
        let settings = Settings::default().with_state_dir("~/clusters");
        assert!(!settings.state_dir().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config");
        let settings = Settings::default()
            .with_state_dir("/srv/vmforge")
            .with_libvirt_uri("qemu:///system");
        save_settings_to(&settings, &path).unwrap();
        assert_eq!(load_settings_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent")).unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn test_env_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "VMFORGE_TEST_ENV_FILE=loaded\n").unwrap();
        load_env_file(&path).unwrap();
        assert_eq!(std::env::var("VMFORGE_TEST_ENV_FILE").unwrap(), "loaded");
    }
}
