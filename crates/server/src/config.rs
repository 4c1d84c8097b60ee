//! Broker settings.
//!
//! The settings file is owned by the extension's setup flow and written as
//! camelCase JSON; the broker reads only the values relevant to its own
//! buffers and timeouts. A missing file means defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 7007;
pub const DEFAULT_CONSOLE_CAPACITY: usize = 50;
pub const DEFAULT_NETWORK_CAPACITY: usize = 50;
pub const DEFAULT_ACTIVITY_WINDOW_SECS: u64 = 30;
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 20;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub port: u16,
    pub console_capacity: usize,
    pub network_capacity: usize,
    pub activity_window_secs: u64,
    pub snapshot_capacity: usize,
    pub request_timeout_ms: u64,
    pub capture_console: bool,
    pub capture_network: bool,
    pub screenshot: ScreenshotSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScreenshotSettings {
    pub enabled: bool,
    pub format: String,
    pub quality: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            console_capacity: DEFAULT_CONSOLE_CAPACITY,
            network_capacity: DEFAULT_NETWORK_CAPACITY,
            activity_window_secs: DEFAULT_ACTIVITY_WINDOW_SECS,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            capture_console: true,
            capture_network: true,
            screenshot: ScreenshotSettings::default(),
        }
    }
}

impl Default for ScreenshotSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            format: "png".to_string(),
            quality: 80,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or the default location when `None`.
    /// A missing file yields defaults; a malformed file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Settings> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var("DOMLENS_SETTINGS") {
                Ok(p) => PathBuf::from(p),
                Err(_) => default_settings_path(),
            },
        };

        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|e| {
                anyhow::anyhow!("malformed settings file {}: {e}", path.display())
            })?
        } else {
            Settings::default()
        };

        if let Ok(port) = std::env::var("DOMLENS_PORT") {
            settings.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("DOMLENS_PORT is not a valid port: {port}"))?;
        }

        Ok(settings)
    }
}

fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".domlens")
        .join("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.port, 7007);
        assert_eq!(s.console_capacity, 50);
        assert_eq!(s.network_capacity, 50);
        assert_eq!(s.activity_window_secs, 30);
        assert_eq!(s.snapshot_capacity, 20);
        assert!(s.capture_console);
        assert_eq!(s.screenshot.format, "png");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.port, DEFAULT_PORT);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{"port": 7100, "consoleCapacity": 10, "screenshot": {{"quality": 50}}}}"#
        )
        .unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.port, 7100);
        assert_eq!(s.console_capacity, 10);
        assert_eq!(s.network_capacity, DEFAULT_NETWORK_CAPACITY);
        assert_eq!(s.screenshot.quality, 50);
        assert_eq!(s.screenshot.format, "png");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Settings::load(Some(&path)).is_err());
    }
}
