use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSettings {
    /// Manifest mirrors, tried in order.
    #[serde(default = "default_manifest_urls")]
    pub manifest_urls: Vec<String>,

    #[serde(default = "default_true")]
    pub check_on_startup: bool,

    /// Bound on a single manifest request.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Longest idle gap tolerated while streaming the archive.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,

    /// How long the installer waits for the application to exit.
    #[serde(default = "default_release_wait")]
    pub release_wait_secs: u64,

    #[serde(default = "default_release_poll")]
    pub release_poll_millis: u64,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_manifest_urls() -> Vec<String> {
    vec![
        "https://raw.githubusercontent.com/DenisTsypniak/Kalkor/main/latest_version.json"
            .to_string(),
        "https://github.com/DenisTsypniak/Kalkor/raw/main/latest_version.json".to_string(),
        "https://cdn.jsdelivr.net/gh/DenisTsypniak/Kalkor@main/latest_version.json".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    60
}

fn default_retry_delays() -> Vec<u64> {
    vec![0, 2, 5]
}

fn default_release_wait() -> u64 {
    30
}

fn default_release_poll() -> u64 {
    250
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            manifest_urls: default_manifest_urls(),
            check_on_startup: true,
            http_timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            download_timeout_secs: default_download_timeout(),
            retry_delays_secs: default_retry_delays(),
            release_wait_secs: default_release_wait(),
            release_poll_millis: default_release_poll(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl UpdateSettings {
    /// Read settings from `path`; a missing or unreadable file yields
    /// defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Ignoring malformed settings {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Like [`Self::load_from`], but writes the defaults on first run so
    /// they can be edited.
    pub fn load_or_create(path: &Path) -> Self {
        if path.exists() {
            return Self::load_from(path);
        }
        let settings = Self::default();
        if let Err(error) = settings.save_to(path) {
            log::warn!("Failed to write default settings {}: {error}", path.display());
        }
        settings
    }

    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn release_wait(&self) -> Duration {
        Duration::from_secs(self.release_wait_secs)
    }

    pub fn release_poll(&self) -> Duration {
        Duration::from_millis(self.release_poll_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::UpdateSettings;

    #[test]
    fn missing_fields_take_defaults() {
        let settings: UpdateSettings =
            serde_json::from_str(r#"{"debug_logging":true,"retry_delays_secs":[1]}"#)
                .expect("partial settings should deserialize");

        assert!(settings.debug_logging);
        assert_eq!(settings.retry_delays_secs, vec![1]);
        assert_eq!(settings.manifest_urls.len(), 3);
        assert!(settings.check_on_startup);
        assert_eq!(settings.release_wait_secs, 30);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{ not json").expect("settings should be written");

        assert_eq!(UpdateSettings::load_from(&path), UpdateSettings::default());
        assert_eq!(
            UpdateSettings::load_from(&temp.path().join("missing.json")),
            UpdateSettings::default()
        );
    }

    #[test]
    fn save_then_load_keeps_custom_mirrors() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("config/settings.json");
        let settings = UpdateSettings {
            manifest_urls: vec!["https://mirror.example.com/latest_version.json".to_string()],
            check_on_startup: false,
            ..UpdateSettings::default()
        };

        settings.save_to(&path).expect("settings should save");

        assert_eq!(UpdateSettings::load_from(&path), settings);
    }

    #[test]
    fn first_run_writes_defaults_and_keeps_edits() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let path = temp.path().join("config/settings.json");

        assert_eq!(UpdateSettings::load_or_create(&path), UpdateSettings::default());
        assert!(path.is_file());

        std::fs::write(&path, r#"{"check_on_startup":false}"#).expect("settings should be edited");
        assert!(!UpdateSettings::load_or_create(&path).check_on_startup);
    }

    #[test]
    fn default_mirrors_use_https() {
        for url in UpdateSettings::default().manifest_urls {
            assert!(url.starts_with("https://"), "{url}");
        }
    }
}
