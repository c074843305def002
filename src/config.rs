use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Log verbosity from the config file. `--debug` on the CLI wins over this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "informational")]
    Info,
    Debug,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Low-bitrate overlay settings. Disabled by default since the overlay
/// source has to exist in OBS before toggling it does anything useful.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BitrateConfig {
    pub enabled: bool,
    /// Threshold in mbps; the overlay shows while the sampled send rate is
    /// strictly below this.
    #[serde(rename = "threshold")]
    pub threshold_mbps: f64,
    /// Name of the warning source inside the live scene.
    pub overlay_source: String,
    /// Which connection state to sample the send rate from.
    pub connection_role: String,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_mbps: 1.0,
            overlay_source: "LowBitrateWarning".to_string(),
            connection_role: "publish".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub srt_api_url: String,
    pub obs_host: String,
    pub obs_port: u16,
    pub obs_password: String,
    /// Poll interval in milliseconds.
    pub check_interval: u64,
    pub live_scene: String,
    pub fallback_scene: String,
    pub log_level: LogLevel,
    pub bitrate: BitrateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            srt_api_url: "http://localhost:9997/v3/srtconns/list".to_string(),
            obs_host: "localhost".to_string(),
            obs_port: 4455,
            obs_password: String::new(),
            check_interval: 5000,
            live_scene: "Live".to_string(),
            fallback_scene: "Offline".to_string(),
            log_level: LogLevel::default(),
            bitrate: BitrateConfig::default(),
        }
    }
}

/// How the effective configuration was obtained, so the caller can log it
/// once the tracing subscriber is up.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Parsed from an existing file.
    Loaded,
    /// File was missing; defaults were written out to the path.
    Created,
    /// File was unreadable or malformed; defaults are in effect and the
    /// file was left untouched.
    Defaulted(String),
}

impl Config {
    /// Load the configuration from `path`, falling back to defaults.
    ///
    /// A missing file is created with the default settings. A malformed
    /// file is never rewritten so the operator can fix it in place.
    /// Configuration problems are never fatal.
    pub fn load_or_create(path: &Path) -> (Config, LoadOutcome) {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(config) => (config, LoadOutcome::Loaded),
                Err(e) => (
                    Config::default(),
                    LoadOutcome::Defaulted(format!("{} is malformed: {}", path.display(), e)),
                ),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = Config::default();
                match config.write_to(path) {
                    Ok(()) => (config, LoadOutcome::Created),
                    Err(e) => (
                        config,
                        LoadOutcome::Defaulted(format!(
                            "could not create {}: {}",
                            path.display(),
                            e
                        )),
                    ),
                }
            }
            Err(e) => (
                Config::default(),
                LoadOutcome::Defaulted(format!("could not read {}: {}", path.display(), e)),
            ),
        }
    }

    fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::write(path, raw)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let (config, outcome) = Config::load_or_create(&path);

        assert_eq!(outcome, LoadOutcome::Created);
        assert_eq!(config, Config::default());
        let raw = fs::read_to_string(&path).unwrap();
        let reloaded: Config = serde_json::from_str(&raw).unwrap();
        assert_eq!(reloaded, Config::default());
    }

    #[test]
    fn malformed_file_defaults_without_rewriting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ this is not json").unwrap();

        let (config, outcome) = Config::load_or_create(&path);

        assert!(matches!(outcome, LoadOutcome::Defaulted(_)));
        assert_eq!(config, Config::default());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ this is not json");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "liveScene": "OnAir", "bitrate": { "enabled": true, "threshold": 2.5 } }"#,
        )
        .unwrap();

        let (config, outcome) = Config::load_or_create(&path);

        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(config.live_scene, "OnAir");
        assert_eq!(config.fallback_scene, "Offline");
        assert!(config.bitrate.enabled);
        assert_eq!(config.bitrate.threshold_mbps, 2.5);
        assert_eq!(config.bitrate.connection_role, "publish");
    }

    #[test]
    fn config_keys_use_wire_names() {
        let raw = serde_json::to_string(&Config::default()).unwrap();
        assert!(raw.contains("\"srtApiUrl\""));
        assert!(raw.contains("\"checkInterval\""));
        assert!(raw.contains("\"logLevel\":\"info\""));
    }

    #[test]
    fn check_interval_converts_to_duration() {
        let config = Config {
            check_interval: 1500,
            ..Config::default()
        };
        assert_eq!(config.check_interval(), Duration::from_millis(1500));
    }
}
