//! Settings parser for .vmbridge/config.toml

use std::path::{Path, PathBuf};

use vmbridge_core::prelude::*;

use super::types::Settings;

const CONFIG_FILENAME: &str = "config.toml";
const VMBRIDGE_DIR: &str = ".vmbridge";

/// Path of the config file for a project directory.
pub fn config_path(project_path: &Path) -> PathBuf {
    project_path.join(VMBRIDGE_DIR).join(CONFIG_FILENAME)
}

/// Load settings from `.vmbridge/config.toml`.
///
/// A missing file gives defaults. An unreadable or invalid file also gives
/// defaults, with a warning.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = config_path(project_path);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match load_settings_file(&config_path) {
        Ok(settings) => {
            debug!("Loaded settings from {:?}", config_path);
            settings
        }
        Err(e) => {
            warn!("{}; using defaults", e);
            Settings::default()
        }
    }
}

/// Load settings from an explicit file. Unlike [`load_settings`], errors are
/// returned rather than replaced by defaults.
pub fn load_settings_file(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("Failed to read {:?}: {}", path, e)))?;
    toml::from_str(&content).map_err(|e| Error::config(format!("Failed to parse {:?}: {}", path, e)))
}

/// Write a commented default config to `.vmbridge/config.toml` unless one
/// already exists.
pub fn init_config_dir(project_path: &Path) -> Result<PathBuf> {
    let dir = project_path.join(VMBRIDGE_DIR);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::config(format!("Failed to create {VMBRIDGE_DIR} dir: {e}")))?;
    }

    let path = dir.join(CONFIG_FILENAME);
    if !path.exists() {
        std::fs::write(&path, DEFAULT_CONFIG)
            .map_err(|e| Error::config(format!("Failed to write config.toml: {e}")))?;
        info!("Created default config at {:?}", path);
    }
    Ok(path)
}

const DEFAULT_CONFIG: &str = r#"# Flutter VM bridge configuration

[connection]
request_timeout_ms = 10000
connect_timeout_ms = 10000

# Reconnect schedule for one outage: base_delay_ms * backoff_factor^(n-1),
# capped at max_delay_ms, at most max_attempts tries.
[reconnect]
base_delay_ms = 1000
backoff_factor = 1.5
max_delay_ms = 30000
max_attempts = 5

# How many outages per target may be recovered automatically before a
# manual restart is required. The count resets after reset_window_secs
# without an outage.
[recovery]
max_attempts = 3
reset_window_secs = 3600

[monitor]
poll_interval_ms = 2000
streams = ["Logging", "Debug", "Extension"]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_settings_defaults() {
        let temp = tempdir().unwrap();
        let settings = load_settings(temp.path());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_settings_custom() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join(".vmbridge");
        std::fs::create_dir_all(&dir).unwrap();

        let config = r#"
[connection]
request_timeout_ms = 2500

[reconnect]
base_delay_ms = 250
backoff_factor = 2.0

[monitor]
streams = ["Logging"]
"#;
        std::fs::write(dir.join("config.toml"), config).unwrap();

        let settings = load_settings(temp.path());
        assert_eq!(settings.connection.request_timeout_ms, 2500);
        assert_eq!(settings.connection.connect_timeout_ms, 10_000);
        assert_eq!(settings.reconnect.base_delay_ms, 250);
        assert_eq!(settings.reconnect.backoff_factor, 2.0);
        assert_eq!(settings.monitor.streams, vec!["Logging"]);
    }

    #[test]
    fn test_load_settings_invalid_toml() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join(".vmbridge");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), "not valid toml {{{{").unwrap();

        let settings = load_settings(temp.path());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_settings_file_errors() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("missing.toml");
        assert!(matches!(
            load_settings_file(&missing),
            Err(Error::ConfigNotFound { .. })
        ));

        let bad = temp.path().join("bad.toml");
        std::fs::write(&bad, "[reconnect]\nmax_attempts = \"many\"").unwrap();
        assert!(matches!(load_settings_file(&bad), Err(Error::Config { .. })));
    }

    #[test]
    fn test_init_config_dir() {
        let temp = tempdir().unwrap();

        let path = init_config_dir(temp.path()).unwrap();
        assert!(path.exists());

        let content = std::fs::read_to_string(&path).unwrap();
        let settings: Settings = toml::from_str(&content).expect("default config should parse");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_init_config_dir_keeps_existing() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join(".vmbridge");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.toml"), "[recovery]\nmax_attempts = 9\n").unwrap();

        init_config_dir(temp.path()).unwrap();

        assert_eq!(load_settings(temp.path()).recovery.max_attempts, 9);
    }
}
