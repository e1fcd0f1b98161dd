//! Configuration vault – reads/writes `~/.aegis/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aegis_kernel::GestureSettings;
use aegis_runtime::ControllerConfig;

/// Persisted user configuration stored in `~/.aegis/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Identifier the local profile row is keyed by.
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Seconds between evidence-count refreshes while a session is active.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// SQLite database holding the profile, evidence and enrollments.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Gesture evaluator switches and thresholds.
    #[serde(default)]
    pub gestures: GestureSettings,
}

fn default_user_id() -> String {
    "local-user".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_database_path() -> String {
    aegis_dir_for_home(&home_dir())
        .join("aegis.db")
        .to_string_lossy()
        .into_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            poll_interval_secs: default_poll_interval_secs(),
            database_path: default_database_path(),
            gestures: GestureSettings::default(),
        }
    }
}

impl Config {
    /// Runtime settings derived from this file.  A zero interval falls back
    /// to the default.
    pub fn controller_config(&self) -> ControllerConfig {
        let secs = if self.poll_interval_secs == 0 {
            default_poll_interval_secs()
        } else {
            self.poll_interval_secs
        };
        ControllerConfig {
            poll_interval: Duration::from_secs(secs),
            gestures: self.gestures.clone(),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn aegis_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".aegis")
}

/// Return the path to `~/.aegis/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    aegis_dir_for_home(home).join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `AEGIS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `AEGIS_POLL_INTERVAL_SECS` | `poll_interval_secs` |
/// | `AEGIS_DATABASE_PATH` | `database_path` |
/// | `AEGIS_SHAKE_THRESHOLD` | `gestures.shake_threshold` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("AEGIS_POLL_INTERVAL_SECS")
        && let Ok(secs) = v.trim().parse::<u64>()
        && secs > 0
    {
        cfg.poll_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("AEGIS_DATABASE_PATH")
        && !v.trim().is_empty()
    {
        cfg.database_path = v;
    }
    if let Ok(v) = std::env::var("AEGIS_SHAKE_THRESHOLD")
        && let Ok(threshold) = v.trim().parse::<f32>()
        && threshold.is_finite()
    {
        cfg.gestures.shake_threshold = threshold;
    }
}

/// Save the config to disk, creating `~/.aegis/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

/// Create `dir` (owner-only on Unix) if it does not exist yet.
pub fn ensure_private_dir(dir: &Path) -> Result<(), String> {
    fs::create_dir_all(dir).map_err(|e| format!("Failed to create {}: {}", dir.display(), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| format!("Failed to set permissions on {}: {}", dir.display(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.user_id = "ana".into();
        cfg.gestures.power_button = true;
        cfg.gestures.tap_threshold = 12;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.user_id, "ana");
        assert!(loaded.gestures.power_button);
        assert_eq!(loaded.gestures.tap_threshold, 12);
        assert_eq!(loaded.gestures.volume_press_threshold, 3);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "user_id = \"sam\"\n[gestures]\nshake = false\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.user_id, "sam");
        assert_eq!(loaded.poll_interval_secs, 5);
        assert!(!loaded.gestures.shake);
        assert_eq!(loaded.gestures.shake_threshold, 15.0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poll_interval_secs = \"soon\"").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_aegis_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.aegis/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn controller_config_uses_interval_and_gestures() {
        let mut cfg = Config::default();
        cfg.poll_interval_secs = 9;
        cfg.gestures.shake_threshold = 22.5;
        let rc = cfg.controller_config();
        assert_eq!(rc.poll_interval, Duration::from_secs(9));
        assert_eq!(rc.gestures.shake_threshold, 22.5);

        cfg.poll_interval_secs = 0;
        assert_eq!(cfg.controller_config().poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn apply_env_overrides_changes_poll_interval() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("AEGIS_POLL_INTERVAL_SECS", "12") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.poll_interval_secs, 12);
        unsafe { std::env::remove_var("AEGIS_POLL_INTERVAL_SECS") };
    }

    #[test]
    fn apply_env_overrides_changes_database_path() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("AEGIS_DATABASE_PATH", "/tmp/aegis-test.db") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.database_path, "/tmp/aegis-test.db");
        unsafe { std::env::remove_var("AEGIS_DATABASE_PATH") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_threshold() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("AEGIS_SHAKE_THRESHOLD", "strong") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.gestures.shake_threshold, 15.0);
        unsafe { std::env::remove_var("AEGIS_SHAKE_THRESHOLD") };
    }
}
