//! Configuration – reads/writes `~/.partsync/config.toml`.
//!
//! ```toml
//! poll_interval_ms = 1000
//! query_logging = false
//! verbose_query_logging = false
//!
//! [parts.demo]
//! host = "demo.local"
//!
//! [[simulation.machines]]
//! host = "demo.local"
//! revision = "1"
//! resources = [{ name = "arm1", type = "component", subtype = "arm" }]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use partsync_connect::{SimConnector, SimMachine};
use partsync_query::Interval;
use partsync_types::{ConnectionConfig, PartId, ResourceName};

/// Machines served by the in-process simulated fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Simulation {
    #[serde(default)]
    pub machines: Vec<SimMachine>,
}

/// Persisted configuration stored in `~/.partsync/config.toml`.
///
/// `Debug` is derived: credential payloads inside part configs redact
/// themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Machine-status polling period in milliseconds; `0` disables polling.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub query_logging: bool,

    #[serde(default)]
    pub verbose_query_logging: bool,

    /// Desired connections keyed by part ID.
    #[serde(default)]
    pub parts: BTreeMap<String, ConnectionConfig>,

    #[serde(default)]
    pub simulation: Simulation,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            query_logging: false,
            verbose_query_logging: false,
            parts: BTreeMap::new(),
            simulation: Simulation::default(),
        }
    }
}

impl Config {
    /// First-run configuration: one simulated machine and a part pointing at it.
    pub fn starter() -> Self {
        let mut cfg = Self::default();
        cfg.parts
            .insert("demo".to_string(), ConnectionConfig::new("demo.local"));
        cfg.simulation.machines.push(
            SimMachine::new("demo.local")
                .with_resource(ResourceName::new("arm1", "component", "arm"))
                .with_resource(ResourceName::new("base1", "component", "base"))
                .with_resource(ResourceName::new("cam", "component", "camera"))
                .with_resource(ResourceName::new("imu", "component", "movement_sensor")),
        );
        cfg
    }

    pub fn poll_interval(&self) -> Interval {
        Interval::from_millis(self.poll_interval_ms)
    }

    /// Parts in the form the registry reconciles against.
    pub fn desired_parts(&self) -> Vec<(PartId, ConnectionConfig)> {
        self.parts
            .iter()
            .map(|(id, config)| (PartId::from(id.as_str()), config.clone()))
            .collect()
    }

    /// Register every configured machine with `connector`.
    pub fn apply_simulation(&self, connector: &SimConnector) {
        for machine in &self.simulation.machines {
            connector.add_machine(machine.clone());
        }
    }
}

/// Return the path to `~/.partsync/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".partsync").join("config.toml")
}

/// Load the config from disk and apply environment overrides.  Returns `None`
/// if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Load the config from a specific path, without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `PARTSYNC_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PARTSYNC_POLL_INTERVAL_MS` | `poll_interval_ms` |
/// | `PARTSYNC_QUERY_LOGGING` | `query_logging` |
/// | `PARTSYNC_VERBOSE_QUERY_LOGGING` | `verbose_query_logging` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(ms) = env_value("PARTSYNC_POLL_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.poll_interval_ms = ms;
    }
    if let Some(on) = env_value("PARTSYNC_QUERY_LOGGING").and_then(|v| parse_flag(&v)) {
        cfg.query_logging = on;
    }
    if let Some(on) = env_value("PARTSYNC_VERBOSE_QUERY_LOGGING").and_then(|v| parse_flag(&v)) {
        cfg.verbose_query_logging = on;
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// `on`/`off` style switch values.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Save the config to disk, creating `~/.partsync/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner read/write only (rw-------).
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use partsync_types::Credentials;
    use std::time::Duration;

    #[test]
    fn starter_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::starter(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");

        assert_eq!(loaded.poll_interval_ms, 1000);
        assert!(!loaded.query_logging);
        assert_eq!(loaded.parts["demo"].host, "demo.local");
        assert_eq!(loaded.simulation.machines, Config::starter().simulation.machines);
    }

    #[test]
    fn minimal_file_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [parts.arm]
            host = "arm.local"
            signaling_address = "https://signal.example"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.poll_interval(), Interval::Every(Duration::from_millis(1000)));
        assert_eq!(cfg.parts["arm"].signaling_address.as_deref(), Some("https://signal.example"));
        assert!(cfg.simulation.machines.is_empty());

        let desired = cfg.desired_parts();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].0, PartId::from("arm"));
    }

    #[test]
    fn zero_interval_disables_polling() {
        let cfg = Config {
            poll_interval_ms: 0,
            ..Config::default()
        };
        assert_eq!(cfg.poll_interval(), Interval::Disabled);
    }

    #[test]
    fn simulation_machines_register_with_connector() {
        let connector = SimConnector::new();
        Config::starter().apply_simulation(&connector);
        assert_eq!(connector.hosts(), vec!["demo.local".to_string()]);
    }

    #[test]
    fn debug_redacts_credentials() {
        let mut cfg = Config::default();
        cfg.parts.insert(
            "arm".to_string(),
            ConnectionConfig::new("arm.local").with_credentials(Credentials {
                kind: "api-key".to_string(),
                payload: "super-secret".to_string(),
                auth_entity: None,
            }),
        );
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("super-secret"), "credential payload must not appear in debug output");
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let parent = path.parent().expect("parent");
        let dir_mode = std::fs::metadata(parent).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn config_path_points_to_partsync_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".partsync"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn flags_parse_common_spellings() {
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag(" 1 "), Some(true));
        assert_eq!(parse_flag("no"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn apply_env_overrides_changes_poll_interval() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("PARTSYNC_POLL_INTERVAL_MS", "250") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.poll_interval_ms, 250);
        unsafe { std::env::remove_var("PARTSYNC_POLL_INTERVAL_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_logging_flags() {
        // SAFETY: no other test touches these variables.
        unsafe {
            std::env::set_var("PARTSYNC_QUERY_LOGGING", "true");
            std::env::set_var("PARTSYNC_VERBOSE_QUERY_LOGGING", "not-a-flag");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!(cfg.query_logging);
        assert!(!cfg.verbose_query_logging, "invalid values are ignored");
        unsafe {
            std::env::remove_var("PARTSYNC_QUERY_LOGGING");
            std::env::remove_var("PARTSYNC_VERBOSE_QUERY_LOGGING");
        }
    }
}
