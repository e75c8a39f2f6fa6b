use std::path::{Path, PathBuf};

use facet::Facet;

use crate::dispatcher::DEFAULT_WORKERS;
use crate::error::VmsError;
use crate::paths;

/// Upper bound for `reconnect_attempts`.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    /// Connection URI, e.g. `qemu:///system`. Unset lets libvirt choose.
    pub connect: Option<String>,
    #[facet(default = 4)]
    pub workers: usize,
    #[facet(default = 1)]
    pub reconnect_attempts: u32,
    #[facet(default = true)]
    pub sync_time_after_revert: bool,
    pub log_file: Option<String>,
    #[facet(default)]
    pub snapshot_description: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect: None,
            workers: DEFAULT_WORKERS,
            reconnect_attempts: 1,
            sync_time_after_revert: true,
            log_file: None,
            snapshot_description: String::new(),
        }
    }
}

impl Config {
    /// Apply command-line overrides.
    pub fn with_overrides(mut self, connect: Option<String>, workers: Option<usize>) -> Result<Self, VmsError> {
        if connect.is_some() {
            self.connect = connect;
        }
        if let Some(workers) = workers {
            self.workers = workers;
        }
        validate_config(&self)?;
        Ok(self)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(PathBuf::from)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VmsError> {
    if config.workers < 1 {
        return Err(VmsError::Validation {
            message: "workers must be at least 1".into(),
        });
    }
    if config.reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
        return Err(VmsError::Validation {
            message: format!("reconnect_attempts must be at most {MAX_RECONNECT_ATTEMPTS}"),
        });
    }
    if config.connect.as_deref().is_some_and(|uri| uri.trim().is_empty()) {
        return Err(VmsError::Validation {
            message: "connect must not be empty".into(),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, VmsError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| VmsError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Load the config file.
///
/// An explicit `path` must exist. Without one, the default location is used
/// if present and built-in defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<Config, VmsError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let default = paths::config_file();
            if !default.exists() {
                tracing::debug!(path = %default.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            default
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| VmsError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, &path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(toml: &str) -> Result<Config, VmsError> {
        parse_config(toml, Path::new("config.toml"))
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.connect, None);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.reconnect_attempts, 1);
        assert!(config.sync_time_after_revert);
    }

    #[test]
    fn parse_full_config() {
        let config = parse(
            r#"
connect = "qemu:///session"
workers = 8
reconnect_attempts = 2
sync_time_after_revert = false
log_file = "/tmp/vms.log"
snapshot_description = "taken by vms"
"#,
        )
        .unwrap();
        assert_eq!(config.connect.as_deref(), Some("qemu:///session"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.reconnect_attempts, 2);
        assert!(!config.sync_time_after_revert);
        assert_eq!(config.log_file(), Some(PathBuf::from("/tmp/vms.log")));
        assert_eq!(config.snapshot_description, "taken by vms");
    }

    #[test]
    fn zero_workers_rejected() {
        let err = parse("workers = 0").unwrap_err();
        assert!(err.to_string().contains("workers must be at least 1"));
    }

    #[test]
    fn too_many_reconnects_rejected() {
        assert!(matches!(
            parse("reconnect_attempts = 50"),
            Err(VmsError::Validation { .. })
        ));
    }

    #[test]
    fn empty_connect_rejected() {
        assert!(parse(r#"connect = "  ""#).is_err());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            parse("workers = [1, 2"),
            Err(VmsError::ConfigParse { .. })
        ));
    }

    #[test]
    fn overrides_take_precedence() {
        let config = parse(r#"connect = "qemu:///system""#)
            .unwrap()
            .with_overrides(Some("test:///default".into()), Some(2))
            .unwrap();
        assert_eq!(config.connect.as_deref(), Some("test:///default"));
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn override_zero_workers_rejected() {
        assert!(Config::default().with_overrides(None, Some(0)).is_err());
    }

    #[test]
    fn explicit_missing_file_fails() {
        let err = load_config(Some(Path::new("/nonexistent/vms.toml"))).unwrap_err();
        assert!(matches!(err, VmsError::ConfigLoad { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vms.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "workers = 3\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.workers, 3);
    }
}
