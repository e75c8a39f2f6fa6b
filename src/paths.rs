use std::path::PathBuf;

/// Config directory: `~/.config/vms/`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("vms")
}

/// Default config file: `~/.config/vms/config.toml`
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

