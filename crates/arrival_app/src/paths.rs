use std::path::PathBuf;

use anyhow::{Context, Result};

/// Environment variable overriding the log directory.
pub const LOG_DIR_ENV: &str = "ARRIVAL_LOG_DIR";

/// Returns the base directory: `~/.arrival/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".arrival"))
}

/// Returns the server config path: `~/.arrival/server.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("server.json"))
}

/// Returns the logs directory: `$ARRIVAL_LOG_DIR`, or `~/.arrival/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
        _ => Ok(base_dir()?.join("logs")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_base_dir() {
        let Ok(base) = base_dir() else {
            return; // no home directory in this environment
        };
        assert!(base.ends_with(".arrival"));
        assert_eq!(config_path().unwrap(), base.join("server.json"));
    }
}
