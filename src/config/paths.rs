//! Where configuration and logs live.
//!
//! `<config dir>/advisor-voice`, where the config dir comes from `dirs`
//! (`%APPDATA%`, `~/Library/Application Support` or `$XDG_CONFIG_HOME`).
//! `ADVISOR_VOICE_HOME` replaces the whole path.

use std::path::PathBuf;

const APP_DIR: &str = "advisor-voice";
const HOME_OVERRIDE: &str = "ADVISOR_VOICE_HOME";

pub fn get_data_dir() -> PathBuf {
    match std::env::var_os(HOME_OVERRIDE) {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR),
    }
}

/// Directory for rolling log files.
pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}
