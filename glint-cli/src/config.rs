//! Load config from file and environment.

use std::path::PathBuf;

use serde::Deserialize;

/// Host configuration. File: ~/.config/glint/config.toml.
/// Env overrides: GLINT_NAME, GLINT_IDENTITY_PATH.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name announced in beacons and key exchange.
    #[serde(default)]
    pub name: Option<String>,
    /// Identity store file (default ~/.config/glint/identity.toml).
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("GLINT_NAME") {
        if !s.is_empty() {
            c.name = Some(s);
        }
    }
    if let Ok(s) = std::env::var("GLINT_IDENTITY_PATH") {
        if !s.is_empty() {
            c.identity_path = Some(PathBuf::from(s));
        }
    }
    c
}

pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/glint"))
}

fn load_file() -> Option<Config> {
    let path = config_dir()?.join("config.toml");
    let s = std::fs::read_to_string(path).ok()?;
    toml::from_str::<Config>(&s).ok()
}
