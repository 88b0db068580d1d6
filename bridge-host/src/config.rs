//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Host configuration. File: ~/.config/bridge/config.toml or /etc/bridge/config.toml.
/// Env overrides: BRIDGE_PORT, BRIDGE_RELAY_URL, BRIDGE_MATERIAL_WIDTH_M.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen port (default 8080).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Relay endpoint staging image bytes for `sendImage`.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Width in meters applied to image materials and components.
    #[serde(default = "default_material_width_m")]
    pub material_width_m: f64,
}

fn default_port() -> u16 {
    bridge_core::DEFAULT_PORT
}
fn default_relay_url() -> String {
    "https://renan3d.com.br/copiaecola/upload.php".to_string()
}
fn default_material_width_m() -> f64 {
    1.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            relay_url: default_relay_url(),
            material_width_m: default_material_width_m(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("BRIDGE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("BRIDGE_RELAY_URL") {
        if !s.is_empty() {
            c.relay_url = s;
        }
    }
    if let Ok(s) = std::env::var("BRIDGE_MATERIAL_WIDTH_M") {
        if let Ok(w) = s.parse::<f64>() {
            c.material_width_m = w;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bridge/config.toml"));
    }
    out.push(PathBuf::from("/etc/bridge/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
