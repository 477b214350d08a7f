use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = ".gopherbot-mcp.json";

/// Optional per-root settings read from `<root>/.gopherbot-mcp.json`.
///
/// Every field is optional; a missing or unreadable file yields the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Robot binary used when `start_robot` omits `gopherbot_binary`.
    /// Relative paths resolve against the root. Unset means `<root>/gopherbot`.
    pub default_binary: Option<PathBuf>,
    /// Protocol forwarded by `send_message` / `get_messages` when the caller
    /// gives none. Empty lets the robot pick its primary protocol.
    pub default_protocol: String,
}

pub fn load_config(root: &Path) -> Config {
    let path = root.join(CONFIG_FILE_NAME);

    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(_) => return Config::default(),
    };

    match serde_json::from_str::<Config>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("[gopherbot-mcp] WARN: could not parse {}: {e}", path.display());
            Config::default()
        }
    }
}
