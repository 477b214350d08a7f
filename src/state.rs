//! On-disk record of a robot started by this server.
//!
//! The file holds an auth token with local HTTP access to the robot, so it is
//! always written `0600` and committed by renaming a temp file into place.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub const STATE_FILE_NAME: &str = ".gopherbot-mcp-state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub robot_dir: PathBuf,
    pub gopherbot_binary: PathBuf,
    pub auth_token: String,
    pub log_path: PathBuf,
    /// RFC-3339, UTC.
    pub started_at: String,
    pub command_args: Vec<String>,
}

pub fn state_path(robot_dir: &Path) -> PathBuf {
    robot_dir.join(STATE_FILE_NAME)
}

/// `Ok(None)` when the file does not exist.
pub fn read_state(path: &Path) -> Result<Option<ProcessRecord>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read state file {}", path.display())),
    };
    let record = serde_json::from_str(&text)
        .with_context(|| format!("parse state file {}", path.display()))?;
    Ok(Some(record))
}

pub fn write_state(path: &Path, record: &ProcessRecord) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(record)?;
    data.push(b'\n');

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let committed = stage_private(&tmp, &data).and_then(|()| {
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))
    });
    if committed.is_err() {
        // Partial contents may include the token.
        let _ = std::fs::remove_file(&tmp);
    }
    committed
}

fn stage_private(tmp: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(tmp)
        .with_context(|| format!("create {}", tmp.display()))?;
    // mode() only applies on creation; a stale temp file keeps its old bits.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("chmod {}", tmp.display()))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("write {}", tmp.display()))
}

/// Removing a file that is already gone is not an error.
pub fn remove_state(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove state file {}", path.display())),
    }
}
