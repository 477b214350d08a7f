//! Robot child-process lifecycle: start, liveness probing, graceful then
//! forced termination, and status queries.
//!
//! A robot is not owned by the server process in the RAII sense. It must
//! outlive a single MCP session, and a later server instance attaches to it
//! through the state file in the robot directory. The state file alone
//! asserts ownership.

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::args::{RobotDirArgs, StartArgs};
use crate::config::Config;
use crate::state::{read_state, remove_state, state_path, write_state, ProcessRecord};

pub const LOG_FILE_NAME: &str = "robot.log";
pub const AIPORT_FILE_NAME: &str = ".aiport";
pub const DEFAULT_BINARY_NAME: &str = "gopherbot";

const TOKEN_BYTES: usize = 24;
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(600);
const EARLY_EXIT_POLL: Duration = Duration::from_millis(50);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(8);
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct Supervisor {
    root: PathBuf,
    default_binary: PathBuf,
    /// Serializes every read-modify-write of a state file.
    lock: Mutex<()>,
}

impl Supervisor {
    pub fn new(root: PathBuf, config: &Config) -> Self {
        let root = clean_path(&root);
        let default_binary = match &config.default_binary {
            Some(p) => resolve_against(&root, p),
            None => root.join(DEFAULT_BINARY_NAME),
        };
        Self {
            root,
            default_binary,
            lock: Mutex::new(()),
        }
    }

    pub fn default_binary(&self) -> &Path {
        &self.default_binary
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock carries no torn state.
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve a caller-supplied path against the root and clean it lexically.
    pub fn resolve(&self, p: &str) -> PathBuf {
        resolve_against(&self.root, Path::new(p))
    }

    pub fn start_robot(&self, args: &StartArgs) -> Result<Value> {
        let _guard = self.lock();

        let robot_dir = self.resolve(&args.robot_dir);
        let meta = std::fs::metadata(&robot_dir)
            .with_context(|| format!("robot_dir {}", robot_dir.display()))?;
        if !meta.is_dir() {
            bail!("robot_dir {} is not a directory", robot_dir.display());
        }

        let state_file = state_path(&robot_dir);
        if let Some(existing) = read_state(&state_file)? {
            if pid_alive(existing.pid) {
                bail!(
                    "robot already running in {} (pid {})",
                    robot_dir.display(),
                    existing.pid
                );
            }
        }

        let binary = if args.gopherbot_binary.is_empty() {
            self.default_binary.clone()
        } else {
            self.resolve(&args.gopherbot_binary)
        };
        check_executable(&binary)?;

        let auth_token = if args.auth_token.is_empty() {
            mint_token()?
        } else {
            args.auth_token.clone()
        };

        let mut command_args = vec!["--aidev".to_string(), auth_token.clone()];
        command_args.extend(args.extra_args.iter().cloned());
        command_args.push("run".to_string());

        let log_path = robot_dir.join(LOG_FILE_NAME);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&log_path)
            .with_context(|| format!("open log {}", log_path.display()))?;
        let log_err = log.try_clone().context("duplicate log file handle")?;

        let mut cmd = Command::new(&binary);
        cmd.args(&command_args)
            .current_dir(&robot_dir)
            .envs(&args.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);
        let spawned = cmd.spawn();
        // Release our copies of the log descriptors; the child holds its own.
        drop(cmd);
        let mut child = spawned.with_context(|| format!("launch {}", binary.display()))?;

        if let Some(status) = wait_early_exit(&mut child, EARLY_EXIT_WINDOW)? {
            bail!(
                "robot exited shortly after start ({status}); check {}",
                log_path.display()
            );
        }

        let pid = child.id() as i32;
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        let record = ProcessRecord {
            pid,
            robot_dir: robot_dir.clone(),
            gopherbot_binary: binary.clone(),
            auth_token: auth_token.clone(),
            log_path: log_path.clone(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            command_args: command_args.clone(),
        };
        if let Err(e) = write_state(&state_file, &record) {
            // Without a state file nothing could ever stop this child.
            let _ = send_signal(pid, libc::SIGKILL);
            return Err(e);
        }

        eprintln!(
            "[gopherbot-mcp] INFO: started robot pid={pid} dir={}",
            robot_dir.display()
        );

        Ok(json!({
            "pid": pid,
            "robot_dir": robot_dir,
            "gopherbot_binary": binary,
            "auth_token": auth_token,
            "log_path": log_path,
            "state_file": state_file,
            "started_at": record.started_at,
            "command_args": command_args,
        }))
    }

    pub fn stop_robot(&self, args: &RobotDirArgs) -> Result<Value> {
        let _guard = self.lock();

        let robot_dir = self.resolve(&args.robot_dir);
        let state_file = state_path(&robot_dir);
        let Some(record) = read_state(&state_file)? else {
            return Ok(json!({
                "robot_dir": robot_dir,
                "state_file": state_file,
                "message": "no state file found",
            }));
        };

        let pid = record.pid;
        let was_running = pid_alive(pid);
        let mut stopped_gracefully = false;
        let mut force_killed = false;

        if was_running {
            send_signal(pid, libc::SIGTERM)?;
            if wait_for_exit(pid, GRACEFUL_STOP_TIMEOUT) {
                stopped_gracefully = true;
            } else {
                send_signal(pid, libc::SIGKILL)?;
                force_killed = true;
                if !wait_for_exit(pid, FORCE_KILL_TIMEOUT) {
                    bail!("robot pid {pid} still alive after SIGKILL; state file kept");
                }
            }
        }

        remove_state(&state_file)?;

        eprintln!(
            "[gopherbot-mcp] INFO: stopped robot pid={pid} dir={} graceful={stopped_gracefully} forced={force_killed}",
            robot_dir.display()
        );

        Ok(json!({
            "pid": pid,
            "robot_dir": robot_dir,
            "was_running": was_running,
            "stopped_gracefully": stopped_gracefully,
            "force_killed": force_killed,
        }))
    }

    pub fn robot_status(&self, args: &RobotDirArgs) -> Result<Value> {
        let _guard = self.lock();

        let robot_dir = self.resolve(&args.robot_dir);
        let state_file = state_path(&robot_dir);
        let aiport_file = robot_dir.join(AIPORT_FILE_NAME);
        let record = read_state(&state_file)?;
        // The record is still worth reporting when the port file is unreadable.
        let aiport = read_aiport(&robot_dir).unwrap_or_else(|e| {
            eprintln!("[gopherbot-mcp] WARN: {e:#}");
            String::new()
        });

        let Some(record) = record else {
            return Ok(json!({
                "running": false,
                "robot_dir": robot_dir,
                "state_file": state_file,
                "aiport_file": aiport_file,
                "aiport": aiport,
            }));
        };

        Ok(json!({
            "running": pid_alive(record.pid),
            "pid": record.pid,
            "robot_dir": record.robot_dir,
            "gopherbot_binary": record.gopherbot_binary,
            "auth_token": record.auth_token,
            "log_path": record.log_path,
            "started_at": record.started_at,
            "command_args": record.command_args,
            "state_file": state_file,
            "aiport_file": aiport_file,
            "aiport": aiport,
        }))
    }
}

fn resolve_against(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        clean_path(p)
    } else {
        clean_path(&root.join(p))
    }
}

/// Lexical cleanup: drops `.`, folds `..` into its parent. Never touches the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `/..` is `/`
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn check_executable(binary: &Path) -> Result<()> {
    let meta = std::fs::metadata(binary)
        .with_context(|| format!("gopherbot binary {}", binary.display()))?;
    if !meta.is_file() {
        bail!("gopherbot binary {} is not a regular file", binary.display());
    }
    if meta.permissions().mode() & 0o111 == 0 {
        bail!("gopherbot binary {} is not executable", binary.display());
    }
    Ok(())
}

/// 24 bytes from the OS CSPRNG as 48 lowercase hex characters.
pub fn mint_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("read random bytes for auth token")?;
    Ok(hex::encode(bytes))
}

/// Trimmed contents of `<robot_dir>/.aiport`, empty when the file is absent.
pub fn read_aiport(robot_dir: &Path) -> Result<String> {
    let path = robot_dir.join(AIPORT_FILE_NAME);
    match std::fs::read_to_string(&path) {
        Ok(s) => Ok(s.trim().to_string()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

/// `kill(pid, 0)` probe. EPERM counts as alive: the process exists but may
/// have dropped privileges after launch. Only ESRCH means dead.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}

/// Deliver `sig`; a process that is already gone counts as success.
fn send_signal(pid: i32, sig: libc::c_int) -> Result<()> {
    if pid <= 0 {
        bail!("refusing to signal non-positive pid {pid}");
    }
    if unsafe { libc::kill(pid, sig) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err).with_context(|| format!("send signal {sig} to pid {pid}"))
}

/// Poll liveness until `timeout`; `true` once the process is gone.
pub fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
    !pid_alive(pid)
}

/// Reaps and returns the status if the child exits within `window`.
fn wait_early_exit(child: &mut Child, window: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + window;
    loop {
        if let Some(status) = child.try_wait().context("poll child status")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(EARLY_EXIT_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::STATE_FILE_NAME;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    fn start_args(dir: &str, binary: &Path) -> StartArgs {
        StartArgs {
            robot_dir: dir.to_string(),
            gopherbot_binary: binary.to_string_lossy().into_owned(),
            auth_token: String::new(),
            extra_args: Vec::new(),
            env: Default::default(),
        }
    }

    fn dir_args(dir: &str) -> RobotDirArgs {
        RobotDirArgs { robot_dir: dir.to_string() }
    }

    #[test]
    fn clean_path_folds_dots() {
        assert_eq!(clean_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(clean_path(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(clean_path(Path::new("./")), PathBuf::from("."));
    }

    #[test]
    fn resolve_uses_root_for_relative_paths() {
        let sup = Supervisor::new(PathBuf::from("/srv/bots"), &Config::default());
        assert_eq!(sup.resolve("./r1"), PathBuf::from("/srv/bots/r1"));
        assert_eq!(sup.resolve("/opt/r2/"), PathBuf::from("/opt/r2"));
        assert_eq!(sup.default_binary(), Path::new("/srv/bots/gopherbot"));

        let cfg = Config {
            default_binary: Some(PathBuf::from("bin/../gb")),
            ..Config::default()
        };
        let sup = Supervisor::new(PathBuf::from("/srv/bots"), &cfg);
        assert_eq!(sup.default_binary(), Path::new("/srv/bots/gb"));
    }

    #[test]
    fn minted_tokens_are_48_hex_and_distinct() {
        let a = mint_token().unwrap();
        let b = mint_token().unwrap();
        assert_eq!(a.len(), 48);
        assert!(a.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_ne!(a, b);
    }

    #[test]
    fn liveness_probe() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(-7));
        assert!(pid_alive(std::process::id() as i32));
        assert!(wait_for_exit(-1, Duration::from_millis(10)));
    }

    #[test]
    fn start_then_stop_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let bin = write_script(tmp.path(), "fakebot", "exec sleep 10");
        std::fs::create_dir(tmp.path().join("r")).unwrap();
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());

        let mut args = start_args("./r", &bin);
        args.extra_args = vec!["-l".into(), "debug".into()];
        let out = sup.start_robot(&args).unwrap();

        let pid = out["pid"].as_i64().unwrap() as i32;
        assert!(pid > 0);
        assert!(pid_alive(pid));
        let token = out["auth_token"].as_str().unwrap().to_string();
        assert_eq!(token.len(), 48);
        assert_eq!(
            out["command_args"],
            json!(["--aidev", token, "-l", "debug", "run"])
        );

        let state_file = tmp.path().join("r").join(STATE_FILE_NAME);
        let mode = std::fs::metadata(&state_file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let record = read_state(&state_file).unwrap().unwrap();
        assert_eq!(record.pid, pid);
        assert_eq!(record.auth_token, token);

        let again = sup.start_robot(&args).unwrap_err().to_string();
        assert!(again.contains("already running"), "{again}");

        let status = sup.robot_status(&dir_args("r")).unwrap();
        assert_eq!(status["running"], json!(true));
        assert_eq!(status["pid"], json!(pid));

        let stopped = sup.stop_robot(&dir_args("r")).unwrap();
        assert_eq!(stopped["was_running"], json!(true));
        assert_eq!(stopped["stopped_gracefully"], json!(true));
        assert_eq!(stopped["force_killed"], json!(false));
        assert!(!state_file.exists());
        assert!(!pid_alive(pid));
    }

    #[test]
    fn caller_env_and_token_reach_the_child() {
        let tmp = TempDir::new().unwrap();
        let bin = write_script(
            tmp.path(),
            "fakebot",
            "echo \"$@\" > args.txt\necho \"$GMCP_TEST_VALUE\" > env.txt\nexec sleep 10",
        );
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());

        let mut args = start_args(".", &bin);
        args.auth_token = "fixed-token".to_string();
        args.env.insert("GMCP_TEST_VALUE".into(), "from-caller".into());
        sup.start_robot(&args).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !tmp.path().join("env.txt").exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        std::thread::sleep(Duration::from_millis(100));
        let argv = std::fs::read_to_string(tmp.path().join("args.txt")).unwrap();
        assert_eq!(argv.trim(), "--aidev fixed-token run");
        let env = std::fs::read_to_string(tmp.path().join("env.txt")).unwrap();
        assert_eq!(env.trim(), "from-caller");

        sup.stop_robot(&dir_args(".")).unwrap();
    }

    #[test]
    fn caller_env_overrides_inherited_values() {
        // Only this test touches the variable.
        std::env::set_var("GMCP_LAYERED_VALUE", "from-server");
        let tmp = TempDir::new().unwrap();
        let bin = write_script(
            tmp.path(),
            "fakebot",
            "echo \"$GMCP_LAYERED_VALUE\" > layered.txt\necho \"$HOME\" > home.txt\nexec sleep 10",
        );
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());

        let mut args = start_args(".", &bin);
        args.env.insert("GMCP_LAYERED_VALUE".into(), "from-caller".into());
        args.env.insert("HOME".into(), "/caller/home".into());
        sup.start_robot(&args).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !tmp.path().join("home.txt").exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        std::thread::sleep(Duration::from_millis(100));
        let layered = std::fs::read_to_string(tmp.path().join("layered.txt")).unwrap();
        assert_eq!(layered.trim(), "from-caller");
        let home = std::fs::read_to_string(tmp.path().join("home.txt")).unwrap();
        assert_eq!(home.trim(), "/caller/home");

        sup.stop_robot(&dir_args(".")).unwrap();
    }

    #[test]
    fn status_survives_an_unreadable_aiport() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join(AIPORT_FILE_NAME)).unwrap();
        let rec = ProcessRecord {
            pid: i32::MAX,
            robot_dir: tmp.path().to_path_buf(),
            gopherbot_binary: tmp.path().join("gopherbot"),
            auth_token: "t".into(),
            log_path: tmp.path().join(LOG_FILE_NAME),
            started_at: "2020-01-01T00:00:00Z".into(),
            command_args: vec![],
        };
        write_state(&state_path(tmp.path()), &rec).unwrap();
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());

        let out = sup.robot_status(&dir_args(".")).unwrap();
        assert_eq!(out["running"], json!(false));
        assert_eq!(out["pid"], json!(i32::MAX));
        assert_eq!(out["aiport"], json!(""));
    }

    #[test]
    fn early_exit_is_reported_with_log_path() {
        let tmp = TempDir::new().unwrap();
        let bin = write_script(tmp.path(), "crashbot", "echo boom >&2\nexit 3");
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());

        let err = sup.start_robot(&start_args(".", &bin)).unwrap_err().to_string();
        assert!(err.contains("exited shortly after start"), "{err}");
        assert!(err.contains("robot.log"), "{err}");
        assert!(!tmp.path().join(STATE_FILE_NAME).exists());
        let log = std::fs::read_to_string(tmp.path().join(LOG_FILE_NAME)).unwrap();
        assert!(log.contains("boom"));
    }

    #[test]
    fn start_validates_dir_and_binary() {
        let tmp = TempDir::new().unwrap();
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());

        let plain = tmp.path().join("plain");
        std::fs::write(&plain, "not a program").unwrap();
        let err = sup.start_robot(&start_args(".", &plain)).unwrap_err().to_string();
        assert!(err.contains("not executable"), "{err}");

        let err = sup.start_robot(&start_args("missing", &plain)).unwrap_err().to_string();
        assert!(err.contains("robot_dir"), "{err}");

        let err = sup.start_robot(&start_args("plain", &plain)).unwrap_err().to_string();
        assert!(err.contains("not a directory"), "{err}");

        // Default binary <root>/gopherbot does not exist here.
        let mut args = start_args(".", &plain);
        args.gopherbot_binary.clear();
        let err = format!("{:#}", sup.start_robot(&args).unwrap_err());
        assert!(err.contains("gopherbot"), "{err}");
    }

    #[test]
    fn stale_record_does_not_block_start() {
        let tmp = TempDir::new().unwrap();
        let bin = write_script(tmp.path(), "fakebot", "exec sleep 10");
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());
        let stale = ProcessRecord {
            pid: i32::MAX,
            robot_dir: tmp.path().to_path_buf(),
            gopherbot_binary: bin.clone(),
            auth_token: "old".into(),
            log_path: tmp.path().join(LOG_FILE_NAME),
            started_at: "2020-01-01T00:00:00Z".into(),
            command_args: vec![],
        };
        write_state(&state_path(tmp.path()), &stale).unwrap();

        let out = sup.start_robot(&start_args(".", &bin)).unwrap();
        assert_ne!(out["auth_token"], json!("old"));
        sup.stop_robot(&dir_args(".")).unwrap();
    }

    #[test]
    fn stop_without_state_is_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());
        let out = sup.stop_robot(&dir_args(".")).unwrap();
        assert_eq!(out["message"], json!("no state file found"));
    }

    #[test]
    fn stop_of_dead_pid_clears_state() {
        let tmp = TempDir::new().unwrap();
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());
        let rec = ProcessRecord {
            pid: i32::MAX,
            robot_dir: tmp.path().to_path_buf(),
            gopherbot_binary: tmp.path().join("gopherbot"),
            auth_token: "t".into(),
            log_path: tmp.path().join(LOG_FILE_NAME),
            started_at: "2020-01-01T00:00:00Z".into(),
            command_args: vec![],
        };
        write_state(&state_path(tmp.path()), &rec).unwrap();

        let out = sup.stop_robot(&dir_args(".")).unwrap();
        assert_eq!(out["was_running"], json!(false));
        assert_eq!(out["stopped_gracefully"], json!(false));
        assert_eq!(out["force_killed"], json!(false));
        assert!(!state_path(tmp.path()).exists());
    }

    #[test]
    fn status_reports_trimmed_aiport_without_state() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(AIPORT_FILE_NAME), " 40123\n").unwrap();
        let sup = Supervisor::new(tmp.path().to_path_buf(), &Config::default());
        let out = sup.robot_status(&dir_args(".")).unwrap();
        assert_eq!(out["running"], json!(false));
        assert_eq!(out["aiport"], json!("40123"));
        assert!(out.get("pid").is_none());
    }
}
