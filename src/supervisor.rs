//! Process supervision for native units.
//!
//! # Spawn Strategies
//!
//! ```text
//!   packaged artifact                    no artifact
//!   ─────────────────                    ───────────
//!   render <id>_run.sh (0755)            argv: [ip netns exec <ns>] cmd args
//!   spawn `sh <id>_run.sh`               spawn argv directly
//!   script writes `$$` to <id>.pid       pid = child id
//!   poll <id>.pid within grace period
//! ```
//!
//! Blocking (`run`) variants render the script without the pid line; the
//! supervisor writes the pid of the child it spawned into `<id>.pid` itself
//! so introspection and `stop` find it while the caller is waiting.
//!
//! Every child is the leader of its own process group, writes stdout and
//! stderr to the instance log (truncated per spawn) and gets a piped stdin.
//!
//! # Termination Escalation
//!
//! For every distinct live pid source:
//!
//! ```text
//!   SIGINT → group ── settle ──► alive? ── SIGINT → pid ──► alive? ── grace ──► alive? ── SIGKILL → group
//!                                 │no                          │no                │no
//!                                 ▼                            ▼                  ▼
//!                               done                         done               done
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::constants::{PID_FILE_EXT, SIGNAL_EXIT_OFFSET};
use crate::error::{Error, Result};
use crate::script::{self, ScriptFamily, ScriptSpec};

/// Interval between reads of a pid file that is not written yet.
const PID_FILE_POLL: Duration = Duration::from_millis(50);

// =============================================================================
// Signals
// =============================================================================

/// Signals the supervisor sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT (graceful interrupt).
    Int,
    /// SIGKILL (force kill).
    Kill,
}

impl Signal {
    #[cfg(unix)]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Int => libc::SIGINT,
            Self::Kill => libc::SIGKILL,
        }
    }

    #[cfg(not(unix))]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Int => 2,
            Self::Kill => 9,
        }
    }
}

/// Delivers signals and checks liveness.
///
/// Kept behind a trait so escalation can be exercised without real processes.
pub trait ProcessSignaller: Send + Sync {
    /// Signals the process group `pid` belongs to.
    fn signal_group(&self, pid: i32, signal: Signal) -> Result<()>;

    /// Signals `pid` alone.
    fn signal(&self, pid: i32, signal: Signal) -> Result<()>;

    /// True if `pid` exists and is not a zombie.
    fn is_alive(&self, pid: i32) -> bool;
}

/// [`ProcessSignaller`] backed by `kill(2)` / `killpg(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcSignaller;

#[cfg(unix)]
impl ProcessSignaller for LibcSignaller {
    fn signal_group(&self, pid: i32, signal: Signal) -> Result<()> {
        if pid <= 1 {
            return Err(Error::SignalFailed {
                pid,
                reason: "refusing to signal init or an invalid pid".to_string(),
            });
        }

        // SAFETY: getpgid has no memory-safety preconditions.
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid < 0 {
            // Already gone.
            return Ok(());
        }
        // SAFETY: getpgid(0) queries our own group.
        let own = unsafe { libc::getpgid(0) };
        if pgid <= 1 || pgid == own {
            // Never take the agent's own group down with the unit.
            return self.signal(pid, signal);
        }

        // SAFETY: killpg is safe with any pgid; failure is reported via errno.
        let ret = unsafe { libc::killpg(pgid, signal.as_i32()) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::SignalFailed {
                    pid,
                    reason: format!("killpg({}) failed: {}", pgid, err),
                });
            }
        }
        Ok(())
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        if pid <= 1 {
            return Err(Error::SignalFailed {
                pid,
                reason: "refusing to signal init or an invalid pid".to_string(),
            });
        }
        // SAFETY: kill() is safe to call with any pid; failure is reported via errno.
        let ret = unsafe { libc::kill(pid, signal.as_i32()) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::SignalFailed {
                    pid,
                    reason: format!("kill failed: {}", err),
                });
            }
        }
        Ok(())
    }

    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        let exists = unsafe { libc::kill(pid, 0) } == 0
            || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        exists && !is_zombie(pid)
    }
}

#[cfg(not(unix))]
impl ProcessSignaller for LibcSignaller {
    fn signal_group(&self, pid: i32, _signal: Signal) -> Result<()> {
        Err(Error::SignalFailed {
            pid,
            reason: "signals not supported on this platform".to_string(),
        })
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        self.signal_group(pid, signal)
    }

    fn is_alive(&self, _pid: i32) -> bool {
        false
    }
}

/// Reads the state field of `/proc/<pid>/stat`. `false` where procfs is absent.
fn is_zombie(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // comm may contain spaces and parens; the state follows the last ')'.
    stat.rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .map(|state| state == "Z" || state == "X")
        .unwrap_or(false)
}

// =============================================================================
// Escalation
// =============================================================================

/// Timing of the termination escalation.
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    /// Wait after the group interrupt.
    pub settle: Duration,
    /// Wait after the direct interrupt.
    pub grace: Duration,
}

/// How a pid source ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was running.
    NotRunning,
    /// Exited after an interrupt.
    Interrupted,
    /// Needed a kill.
    Killed,
}

// =============================================================================
// Launch
// =============================================================================

/// Everything needed to spawn one instance.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub instance_id: &'a str,
    pub command: &'a str,
    pub args: &'a [String],
    /// Extraction directory; scripts and pid files live here.
    pub instance_dir: &'a Path,
    pub log_file: &'a Path,
    /// Namespace the process must run in, when it can be entered.
    pub namespace: Option<&'a str>,
    pub env: HashMap<String, String>,
    /// True if the unit shipped a packaged artifact.
    pub packaged: bool,
}

/// A spawned unit process.
#[derive(Debug)]
pub struct Launched {
    pub pid: u32,
    pub child: Child,
}

/// Spawns, waits for and terminates unit processes.
pub struct Supervisor {
    family: ScriptFamily,
    signaller: Arc<dyn ProcessSignaller>,
    pid_file_grace: Duration,
    policy: EscalationPolicy,
}

impl Supervisor {
    pub fn new(
        family: ScriptFamily,
        signaller: Arc<dyn ProcessSignaller>,
        pid_file_grace: Duration,
        policy: EscalationPolicy,
    ) -> Self {
        Self {
            family,
            signaller,
            pid_file_grace,
            policy,
        }
    }

    pub fn family(&self) -> ScriptFamily {
        self.family
    }

    /// `<instance dir>/<instance>.pid`
    pub fn pid_file(instance_dir: &Path, instance_id: &str) -> PathBuf {
        instance_dir.join(format!("{}.{}", instance_id, PID_FILE_EXT))
    }

    /// Spawns a detached instance and recovers its pid.
    pub async fn start(&self, req: &LaunchRequest<'_>) -> Result<Launched> {
        let pid_file = Self::pid_file(req.instance_dir, req.instance_id);
        remove_if_exists(&pid_file)?;

        if req.packaged {
            let script = self.write_script(req, Some(&pid_file))?;
            let argv = self.family.interpreter(&script);
            let mut child = spawn(req, &argv)?;

            match self.await_pid_file(&pid_file, &mut child).await {
                Ok(pid) => {
                    info!(instance = %req.instance_id, pid, "started from launcher script");
                    Ok(Launched { pid, child })
                }
                Err(e) => {
                    let _ = child.start_kill();
                    Err(Error::execution(req.instance_id, e))
                }
            }
        } else {
            let argv = direct_argv(req);
            let child = spawn(req, &argv)?;
            let pid = child_pid(req.instance_id, &child)?;
            info!(instance = %req.instance_id, pid, "started");
            Ok(Launched { pid, child })
        }
    }

    /// Spawns a blocking instance. The caller waits on the returned child.
    pub async fn run(&self, req: &LaunchRequest<'_>) -> Result<Launched> {
        let pid_file = Self::pid_file(req.instance_dir, req.instance_id);
        remove_if_exists(&pid_file)?;

        let argv = if req.packaged {
            let script = self.write_script(req, None)?;
            self.family.interpreter(&script)
        } else {
            direct_argv(req)
        };

        let child = spawn(req, &argv)?;
        let pid = child_pid(req.instance_id, &child)?;
        std::fs::write(&pid_file, pid.to_string())
            .map_err(|e| Error::execution(req.instance_id, format!("write pid file: {}", e)))?;

        info!(instance = %req.instance_id, pid, "running (blocking)");
        Ok(Launched { pid, child })
    }

    fn write_script(&self, req: &LaunchRequest<'_>, pid_file: Option<&Path>) -> Result<PathBuf> {
        let spec = ScriptSpec {
            command: req.command,
            args: req.args,
            working_dir: Some(req.instance_dir),
            pid_file,
            namespace: req.namespace,
        };
        let text = script::render(self.family, &spec);
        let path = req.instance_dir.join(self.family.file_name(req.instance_id));

        std::fs::write(&path, text)
            .map_err(|e| Error::execution(req.instance_id, format!("write {}: {}", path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }

        debug!(instance = %req.instance_id, script = %path.display(), "launcher script written");
        Ok(path)
    }

    /// Polls the pid file until it holds a pid or the grace period ends.
    async fn await_pid_file(&self, pid_file: &Path, child: &mut Child) -> std::result::Result<u32, String> {
        let deadline = tokio::time::Instant::now() + self.pid_file_grace;
        loop {
            if let Ok(Some(pid)) = read_pid_file(pid_file) {
                return Ok(pid as u32);
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(format!(
                    "launcher exited with code {} before writing {}",
                    exit_code(status),
                    pid_file.display()
                ));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("no pid in {} after {:?}", pid_file.display(), self.pid_file_grace));
            }
            tokio::time::sleep(PID_FILE_POLL).await;
        }
    }

    /// Runs the escalation for one pid.
    pub async fn terminate(&self, pid: i32) -> Termination {
        let s = &self.signaller;
        if !s.is_alive(pid) {
            return Termination::NotRunning;
        }

        debug!(pid, "interrupting process group");
        if let Err(e) = s.signal_group(pid, Signal::Int) {
            warn!(pid, error = %e, "group interrupt failed");
        }
        tokio::time::sleep(self.policy.settle).await;
        if !s.is_alive(pid) {
            return Termination::Interrupted;
        }

        debug!(pid, "interrupting process");
        if let Err(e) = s.signal(pid, Signal::Int) {
            warn!(pid, error = %e, "interrupt failed");
        }
        if !s.is_alive(pid) {
            return Termination::Interrupted;
        }
        tokio::time::sleep(self.policy.grace).await;
        if !s.is_alive(pid) {
            return Termination::Interrupted;
        }

        warn!(pid, grace = ?self.policy.grace, "process ignored interrupts, killing");
        if let Err(e) = s.signal_group(pid, Signal::Kill) {
            warn!(pid, error = %e, "kill failed");
        }
        Termination::Killed
    }

    /// Escalates every distinct pid in `pids`, in order.
    pub async fn terminate_all(&self, pids: &[i32]) -> Vec<(i32, Termination)> {
        let mut seen = Vec::with_capacity(pids.len());
        let mut outcomes = Vec::with_capacity(pids.len());
        for &pid in pids {
            if pid <= 0 || seen.contains(&pid) {
                continue;
            }
            seen.push(pid);
            outcomes.push((pid, self.terminate(pid).await));
        }
        outcomes
    }
}

fn direct_argv(req: &LaunchRequest<'_>) -> Vec<String> {
    let mut argv = Vec::with_capacity(req.args.len() + 5);
    if let Some(ns) = req.namespace {
        argv.extend(["ip", "netns", "exec", ns].map(String::from));
    }
    argv.push(req.command.to_string());
    argv.extend(req.args.iter().cloned());
    argv
}

fn spawn(req: &LaunchRequest<'_>, argv: &[String]) -> Result<Child> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| Error::execution(req.instance_id, "empty command line"))?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(req.log_file)
        .map_err(|e| Error::execution(req.instance_id, format!("open log {}: {}", req.log_file.display(), e)))?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .envs(&req.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    if req.instance_dir.is_dir() {
        cmd.current_dir(req.instance_dir);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    debug!(instance = %req.instance_id, argv = ?argv, "spawning");
    cmd.spawn()
        .map_err(|e| Error::execution(req.instance_id, format!("spawn {}: {}", program, e)))
}

fn child_pid(instance_id: &str, child: &Child) -> Result<u32> {
    child
        .id()
        .ok_or_else(|| Error::execution(instance_id, "process exited before its pid was recorded"))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Reads a pid file. Missing, empty or malformed files yield `None`.
pub fn read_pid_file(path: &Path) -> Result<Option<i32>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => {
            warn!(path = %path.display(), content = %trimmed, "ignoring malformed pid file");
            Ok(None)
        }
    }
}

/// Shell-convention exit code: the code, or 128 + signal number.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return SIGNAL_EXIT_OFFSET + sig;
        }
    }
    -1
}

/// Parses `KEY=VALUE[,KEY=VALUE...]`. The empty string is the empty map.
///
/// Values may contain `=`; empty segments are skipped.
pub fn parse_env(env: &str) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for entry in env.split(',') {
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| Error::InvalidInput(format!("environment entry '{}' has no '='", entry)))?;
        if key.is_empty() {
            return Err(Error::InvalidInput(format!("environment entry '{}' has no key", entry)));
        }
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_empty() {
        assert!(parse_env("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env("A=1,B=two,C=x=y").unwrap();
        assert_eq!(env.len(), 3);
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "two");
        assert_eq!(env["C"], "x=y");
    }

    #[test]
    fn test_parse_env_rejects_missing_separator() {
        assert!(parse_env("A=1,BROKEN").is_err());
        assert!(parse_env("=1").is_err());
    }

    #[test]
    fn test_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pid");
        assert_eq!(read_pid_file(&path).unwrap(), None);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(4242));

        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_signal_convention() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(std::process::ExitStatus::from_raw(9)), 137);
    }

    #[test]
    fn test_pid_file_path() {
        let p = Supervisor::pid_file(Path::new("/a/b"), "i1");
        assert_eq!(p, PathBuf::from("/a/b/i1.pid"));
    }
}
