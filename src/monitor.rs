/// Background monitor processes: spawn detached, bound to the session's
/// duration, output captured to a file inside the session directory.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

use crate::session_dir::SessionDir;

/// One monitor's launch description, usually a `[[monitor]]` table in
/// capstan.toml.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSpec {
    /// Monitor name, used as the key in the teardown report.
    pub name: String,
    /// Binary to run (e.g. `tcpdump`).
    pub command: String,
    /// Arguments; `{output}` is replaced with the resolved output path.
    #[serde(default)]
    pub args: Vec<String>,
    /// Output file, relative to the session directory.
    pub output: PathBuf,
    /// Max lifetime in seconds; clamped to the session duration.
    pub max_duration_secs: u64,
}

/// Termination outcome for one monitor, as persisted in the teardown report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorOutcome {
    /// Exited on the stop signal within the grace period.
    ExitedCleanly,
    /// Hit its max lifetime (or the session deadline) and was terminated.
    TimedOutKilled,
    /// Survived the grace period and had to be SIGKILLed.
    ForceKilled,
    /// Was already gone when teardown looked at it.
    AlreadyExited,
    /// The underlying tool was missing or failed to spawn.
    LaunchFailed,
}

/// Errors from launching a monitor. Non-fatal: the session continues
/// without the monitor and records its absence.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to create the monitor's output file.
    OutputFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the monitor process (tool missing, permissions).
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

impl LaunchError {
    /// True when the failure is a missing binary rather than e.g. EPERM.
    pub fn is_tool_missing(&self) -> bool {
        matches!(
            self,
            LaunchError::Spawn { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::OutputFile { path, source } => {
                write!(
                    f,
                    "failed to create monitor output file {}: {}",
                    path.display(),
                    source
                )
            }
            LaunchError::Spawn { command, source } => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    write!(f, "monitor tool `{}` is not installed", command)
                } else {
                    write!(f, "failed to spawn monitor `{}`: {}", command, source)
                }
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::OutputFile { source, .. } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
        }
    }
}

/// A running monitor owned by its session.
#[derive(Debug)]
pub struct MonitorHandle {
    pub name: String,
    pub output_path: PathBuf,
    child: Child,
    pid: u32,
    spawned_at: Instant,
    max_duration: Duration,
    termed: bool,
    expired: bool,
}

/// Build the monitor arguments, replacing `{output}` placeholders with the
/// resolved output path.
fn build_args(spec: &MonitorSpec, output_path: &Path) -> Vec<String> {
    let output = output_path.to_string_lossy();
    spec.args
        .iter()
        .map(|arg| arg.replace("{output}", &output))
        .collect()
}

/// Spawn a monitor as a detached background process.
///
/// stdout and stderr both stream to the monitor's output file (tools like
/// the ss polling loop write to stdout; tcpdump writes its own file via
/// `{output}` and only chatters on stderr). The process gets its own group
/// so teardown can kill helpers it forked along with it.
pub fn spawn_monitor(
    spec: &MonitorSpec,
    dir: &SessionDir,
    session_duration: Duration,
) -> Result<MonitorHandle, LaunchError> {
    let output_path = dir.resolve(&spec.output);
    let output_file = std::fs::File::create(&output_path).map_err(|e| LaunchError::OutputFile {
        path: output_path.clone(),
        source: e,
    })?;
    let output_file_stderr = output_file.try_clone().map_err(|e| LaunchError::OutputFile {
        path: output_path.clone(),
        source: e,
    })?;

    let args = build_args(spec, &output_path);
    let max_duration = Duration::from_secs(spec.max_duration_secs).min(session_duration);

    let child = Command::new(&spec.command)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(output_file))
        .stderr(Stdio::from(output_file_stderr))
        .process_group(0) // New process group for clean kill
        .spawn()
        .map_err(|e| LaunchError::Spawn {
            command: spec.command.clone(),
            source: e,
        })?;

    let pid = child.id().unwrap_or(0);
    tracing::info!(
        monitor = %spec.name,
        command = %spec.command,
        pid,
        max_duration_secs = max_duration.as_secs(),
        output = %output_path.display(),
        "monitor started"
    );

    Ok(MonitorHandle {
        name: spec.name.clone(),
        output_path,
        child,
        pid,
        spawned_at: Instant::now(),
        max_duration,
        termed: false,
        expired: false,
    })
}

impl MonitorHandle {
    /// Process id at spawn time (the process group id, via `process_group(0)`).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether this monitor's own max lifetime has elapsed.
    pub fn past_deadline(&self) -> bool {
        self.spawned_at.elapsed() >= self.max_duration
    }

    /// Whether the TERM sent to this monitor was deadline-driven.
    pub(crate) fn deadline_termed(&self) -> bool {
        self.expired
    }

    /// Whether a TERM has been sent already.
    pub(crate) fn termed(&self) -> bool {
        self.termed
    }

    /// Non-blocking exit check.
    pub fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(status) => status.is_some(),
            // Equivalent to "can no longer be waited on".
            Err(_) => true,
        }
    }

    /// Send SIGTERM to the monitor's process group.
    ///
    /// `expired` marks a deadline-driven kill; it decides between the
    /// `TimedOutKilled` and `ExitedCleanly` outcomes later.
    pub(crate) fn send_term(&mut self, expired: bool) {
        self.termed = true;
        self.expired = self.expired || expired;
        signal_group(self.pid, Signal::SIGTERM);
    }

    /// Wait up to `grace` for the monitor to exit. Returns true on exit.
    pub(crate) async fn wait_with_grace(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.child.wait())
            .await
            .is_ok()
    }

    /// SIGKILL the process group and reap the child.
    pub(crate) async fn force_kill(&mut self) {
        signal_group(self.pid, Signal::SIGKILL);
        let _ = self.child.wait().await;
    }
}

/// TERM every monitor whose own max lifetime has elapsed.
///
/// Called while the workload is still running; complements the session-wide
/// deadline so no monitor runs past its configured bound.
pub fn reap_expired(handles: &mut [MonitorHandle]) {
    for handle in handles.iter_mut() {
        if handle.termed || handle.has_exited() {
            continue;
        }
        if handle.past_deadline() {
            tracing::info!(monitor = %handle.name, "monitor max duration elapsed, terminating");
            handle.send_term(true);
        }
    }
}

/// Signal an entire process group, ignoring already-gone targets.
pub(crate) fn signal_group(pid: u32, signal: Signal) {
    if pid == 0 {
        return;
    }
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(pid, ?signal, error = %e, "failed to signal monitor group");
        }
    }
}
