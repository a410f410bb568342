/// Status file: writes `session.status` as JSON on every state transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Session lifecycle states.
///
/// `MonitorsStarting` may transition to `WorkloadRunning` even if some
/// monitor launches failed (degraded mode, recorded). `Stopping` is always
/// reached regardless of the workload outcome. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    MonitorsStarting,
    WorkloadRunning,
    Stopping,
    Completed,
}

/// The JSON payload written to `session.status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub session: String,
    pub state: SessionState,
    pub session_start: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub monitors_running: usize,
    pub monitors_failed: usize,
}

/// Errors from writing the status file.
#[derive(Debug)]
pub enum StatusError {
    Serialize { source: serde_json::Error },
    Write { path: PathBuf, source: std::io::Error },
    Rename { from: PathBuf, to: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => {
                write!(f, "failed to serialize status: {}", source)
            }
            StatusError::Write { path, source } => {
                write!(f, "failed to write status {}: {}", path.display(), source)
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename status {} -> {}: {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

/// Manages the status file lifecycle.
#[derive(Debug)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Create a new StatusFile writer for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".session.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }
}

/// Tracks the current state and writes the status file on each transition.
///
/// Status writes are best-effort: a failed write is logged and the session
/// carries on. Observability must never take a session down.
#[derive(Debug)]
pub struct StatusTracker {
    file: StatusFile,
    session: String,
    state: SessionState,
    session_start: DateTime<Utc>,
    monitors_running: usize,
    monitors_failed: usize,
}

impl StatusTracker {
    /// Create a new tracker in the `Created` state and persist it.
    pub fn new(status_path: PathBuf, session: String) -> Self {
        let mut tracker = Self {
            file: StatusFile::new(status_path),
            session,
            state: SessionState::Created,
            session_start: Utc::now(),
            monitors_running: 0,
            monitors_failed: 0,
        };
        tracker.write();
        tracker
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transition to a new state and persist.
    pub fn transition(&mut self, state: SessionState) {
        tracing::debug!(from = ?self.state, to = ?state, "session state transition");
        self.state = state;
        self.write();
    }

    /// Record monitor counts (running / failed-to-launch) and persist.
    pub fn set_monitor_counts(&mut self, running: usize, failed: usize) {
        self.monitors_running = running;
        self.monitors_failed = failed;
        self.write();
    }

    fn write(&mut self) {
        let data = StatusData {
            pid: std::process::id(),
            session: self.session.clone(),
            state: self.state,
            session_start: self.session_start,
            last_update: Utc::now(),
            monitors_running: self.monitors_running,
            monitors_failed: self.monitors_failed,
        };
        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write session status");
        }
    }
}
