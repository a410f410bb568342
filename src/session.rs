/// Session lifecycle: one output directory, one duration bound, a set of
/// monitors, at most one workload. Created at invocation, torn down
/// unconditionally; the directory outlives the session.
use std::collections::BTreeMap;
use std::fs::File;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CaptureConfig;
use crate::monitor::{spawn_monitor, LaunchError, MonitorHandle, MonitorOutcome, MonitorSpec};
use crate::session_dir::{SessionDir, SetupError};
use crate::status::{SessionState, StatusTracker};
use crate::teardown::TeardownReport;
use crate::workload::WorkloadStatus;

/// A live capture session.
///
/// Owns every process it starts: monitors are held as explicit handles and
/// are either reaped or killed before the session reports completion.
#[derive(Debug)]
pub struct Session {
    /// Directory name, e.g. `capture_20260807-141503`.
    pub name: String,
    pub dir: SessionDir,
    pub duration: Duration,
    pub grace: Duration,
    /// Session-wide deadline, fixed at start. Nothing the session spawned
    /// may run past it by more than the grace period.
    pub deadline: Instant,
    pub(crate) handles: Vec<MonitorHandle>,
    /// Outcomes known before teardown (launch failures).
    pub(crate) outcomes: BTreeMap<String, MonitorOutcome>,
    pub(crate) workload: Option<WorkloadStatus>,
    pub(crate) report: Option<TeardownReport>,
    status: StatusTracker,
    _lock: File,
}

impl Session {
    /// Create the session directory, take its lock, and return a handle in
    /// state `Created` with an empty monitor set.
    ///
    /// The only fatal error path: if the directory or lock cannot be set up
    /// nothing has been spawned yet and the whole session aborts.
    pub fn start(config: &CaptureConfig) -> Result<Self, SetupError> {
        let dir = SessionDir::create(&config.session.output_root, &config.session.name)?;
        let lock = dir.acquire_lock()?;

        let name = dir
            .root()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| config.session.name.clone());

        let duration = Duration::from_secs(config.session.duration_secs);
        let grace = Duration::from_secs(config.session.grace_secs);
        let status = StatusTracker::new(dir.status(), name.clone());

        tracing::info!(
            session = %name,
            dir = %dir.root().display(),
            duration_secs = duration.as_secs(),
            "session created"
        );

        Ok(Self {
            name,
            dir,
            duration,
            grace,
            deadline: Instant::now() + duration,
            handles: Vec::new(),
            outcomes: BTreeMap::new(),
            workload: None,
            report: None,
            status,
            _lock: lock,
        })
    }

    /// Launch one monitor as a detached background process.
    ///
    /// A failed launch is recorded (it appears as `launch_failed` in the
    /// teardown report) and returned for the caller to log; it never stops
    /// the session.
    pub fn add_monitor(&mut self, spec: &MonitorSpec) -> Result<(), LaunchError> {
        match spawn_monitor(spec, &self.dir, self.duration) {
            Ok(handle) => {
                self.handles.push(handle);
                self.sync_monitor_counts();
                Ok(())
            }
            Err(e) => {
                self.outcomes
                    .insert(spec.name.clone(), MonitorOutcome::LaunchFailed);
                self.sync_monitor_counts();
                Err(e)
            }
        }
    }

    /// Advance the state machine, persisting the transition.
    pub fn transition(&mut self, state: SessionState) {
        self.status.transition(state);
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Number of monitors that failed to launch.
    pub fn launch_failures(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| **o == MonitorOutcome::LaunchFailed)
            .count()
    }

    fn sync_monitor_counts(&mut self) {
        let failed = self.launch_failures();
        let running = self.handles.len();
        self.status.set_monitor_counts(running, failed);
    }
}
