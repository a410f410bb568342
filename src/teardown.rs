/// Teardown: the unconditional termination-and-report phase.
///
/// Every monitor still running gets SIGTERM, a grace period, then SIGKILL.
/// Nothing here returns an error: a monitor that resists termination is
/// recorded in the report, not propagated as session failure.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::monitor::{MonitorHandle, MonitorOutcome};
use crate::session::Session;
use crate::session_dir::SessionDir;
use crate::workload::WorkloadStatus;

/// Per-monitor termination outcomes plus the workload's terminal status,
/// persisted as `teardown_report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownReport {
    pub session: String,
    pub generated_at: DateTime<Utc>,
    pub workload: Option<WorkloadStatus>,
    pub monitors: BTreeMap<String, MonitorOutcome>,
}

/// Stop every still-running monitor and report per-monitor outcomes.
///
/// Idempotent: the first call tears down and persists the report; later
/// calls return the cached report and perform no I/O or signaling.
pub async fn stop_session(session: &mut Session) -> TeardownReport {
    if let Some(report) = &session.report {
        return report.clone();
    }

    let mut outcomes = session.outcomes.clone();
    let handles = std::mem::take(&mut session.handles);
    let grace = session.grace;

    for mut handle in handles {
        let name = handle.name.clone();
        let outcome = terminate(&mut handle, grace).await;
        tracing::info!(
            monitor = %name,
            pid = handle.pid(),
            ?outcome,
            output = %handle.output_path.display(),
            "monitor stopped"
        );
        outcomes.insert(name, outcome);
    }

    let report = TeardownReport {
        session: session.name.clone(),
        generated_at: Utc::now(),
        workload: session.workload.clone(),
        monitors: outcomes,
    };

    if let Err(e) = write_report(&session.dir, &report) {
        tracing::warn!(error = %e, "failed to persist teardown report");
    }

    session.report = Some(report.clone());
    report
}

/// Terminate one monitor and classify the outcome.
async fn terminate(handle: &mut MonitorHandle, grace: Duration) -> MonitorOutcome {
    if handle.has_exited() {
        // Deadline reaping may have TERMed it earlier; that still counts as
        // a timeout kill, not a clean exit.
        return if handle.deadline_termed() {
            MonitorOutcome::TimedOutKilled
        } else if handle.termed() {
            MonitorOutcome::ExitedCleanly
        } else {
            MonitorOutcome::AlreadyExited
        };
    }

    let expired = handle.past_deadline() || handle.deadline_termed();
    handle.send_term(expired);

    if handle.wait_with_grace(grace).await {
        if expired {
            MonitorOutcome::TimedOutKilled
        } else {
            MonitorOutcome::ExitedCleanly
        }
    } else {
        tracing::warn!(monitor = %handle.name, "monitor survived SIGTERM, force-killing");
        handle.force_kill().await;
        MonitorOutcome::ForceKilled
    }
}

/// Atomically write the teardown report into the session directory.
///
/// Write to a temp file then rename, so a reader never sees a partial
/// report.
pub fn write_report(dir: &SessionDir, report: &TeardownReport) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    let path = dir.teardown_report();
    let tmp_path = dir
        .root()
        .join(format!(".teardown_report.tmp.{}", std::process::id()));
    std::fs::write(&tmp_path, json.as_bytes())?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Read a previously persisted teardown report.
pub fn read_report(path: &Path) -> Result<TeardownReport, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&contents)
        .map_err(|e| format!("Invalid teardown report {}: {e}", path.display()))
}
