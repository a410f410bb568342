use std::path::{Path, PathBuf};

use crate::monitor::MonitorOutcome;
use crate::session_dir::SessionDir;
use crate::teardown::read_report;
use crate::workload::WorkloadStatus;

/// Handle `capstan report`: print the teardown report of the latest (or a
/// named) session directory.
pub fn handle_report(root: &Path, dir: Option<&Path>) -> Result<(), String> {
    let session_root = match dir {
        Some(d) => d.to_path_buf(),
        None => latest_session_dir(root)?,
    };
    let report_path = SessionDir::open(&session_root).teardown_report();
    let report = read_report(&report_path)?;

    println!("Session:   {}", report.session);
    println!("Generated: {}", report.generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Workload:  {}", workload_label(report.workload.as_ref()));
    println!();
    if report.monitors.is_empty() {
        println!("No monitors were configured.");
        return Ok(());
    }
    let width = report
        .monitors
        .keys()
        .map(|n| n.len())
        .max()
        .unwrap_or(0)
        .max("monitor".len());
    println!("{:width$} | outcome", "monitor");
    println!("{}-+---------", "-".repeat(width));
    for (name, outcome) in &report.monitors {
        println!("{name:width$} | {}", outcome_label(*outcome));
    }
    Ok(())
}

/// Find the most recent session directory under `root`.
///
/// Directory names embed a `YYYYmmdd-HHMMSS` timestamp, so lexicographic
/// order is chronological order.
pub fn latest_session_dir(root: &Path) -> Result<PathBuf, String> {
    let pattern = format!("{}/*_*", root.display());
    let mut dirs: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| format!("Invalid artifact root {}: {e}", root.display()))?
        .filter_map(Result::ok)
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs.pop()
        .ok_or_else(|| format!("No session directories under {}", root.display()))
}

fn outcome_label(outcome: MonitorOutcome) -> &'static str {
    match outcome {
        MonitorOutcome::ExitedCleanly => "exited cleanly",
        MonitorOutcome::TimedOutKilled => "timed out, killed",
        MonitorOutcome::ForceKilled => "force-killed",
        MonitorOutcome::AlreadyExited => "already exited",
        MonitorOutcome::LaunchFailed => "launch failed",
    }
}

fn workload_label(status: Option<&WorkloadStatus>) -> String {
    match status {
        None => "not run".to_string(),
        Some(WorkloadStatus::Completed { exit_code: Some(0) }) => "completed".to_string(),
        Some(WorkloadStatus::Completed { exit_code: Some(code) }) => {
            format!("completed with exit code {code}")
        }
        Some(WorkloadStatus::Completed { exit_code: None }) => {
            "completed (killed by signal)".to_string()
        }
        Some(WorkloadStatus::TimedOut) => "timed out".to_string(),
        Some(WorkloadStatus::Interrupted) => "interrupted".to_string(),
        Some(WorkloadStatus::SpawnFailed { message, .. }) => {
            format!("failed to start: {message}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::teardown::{write_report, TeardownReport};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn write_session(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let mut monitors = BTreeMap::new();
        monitors.insert("tcpdump".to_string(), MonitorOutcome::ExitedCleanly);
        monitors.insert("ghost".to_string(), MonitorOutcome::LaunchFailed);
        let report = TeardownReport {
            session: name.to_string(),
            generated_at: Utc::now(),
            workload: Some(WorkloadStatus::Completed { exit_code: Some(0) }),
            monitors,
        };
        write_report(&SessionDir::open(&dir), &report).unwrap();
        dir
    }

    #[test]
    fn test_latest_session_dir_picks_newest_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("capture_20260806-120000")).unwrap();
        std::fs::create_dir_all(tmp.path().join("capture_20260807-090000")).unwrap();
        std::fs::create_dir_all(tmp.path().join("capture_20260807-093000")).unwrap();

        let latest = latest_session_dir(tmp.path()).unwrap();
        assert_eq!(latest, tmp.path().join("capture_20260807-093000"));
    }

    #[test]
    fn test_latest_session_dir_ignores_plain_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("notes_1.txt"), "x").unwrap();
        std::fs::create_dir_all(tmp.path().join("capture_20260807-090000")).unwrap();

        let latest = latest_session_dir(tmp.path()).unwrap();
        assert_eq!(latest, tmp.path().join("capture_20260807-090000"));
    }

    #[test]
    fn test_latest_session_dir_empty_root() {
        let tmp = tempfile::tempdir().unwrap();
        let err = latest_session_dir(tmp.path()).unwrap_err();
        assert!(err.contains("No session directories"));
    }

    #[test]
    fn test_handle_report_named_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = write_session(tmp.path(), "capture_20260807-090000");
        handle_report(tmp.path(), Some(&dir)).unwrap();
    }

    #[test]
    fn test_handle_report_latest() {
        let tmp = tempfile::tempdir().unwrap();
        write_session(tmp.path(), "capture_20260806-120000");
        write_session(tmp.path(), "capture_20260807-090000");
        handle_report(tmp.path(), None).unwrap();
    }

    #[test]
    fn test_handle_report_missing_report_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("capture_20260807-090000")).unwrap();
        let err = handle_report(tmp.path(), None).unwrap_err();
        assert!(err.contains("Failed to read"));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(MonitorOutcome::ForceKilled), "force-killed");
        assert_eq!(outcome_label(MonitorOutcome::LaunchFailed), "launch failed");
    }

    #[test]
    fn test_workload_labels() {
        assert_eq!(workload_label(None), "not run");
        assert_eq!(
            workload_label(Some(&WorkloadStatus::TimedOut)),
            "timed out"
        );
        assert_eq!(
            workload_label(Some(&WorkloadStatus::Completed { exit_code: Some(3) })),
            "completed with exit code 3"
        );
    }
}
