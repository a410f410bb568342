/// Drives one capture session end to end:
/// monitors start before the workload, teardown runs unconditionally after
/// the workload reaches a terminal status, post-processing never affects
/// the exit code.
use crate::config::CaptureConfig;
use crate::monitor::MonitorOutcome;
use crate::postprocess::apply_transforms;
use crate::session::Session;
use crate::status::SessionState;
use crate::teardown::stop_session;
use crate::workload::{run_workload, WorkloadStatus};

/// Run a full session and return the process exit code.
///
/// 0: session completed (monitor degradations and non-zero workload exits
/// included). 1: setup failed before any process started. 127: the workload
/// command was not found. 130: interrupted.
pub async fn run_capture_session(config: &CaptureConfig) -> i32 {
    let mut session = match Session::start(config) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "session setup failed");
            return 1;
        }
    };

    session.transition(SessionState::MonitorsStarting);
    for spec in &config.monitors {
        if let Err(e) = session.add_monitor(spec) {
            // Degraded mode: recorded in the teardown report, the workload
            // still runs.
            if e.is_tool_missing() {
                tracing::warn!(monitor = %spec.name, error = %e, "monitor tool missing, continuing");
            } else {
                tracing::error!(monitor = %spec.name, error = %e, "monitor launch failed, continuing");
            }
        }
    }

    session.transition(SessionState::WorkloadRunning);
    let workload = run_workload(&mut session, &config.workload.command, &config.workload.args).await;

    session.transition(SessionState::Stopping);
    let report = stop_session(&mut session).await;

    apply_transforms(&session.dir, &config.transforms);

    session.transition(SessionState::Completed);

    let degraded = report
        .monitors
        .values()
        .filter(|o| **o == MonitorOutcome::LaunchFailed)
        .count();
    tracing::info!(
        session = %session.name,
        state = ?session.state(),
        dir = %session.dir.root().display(),
        monitors = report.monitors.len(),
        monitors_failed = degraded,
        workload = ?workload,
        "session completed"
    );

    match workload {
        WorkloadStatus::SpawnFailed { not_found: true, .. } => 127,
        WorkloadStatus::SpawnFailed { .. } => 1,
        WorkloadStatus::Interrupted => 130,
        WorkloadStatus::Completed { .. } | WorkloadStatus::TimedOut => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorSpec;
    use crate::postprocess::Transform;
    use crate::teardown::read_report;
    use std::path::{Path, PathBuf};

    fn base_config(root: &Path, duration_secs: u64) -> CaptureConfig {
        let mut config = CaptureConfig::default();
        config.session.output_root = root.to_path_buf();
        config.session.duration_secs = duration_secs;
        config.session.grace_secs = 1;
        config.workload.command = "echo".to_string();
        config.workload.args = vec!["workload ran".to_string()];
        config.monitors.clear();
        config.transforms.clear();
        config
    }

    fn monitor(name: &str, command: &str, args: &[&str]) -> MonitorSpec {
        MonitorSpec {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            output: PathBuf::from(format!("{name}.log")),
            max_duration_secs: 30,
        }
    }

    fn session_dir(root: &Path) -> PathBuf {
        let mut dirs: Vec<_> = std::fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs.pop().expect("no session directory created")
    }

    #[tokio::test]
    async fn test_full_session_with_degraded_monitor() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = base_config(tmp.path(), 30);
        config.monitors.push(monitor("live", "sleep", &["30"]));
        config
            .monitors
            .push(monitor("ghost", "nonexistent-binary-xyz", &[]));

        let code = run_capture_session(&config).await;
        assert_eq!(code, 0);

        let dir = session_dir(tmp.path());
        let log = std::fs::read_to_string(dir.join("workload_stdout.log")).unwrap();
        assert_eq!(log.trim(), "workload ran");

        let report = read_report(&dir.join("teardown_report.json")).unwrap();
        assert_eq!(report.monitors["ghost"], MonitorOutcome::LaunchFailed);
        assert_eq!(report.monitors["live"], MonitorOutcome::ExitedCleanly);
        assert_eq!(
            report.workload,
            Some(WorkloadStatus::Completed { exit_code: Some(0) })
        );

        let status = std::fs::read_to_string(dir.join("session.status")).unwrap();
        assert!(status.contains("\"completed\""));
    }

    #[tokio::test]
    async fn test_timeout_scenario() {
        // Scaled-down version of the canonical scenario: a session shorter
        // than its workload, one long-running monitor. The workload times
        // out, the monitor is killed at the deadline, both are reported.
        let tmp = tempfile::tempdir().unwrap();
        let mut config = base_config(tmp.path(), 1);
        config.workload.command = "sleep".to_string();
        config.workload.args = vec!["10".to_string()];
        let mut m = monitor("looper", "sh", &["-c", "while true; do echo tick; sleep 1; done"]);
        m.max_duration_secs = 1;
        config.monitors.push(m);

        let code = run_capture_session(&config).await;
        assert_eq!(code, 0);

        let dir = session_dir(tmp.path());
        let report = read_report(&dir.join("teardown_report.json")).unwrap();
        assert_eq!(report.workload, Some(WorkloadStatus::TimedOut));
        assert!(matches!(
            report.monitors["looper"],
            MonitorOutcome::TimedOutKilled | MonitorOutcome::ForceKilled
        ));
    }

    #[tokio::test]
    async fn test_workload_not_found_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = base_config(tmp.path(), 30);
        config.workload.command = "nonexistent-workload-xyz".to_string();
        config.workload.args.clear();
        config.monitors.push(monitor("live", "sleep", &["30"]));

        let code = run_capture_session(&config).await;
        assert_eq!(code, 127);

        // Teardown still ran: the monitor was stopped and reported.
        let dir = session_dir(tmp.path());
        let report = read_report(&dir.join("teardown_report.json")).unwrap();
        assert_eq!(report.monitors["live"], MonitorOutcome::ExitedCleanly);
    }

    #[tokio::test]
    async fn test_setup_failure_exit_code() {
        let mut config = CaptureConfig::default();
        config.session.output_root = PathBuf::from("/proc/no-such-root");
        let code = run_capture_session(&config).await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_workload_failure_still_completes_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = base_config(tmp.path(), 30);
        config.workload.command = "sh".to_string();
        config.workload.args = vec!["-c".to_string(), "exit 3".to_string()];

        let code = run_capture_session(&config).await;
        assert_eq!(code, 0);

        let dir = session_dir(tmp.path());
        let report = read_report(&dir.join("teardown_report.json")).unwrap();
        assert_eq!(
            report.workload,
            Some(WorkloadStatus::Completed { exit_code: Some(3) })
        );
    }

    #[tokio::test]
    async fn test_failed_transform_does_not_change_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = base_config(tmp.path(), 30);
        config.transforms.push(Transform::SsTimeline {
            input: PathBuf::from("never_written.txt"),
            output: PathBuf::from("timeline.txt"),
        });

        let code = run_capture_session(&config).await;
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_transforms_run_on_monitor_output() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = base_config(tmp.path(), 30);
        config.monitors.push(monitor(
            "ss",
            "sh",
            &["-c", "date +%s; echo 'ESTAB 0 0 1.2.3.4:443'"],
        ));
        config.transforms.push(Transform::SsTimeline {
            input: PathBuf::from("ss.log"),
            output: PathBuf::from("ss_timeline.txt"),
        });
        // Give the one-shot monitor time to write before the workload ends.
        config.workload.command = "sleep".to_string();
        config.workload.args = vec!["1".to_string()];

        let code = run_capture_session(&config).await;
        assert_eq!(code, 0);

        let dir = session_dir(tmp.path());
        let timeline = std::fs::read_to_string(dir.join("ss_timeline.txt")).unwrap();
        assert!(timeline.contains("# samples=1 peak=1 mean=1.00"));
    }
}
