/// Foreground workload execution: combined output streamed to a log file
/// inside the session directory, wait bounded by the session deadline.
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

use crate::monitor::{reap_expired, signal_group};
use crate::session::Session;

/// Terminal status of the workload. Timeout is a distinguished outcome,
/// not a failure: the session still completes and reports normally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkloadStatus {
    /// The workload exited on its own (exit code may be non-zero).
    Completed { exit_code: Option<i32> },
    /// The session deadline elapsed first; the workload was terminated.
    TimedOut,
    /// Ctrl-C ended the session early; the workload was terminated.
    Interrupted,
    /// The workload never started.
    SpawnFailed { message: String, not_found: bool },
}

/// Run the foreground workload and block until it exits or the session
/// deadline elapses, whichever comes first.
///
/// While waiting, monitors that outlived their own max duration are
/// terminated, so no background process runs past its bound even when the
/// workload is long. On deadline (or Ctrl-C) the workload's process group
/// gets SIGTERM, the grace period, then SIGKILL.
pub async fn run_workload(session: &mut Session, command: &str, args: &[String]) -> WorkloadStatus {
    let log_path = session.dir.workload_log();
    let log_file = match std::fs::File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            let status = WorkloadStatus::SpawnFailed {
                message: format!("failed to create workload log {}: {}", log_path.display(), e),
                not_found: false,
            };
            session.workload = Some(status.clone());
            return status;
        }
    };
    let log_file_stderr = match log_file.try_clone() {
        Ok(f) => f,
        Err(e) => {
            let status = WorkloadStatus::SpawnFailed {
                message: format!("failed to clone workload log handle: {}", e),
                not_found: false,
            };
            session.workload = Some(status.clone());
            return status;
        }
    };

    tracing::info!(
        command = %command,
        args = ?args,
        log = %log_path.display(),
        "starting workload"
    );

    let start = Instant::now();
    let mut child = match Command::new(command)
        .args(args)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_stderr))
        .process_group(0) // New process group for clean kill
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            let not_found = e.kind() == std::io::ErrorKind::NotFound;
            if not_found {
                tracing::error!(command = %command, "workload command not found");
            } else {
                tracing::error!(command = %command, error = %e, "failed to spawn workload");
            }
            let status = WorkloadStatus::SpawnFailed {
                message: e.to_string(),
                not_found,
            };
            session.workload = Some(status.clone());
            return status;
        }
    };

    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, "workload started");

    let mut poll = tokio::time::interval(Duration::from_millis(250));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let status = loop {
        tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(exit) => {
                        let duration = start.elapsed();
                        let output_bytes =
                            std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
                        tracing::info!(
                            exit_code = ?exit.code(),
                            output_bytes,
                            duration_secs = duration.as_secs(),
                            "workload completed"
                        );
                        break WorkloadStatus::Completed { exit_code: exit.code() };
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to wait on workload");
                        break WorkloadStatus::Completed { exit_code: None };
                    }
                }
            }
            _ = tokio::time::sleep_until(session.deadline) => {
                tracing::warn!(
                    duration_secs = session.duration.as_secs(),
                    "session deadline elapsed, terminating workload"
                );
                kill_workload(&mut child, pid, session.grace).await;
                break WorkloadStatus::TimedOut;
            }
            _ = &mut ctrl_c => {
                tracing::warn!("interrupt received, terminating workload");
                kill_workload(&mut child, pid, session.grace).await;
                break WorkloadStatus::Interrupted;
            }
            _ = poll.tick() => {
                reap_expired(&mut session.handles);
            }
        }
    };

    session.workload = Some(status.clone());
    status
}

/// SIGTERM the workload's process group, allow the grace period, SIGKILL
/// whatever survives, and reap the child.
async fn kill_workload(child: &mut Child, pid: u32, grace: Duration) {
    signal_group(pid, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(pid, "workload survived SIGTERM, force-killing");
        signal_group(pid, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;

    fn test_session(root: &std::path::Path, duration_secs: u64) -> Session {
        let mut config = CaptureConfig::default();
        config.session.output_root = root.to_path_buf();
        config.session.duration_secs = duration_secs;
        config.session.grace_secs = 1;
        Session::start(&config).unwrap()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_workload_completes_and_logs_output() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(tmp.path(), 30);

        let status = run_workload(&mut session, "echo", &args(&["scrape", "done"])).await;
        assert_eq!(status, WorkloadStatus::Completed { exit_code: Some(0) });

        let log = std::fs::read_to_string(session.dir.workload_log()).unwrap();
        assert_eq!(log.trim(), "scrape done");
        assert_eq!(session.workload, Some(status));
    }

    #[tokio::test]
    async fn test_workload_captures_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(tmp.path(), 30);

        let status = run_workload(
            &mut session,
            "sh",
            &args(&["-c", "echo out-line; echo err-line >&2"]),
        )
        .await;
        assert_eq!(status, WorkloadStatus::Completed { exit_code: Some(0) });

        let log = std::fs::read_to_string(session.dir.workload_log()).unwrap();
        assert!(log.contains("out-line"));
        assert!(log.contains("err-line"));
    }

    #[tokio::test]
    async fn test_workload_nonzero_exit_is_completed_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(tmp.path(), 30);

        let status = run_workload(&mut session, "sh", &args(&["-c", "exit 42"])).await;
        assert_eq!(status, WorkloadStatus::Completed { exit_code: Some(42) });
    }

    #[tokio::test]
    async fn test_workload_command_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(tmp.path(), 30);

        let status = run_workload(&mut session, "nonexistent-workload-xyz", &[]).await;
        match status {
            WorkloadStatus::SpawnFailed { not_found, .. } => assert!(not_found),
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_workload_times_out_within_duration_plus_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(tmp.path(), 1);

        let start = Instant::now();
        let status = run_workload(
            &mut session,
            "sh",
            &args(&["-c", "echo started; sleep 2; echo finished"]),
        )
        .await;
        let elapsed = start.elapsed();

        assert_eq!(status, WorkloadStatus::TimedOut);
        // duration (1s) + grace (1s) + scheduling slack
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");

        // Past the point where "finished" would have been printed had the
        // process survived the TERM.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let log = std::fs::read_to_string(session.dir.workload_log()).unwrap();
        assert!(log.contains("started"));
        assert!(!log.contains("finished"));
    }

    #[tokio::test]
    async fn test_timeout_reaps_monitor_past_its_own_deadline() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = test_session(tmp.path(), 2);

        let spec = crate::monitor::MonitorSpec {
            name: "short".to_string(),
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            output: std::path::PathBuf::from("short.log"),
            max_duration_secs: 1,
        };
        session.add_monitor(&spec).unwrap();

        let status = run_workload(&mut session, "sleep", &args(&["3"])).await;
        assert_eq!(status, WorkloadStatus::TimedOut);

        // The 1s monitor was reaped mid-run by the poll loop.
        assert!(session.handles[0].termed());
        assert!(session.handles[0].deadline_termed());
    }
}
