use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Layout of one session's artifact directory.
///
/// Every artifact a session produces lives under a single timestamped
/// directory (e.g. `artifacts/networking/capture_20260807-141503/`).
/// This struct provides accessors for each well-known path and handles
/// creation. The directory is never shared: a fresh one is created per
/// session and an advisory lock inside it is held for the session lifetime.
#[derive(Debug, Clone)]
pub struct SessionDir {
    root: PathBuf,
}

/// Errors that abort a session before any process starts.
#[derive(Debug)]
pub enum SetupError {
    /// Failed to create the session directory.
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to create or lock the session lock file.
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::CreateDir { path, source } => {
                write!(
                    f,
                    "failed to create session directory {}: {}",
                    path.display(),
                    source
                )
            }
            SetupError::Lock { path, source } => {
                write!(f, "failed to lock session directory via {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::CreateDir { source, .. } => Some(source),
            SetupError::Lock { source, .. } => Some(source),
        }
    }
}

/// Build the directory name for a session: `{name}_{YYYYmmdd-HHMMSS}`.
pub fn session_dir_name(name: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", name, at.format("%Y%m%d-%H%M%S"))
}

impl SessionDir {
    /// Create the timestamped session directory under `output_root`.
    ///
    /// Parents are created as needed. Fails if the directory cannot be
    /// created (permissions, disk full), the one fatal setup condition.
    pub fn create(output_root: &Path, name: &str) -> Result<Self, SetupError> {
        Self::create_at(output_root, name, Utc::now())
    }

    pub(crate) fn create_at(
        output_root: &Path,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<Self, SetupError> {
        let root = output_root.join(session_dir_name(name, at));
        std::fs::create_dir_all(&root).map_err(|e| SetupError::CreateDir {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self { root })
    }

    /// Reference an existing session directory (for `capstan report`).
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The session directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the advisory lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Path to the session status file (state machine snapshots).
    pub fn status(&self) -> PathBuf {
        self.root.join("session.status")
    }

    /// Path to the combined workload output log.
    pub fn workload_log(&self) -> PathBuf {
        self.root.join("workload_stdout.log")
    }

    /// Path to the teardown report.
    pub fn teardown_report(&self) -> PathBuf {
        self.root.join("teardown_report.json")
    }

    /// Resolve a monitor or transform file name against the session directory.
    ///
    /// Relative paths land inside the session directory; absolute paths are
    /// passed through untouched.
    pub fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.root.join(file)
        }
    }

    /// Take the exclusive advisory lock on this directory.
    ///
    /// The returned handle holds the lock until dropped. A second session
    /// (or a stale orchestrator) targeting the same directory fails here
    /// instead of interleaving writes.
    pub fn acquire_lock(&self) -> Result<File, SetupError> {
        let path = self.lock_path();
        let file = File::create(&path).map_err(|e| SetupError::Lock {
            path: path.clone(),
            source: e,
        })?;
        file.try_lock_exclusive()
            .map_err(|e| SetupError::Lock { path, source: e })?;
        Ok(file)
    }
}
