use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::monitor::MonitorSpec;
use crate::postprocess::Transform;

/// Top-level configuration loaded from capstan.toml.
///
/// Everything a session needs is enumerated here explicitly: output root,
/// duration, monitor specs, workload command. Nothing is read from the
/// ambient environment or working directory at run time.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CaptureConfig {
    pub session: SessionSettings,
    pub workload: WorkloadConfig,
    #[serde(rename = "monitor")]
    pub monitors: Vec<MonitorSpec>,
    #[serde(rename = "postprocess")]
    pub transforms: Vec<Transform>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub name: String,
    pub output_root: PathBuf,
    pub duration_secs: u64,
    pub grace_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub command: String,
    pub args: Vec<String>,
}

// --- Default implementations ---

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: "capture".to_string(),
            output_root: PathBuf::from("artifacts/networking"),
            duration_secs: 300,
            grace_secs: 5,
        }
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["step1_scraping_unified.py".to_string()],
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Config file is not valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl CaptureConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not an error: defaults describe a usable session
    /// (tcpdump + ss monitors around the unified scraping run).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default_session());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// The built-in session: the monitor set and transforms the original
    /// security/networking runs used.
    pub fn default_session() -> Self {
        Self {
            session: SessionSettings::default(),
            workload: WorkloadConfig::default(),
            monitors: vec![
                MonitorSpec {
                    name: "tcpdump".to_string(),
                    command: "tcpdump".to_string(),
                    args: [
                        "-i", "any", "-n", "tcp", "port", "80", "or", "tcp", "port", "443",
                        "-w", "{output}",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                    output: PathBuf::from("trace_80_443.pcap"),
                    max_duration_secs: 300,
                },
                MonitorSpec {
                    name: "ss".to_string(),
                    command: "sh".to_string(),
                    args: vec![
                        "-c".to_string(),
                        "while true; do date +%s; ss -tan state established; sleep 1; done"
                            .to_string(),
                    ],
                    output: PathBuf::from("ss_log.txt"),
                    max_duration_secs: 300,
                },
            ],
            transforms: vec![
                Transform::SsTimeline {
                    input: PathBuf::from("ss_log.txt"),
                    output: PathBuf::from("ss_timeline.txt"),
                },
                Transform::PcapSummary {
                    input: PathBuf::from("trace_80_443.pcap"),
                    output: PathBuf::from("tshark_summary.txt"),
                },
            ],
        }
    }
}
