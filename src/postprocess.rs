//! Post-processing: pure file-to-file transforms over session artifacts.
//!
//! Each transform is independent and idempotent. A missing input or an
//! absent external tool logs a warning and skips that transform only;
//! the rest of the list still runs.

use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::session_dir::SessionDir;

/// One transform, usually a `[[postprocess]]` table in capstan.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Strip terminal control sequences and carriage-return overdraw from a
    /// captured transcript (e.g. an nload recording), normalizing line
    /// endings.
    StripAnsi { input: PathBuf, output: PathBuf },
    /// Summarize an `ss` polling log (epoch-second marker lines followed by
    /// one line per socket) into a connections-vs-time table.
    SsTimeline { input: PathBuf, output: PathBuf },
    /// Summarize a pcap into a human-readable protocol report via tshark.
    PcapSummary { input: PathBuf, output: PathBuf },
    /// Compress a bulky capture with zstd, keeping the original.
    Compress {
        input: PathBuf,
        #[serde(default = "default_compress_level")]
        level: i32,
    },
}

fn default_compress_level() -> i32 {
    3
}

/// Errors from a single transform. Logged and skipped, never propagated.
#[derive(Debug)]
pub enum TransformError {
    /// Input artifact was never produced (monitor absent or crashed early).
    MissingInput { path: PathBuf },
    Io { source: std::io::Error },
    /// External summarizer is not installed.
    ToolMissing { command: String },
    /// External summarizer ran but failed.
    ToolFailed { command: String, code: Option<i32> },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::MissingInput { path } => {
                write!(f, "input artifact {} does not exist", path.display())
            }
            TransformError::Io { source } => write!(f, "I/O error: {}", source),
            TransformError::ToolMissing { command } => {
                write!(f, "summarizer `{}` is not installed", command)
            }
            TransformError::ToolFailed { command, code } => {
                write!(f, "summarizer `{}` failed with code {:?}", command, code)
            }
        }
    }
}

impl std::error::Error for TransformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransformError::Io { source } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransformError {
    fn from(source: std::io::Error) -> Self {
        TransformError::Io { source }
    }
}

/// Apply every transform, logging and skipping failures.
pub fn apply_transforms(dir: &SessionDir, transforms: &[Transform]) {
    for transform in transforms {
        match run_transform(dir, transform) {
            Ok(()) => tracing::debug!(?transform, "transform applied"),
            Err(e) => {
                tracing::warn!(?transform, error = %e, "transform skipped");
            }
        }
    }
}

/// Run one transform with paths resolved against the session directory.
pub fn run_transform(dir: &SessionDir, transform: &Transform) -> Result<(), TransformError> {
    match transform {
        Transform::StripAnsi { input, output } => {
            strip_ansi_file(&dir.resolve(input), &dir.resolve(output))
        }
        Transform::SsTimeline { input, output } => {
            ss_timeline_file(&dir.resolve(input), &dir.resolve(output))
        }
        Transform::PcapSummary { input, output } => {
            pcap_summary_with("tshark", &dir.resolve(input), &dir.resolve(output))
        }
        Transform::Compress { input, level } => compress_file(&dir.resolve(input), *level),
    }
}

static CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;:?]*[ -/]*[@-~]").unwrap());
static OSC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());
static ESC_OTHER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b[@-_]?").unwrap());

/// Remove terminal control sequences and resolve carriage-return overdraw.
///
/// A terminal transcript repaints lines with `\r`; only the text after the
/// last `\r` on each line survives on screen, so only that survives here.
pub fn strip_ansi_text(text: &str) -> String {
    let text = CSI.replace_all(text, "");
    let text = OSC.replace_all(&text, "");
    let text = ESC_OTHER.replace_all(&text, "");

    let mut out = String::with_capacity(text.len());
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        let visible = line.rsplit('\r').next().unwrap_or(line);
        let cleaned: String = visible.chars().filter(|c| !c.is_control() || *c == '\t').collect();
        out.push_str(&cleaned);
        out.push('\n');
    }
    // split('\n') yields one segment more than there are newlines.
    out.pop();
    out
}

fn strip_ansi_file(input: &Path, output: &Path) -> Result<(), TransformError> {
    if !input.is_file() {
        return Err(TransformError::MissingInput {
            path: input.to_path_buf(),
        });
    }
    let raw = std::fs::read(input)?;
    let text = String::from_utf8_lossy(&raw);
    std::fs::write(output, strip_ansi_text(&text))?;
    Ok(())
}

static EPOCH_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{10}$").unwrap());

/// Parse an ss polling log into `(epoch, connection count)` samples.
///
/// The logger writes an epoch-seconds line, then one line per socket, then
/// the next epoch line. Lines between markers are counted.
pub fn parse_ss_log(text: &str) -> Vec<(u64, usize)> {
    let mut samples = Vec::new();
    let mut current_ts: Option<u64> = None;
    let mut count = 0usize;

    for line in text.lines() {
        let line = line.trim();
        if EPOCH_MARKER.is_match(line) {
            if let Some(ts) = current_ts {
                samples.push((ts, count));
            }
            current_ts = line.parse().ok();
            count = 0;
        } else if !line.is_empty() {
            count += 1;
        }
    }
    if let Some(ts) = current_ts {
        samples.push((ts, count));
    }
    samples
}

fn ss_timeline_file(input: &Path, output: &Path) -> Result<(), TransformError> {
    if !input.is_file() {
        return Err(TransformError::MissingInput {
            path: input.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(input)?;
    let samples = parse_ss_log(&text);

    let mut out = String::from("# t_rel_s\tconnections\n");
    let t0 = samples.first().map(|(ts, _)| *ts).unwrap_or(0);
    for (ts, count) in &samples {
        out.push_str(&format!("{}\t{}\n", ts.saturating_sub(t0), count));
    }
    let peak = samples.iter().map(|(_, c)| *c).max().unwrap_or(0);
    let mean = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|(_, c)| *c as f64).sum::<f64>() / samples.len() as f64
    };
    out.push_str(&format!(
        "# samples={} peak={} mean={:.2}\n",
        samples.len(),
        peak,
        mean
    ));

    std::fs::write(output, out)?;
    Ok(())
}

/// Summarize a pcap with an external tool (tshark), writing its stdout.
fn pcap_summary_with(tool: &str, input: &Path, output: &Path) -> Result<(), TransformError> {
    if !input.is_file() {
        return Err(TransformError::MissingInput {
            path: input.to_path_buf(),
        });
    }
    let result = std::process::Command::new(tool)
        .arg("-r")
        .arg(input)
        .args(["-q", "-z", "io,phs"])
        .output();
    let out = match result {
        Ok(out) => out,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransformError::ToolMissing {
                command: tool.to_string(),
            });
        }
        Err(e) => return Err(TransformError::Io { source: e }),
    };
    if !out.status.success() {
        return Err(TransformError::ToolFailed {
            command: tool.to_string(),
            code: out.status.code(),
        });
    }
    std::fs::write(output, out.stdout)?;
    Ok(())
}

/// Compress a capture with zstd, writing `{input}.zst` alongside it.
///
/// The original is kept: artifacts are referenced, never mutated.
fn compress_file(input: &Path, level: i32) -> Result<(), TransformError> {
    if !input.is_file() {
        return Err(TransformError::MissingInput {
            path: input.to_path_buf(),
        });
    }
    let ext = match input.extension() {
        Some(e) => format!("{}.zst", e.to_string_lossy()),
        None => "zst".to_string(),
    };
    let dest = input.with_extension(ext);
    let data = std::fs::read(input)?;
    let compressed = zstd::encode_all(data.as_slice(), level)?;
    std::fs::write(&dest, compressed)?;
    Ok(())
}
