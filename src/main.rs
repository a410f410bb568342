mod config;
mod monitor;
mod orchestrator;
mod postprocess;
mod report;
mod session;
mod session_dir;
mod status;
mod teardown;
mod workload;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::CaptureConfig;

/// Run time-bounded network monitors (packet capture, socket polling,
/// bandwidth tools) around a foreground workload, then tear everything
/// down and collect the artifacts into one timestamped directory.
#[derive(Parser, Debug)]
#[command(name = "capstan", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a capture session.
    Run {
        /// Config file path
        #[arg(short, long, default_value = "capstan.toml")]
        config: PathBuf,

        /// Override session name (directory prefix)
        #[arg(long)]
        name: Option<String>,

        /// Override session duration in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Override the artifact output root
        #[arg(short, long)]
        output_root: Option<PathBuf>,

        /// Validate config and print resolved settings, don't run
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the teardown report of the latest (or a given) session.
    Report {
        /// Session directory (defaults to the latest under the root)
        #[arg(value_name = "SESSION_DIR")]
        dir: Option<PathBuf>,

        /// Artifact root to search for sessions
        #[arg(long, default_value = "artifacts/networking")]
        root: PathBuf,
    },
}

// All concurrency is OS processes; the orchestrator itself stays on one
// runtime thread.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match cli.command {
        Commands::Run {
            config,
            name,
            duration,
            output_root,
            dry_run,
        } => {
            let mut capture = match CaptureConfig::load(&config) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            };
            if let Some(name) = name {
                capture.session.name = name;
            }
            if let Some(duration) = duration {
                capture.session.duration_secs = duration;
            }
            if let Some(output_root) = output_root {
                capture.session.output_root = output_root;
            }

            if dry_run {
                println!("capstan v{}", env!("CARGO_PKG_VERSION"));
                println!("{capture:#?}");
                println!("Dry run mode — config validated, not running.");
                0
            } else {
                orchestrator::run_capture_session(&capture).await
            }
        }
        Commands::Report { dir, root } => match report::handle_report(&root, dir.as_deref()) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{e}");
                1
            }
        },
    };

    std::process::exit(code);
}
