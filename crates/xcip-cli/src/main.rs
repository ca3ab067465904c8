//! XCIP Master - CIP manifest validation and mock traffic CLI
//!
//! ## Commands
//!
//! - `validate`: Check manifests and list every violation
//! - `plan`: Show the traffic plan a manifest produces
//! - `layout`: Show assembly layouts with spare fillers
//! - `run`: Execute plans against a simulated device and report

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use xcip_core::manifest::load_path;
use xcip_core::orchestration::{ProgressEvent, ProgressSink, SilentProgress};
use xcip_core::paths::default_config_file;
use xcip_core::reporting::{render_session_md, write_session_json, write_session_md};
use xcip_core::{
    compute_layout, FsConfigSource, Orchestrator, PlanBuilder, PlanOptions, RunSettings,
    WaveShape, WaveformParams,
};

#[derive(Parser)]
#[command(name = "xcipmaster")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CIP manifest validation and mock traffic orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Manifest file or directory (default: bundled demonstration manifest)
    #[arg(short, long, global = true, env = "XCIP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate manifests and list every violation
    Validate,

    /// Print the traffic plan of each valid manifest
    Plan {
        /// Run duration in milliseconds
        #[arg(long, env = "XCIP_DURATION_MS")]
        duration_ms: Option<u64>,
    },

    /// Print assembly layouts, spare fillers included
    Layout,

    /// Execute traffic against a simulated device
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Run duration in milliseconds
    #[arg(long, env = "XCIP_DURATION_MS")]
    duration_ms: Option<u64>,

    /// Explicit response timeout in milliseconds (overrides the manifest)
    #[arg(long, env = "XCIP_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Retries after an explicit request times out (0-3)
    #[arg(long, env = "XCIP_RETRIES", default_value = "1")]
    retries: u32,

    /// Consecutive missed I/O responses tolerated before a connection times out
    #[arg(long, default_value = "3")]
    miss_threshold: u32,

    /// Write the session report as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write the session report as Markdown
    #[arg(long)]
    markdown: Option<PathBuf>,

    /// Drive a software waveform generator with this shape
    #[arg(long, value_enum)]
    wave: Option<WaveKind>,

    #[arg(long, default_value = "0.0", allow_negative_numbers = true)]
    wave_min: f64,

    #[arg(long, default_value = "10.0", allow_negative_numbers = true)]
    wave_max: f64,

    #[arg(long, default_value = "1000")]
    wave_period_ms: u64,

    /// Fraction of each period a square wave stays high
    #[arg(long, default_value = "0.5")]
    wave_duty: f64,

    /// Also mark explicit requests on the generator
    #[arg(long)]
    mark_explicit: bool,

    /// Suppress console presentation; reports and exit status are unchanged
    #[arg(long, env = "XCIP_TEST_MODE")]
    test_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WaveKind {
    Sine,
    Triangle,
    Square,
}

impl RunArgs {
    fn settings(&self) -> Result<RunSettings> {
        let mut settings = RunSettings::default()
            .with_retries(self.retries)
            .with_miss_threshold(self.miss_threshold)
            .with_explicit_markers(self.mark_explicit);
        if let Some(ms) = self.duration_ms {
            settings = settings.with_duration(Duration::from_millis(ms));
        }
        if let Some(ms) = self.timeout_ms {
            settings = settings.with_timeout(Duration::from_millis(ms));
        }
        if let Some(kind) = self.wave {
            let shape = match kind {
                WaveKind::Sine => WaveShape::Sine,
                WaveKind::Triangle => WaveShape::Triangle,
                WaveKind::Square => WaveShape::Square {
                    duty: self.wave_duty,
                },
            };
            let params = WaveformParams::new(
                shape,
                self.wave_min,
                self.wave_max,
                Duration::from_millis(self.wave_period_ms),
            )
            .context("invalid waveform options")?;
            settings = settings.with_waveform(params);
        }
        settings.validate().context("invalid run settings")?;
        Ok(settings)
    }
}

/// Prints per-event progress to stdout.
struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::ManifestRejected { path, reason } => {
                println!("✗ {}: {}", path.display(), reason)
            }
            ProgressEvent::PlanBuilt {
                path,
                implicit,
                explicit,
            } => println!(
                "▶ {}: {} implicit, {} explicit",
                path.display(),
                implicit,
                explicit
            ),
            ProgressEvent::EventFinished { label, outcome } => println!("  {label}: {outcome}"),
            ProgressEvent::RunFinished {
                path,
                passed,
                failed,
            } => println!("■ {}: {} passed, {} failed", path.display(), passed, failed),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    xcip_core::init_tracing(cli.json, level);

    let config = cli.config.clone().unwrap_or_else(default_config_file);
    let code = match cli.command {
        Commands::Validate => cmd_validate(&config),
        Commands::Plan { duration_ms } => cmd_plan(&config, duration_ms),
        Commands::Layout => cmd_layout(&config),
        Commands::Run(args) => cmd_run(&config, &args).await?,
    };
    std::process::exit(code);
}

/// Validate manifests; returns the exit status.
fn cmd_validate(config: &Path) -> i32 {
    let mut failed = false;
    for result in load_path(&FsConfigSource, config) {
        match result {
            Ok(manifest) => {
                if manifest.is_clean() {
                    println!(
                        "✓ {} ({})",
                        manifest.path.display(),
                        &manifest.digest[..12.min(manifest.digest.len())]
                    );
                } else {
                    failed = true;
                    println!(
                        "! {}: {} violation(s), excluded: {}",
                        manifest.path.display(),
                        manifest.violations.len(),
                        manifest.excluded_connections.join(", ")
                    );
                    for v in &manifest.violations {
                        println!("    - {v}");
                    }
                }
            }
            Err(e) => {
                failed = true;
                println!("✗ {e}");
                for v in e.violations() {
                    println!("    - {v}");
                }
            }
        }
    }
    i32::from(failed)
}

/// Print the traffic plan of every valid manifest.
fn cmd_plan(config: &Path, duration_ms: Option<u64>) -> i32 {
    let builder = PlanBuilder::new(PlanOptions {
        duration: duration_ms.map(Duration::from_millis),
    });
    let mut failed = false;
    for result in load_path(&FsConfigSource, config) {
        let manifest = match result {
            Ok(manifest) => manifest,
            Err(e) => {
                failed = true;
                println!("✗ {e}");
                continue;
            }
        };
        match builder.build(&manifest.config) {
            Ok(plan) => {
                println!(
                    "{} - {} ({} events, {} ms)",
                    manifest.path.display(),
                    plan.device,
                    plan.len(),
                    plan.duration.as_millis()
                );
                for event in plan.events() {
                    println!("  {} {}", event.id, event.label());
                }
            }
            Err(e) => {
                failed = true;
                println!("✗ {}: {e}", manifest.path.display());
            }
        }
    }
    i32::from(failed)
}

/// Print assembly layouts of every valid manifest.
fn cmd_layout(config: &Path) -> i32 {
    let mut failed = false;
    for result in load_path(&FsConfigSource, config) {
        let manifest = match result {
            Ok(manifest) => manifest,
            Err(e) => {
                failed = true;
                println!("✗ {e}");
                continue;
            }
        };
        println!("{}", manifest.path.display());
        for assembly in &manifest.config.assemblies {
            match compute_layout(assembly) {
                Ok(layout) => {
                    println!(
                        "  {} [{}] {} bytes",
                        layout.assembly,
                        layout.direction.as_str(),
                        layout.size_bytes
                    );
                    for entry in &layout.entries {
                        println!(
                            "    {:>4}  {:<24} {:<6} x{}{}",
                            entry.offset_bits,
                            entry.id,
                            entry.data_type.as_str(),
                            entry.length,
                            if entry.spare { "  (spare)" } else { "" }
                        );
                    }
                }
                Err(e) => {
                    failed = true;
                    println!("  ✗ {e}");
                }
            }
        }
    }
    i32::from(failed)
}

/// Run a session; returns the exit status.
async fn cmd_run(config: &Path, args: &RunArgs) -> Result<i32> {
    let settings = args.settings()?;
    let progress: Arc<dyn ProgressSink> = if args.test_mode {
        Arc::new(SilentProgress)
    } else {
        Arc::new(ConsoleProgress)
    };
    let orchestrator = Orchestrator::simulated(Arc::new(FsConfigSource))
        .with_settings(settings)
        .with_progress(progress);

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let session = orchestrator
        .run(config)
        .await
        .context("invalid run settings")?;

    if let Some(path) = &args.output {
        write_session_json(path, &session)?;
    }
    if let Some(path) = &args.markdown {
        write_session_md(path, &session)?;
    }
    if !args.test_mode {
        println!();
        print!("{}", render_session_md(&session));
    }
    Ok(session.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_map_to_settings() {
        let cli = Cli::try_parse_from([
            "xcipmaster",
            "run",
            "--duration-ms",
            "50",
            "--timeout-ms",
            "20",
            "--retries",
            "2",
            "--miss-threshold",
            "5",
            "--wave",
            "square",
            "--wave-duty",
            "0.25",
            "--test-mode",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.test_mode);
        let settings = args.settings().unwrap();
        assert_eq!(settings.duration, Some(Duration::from_millis(50)));
        assert_eq!(settings.timeout_override, Some(Duration::from_millis(20)));
        assert_eq!(settings.explicit_retries, 2);
        assert_eq!(settings.miss_threshold, 5);
        assert_eq!(
            settings.waveform.map(|w| w.shape),
            Some(WaveShape::Square { duty: 0.25 })
        );
    }

    #[test]
    fn too_many_retries_are_rejected() {
        let cli = Cli::try_parse_from(["xcipmaster", "run", "--retries", "7"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.settings().is_err());
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli =
            Cli::try_parse_from(["xcipmaster", "validate", "--config", "conf", "--verbose"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("conf")));
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn bundled_manifest_validates() {
        assert_eq!(cmd_validate(&default_config_file()), 0);
        assert_eq!(cmd_plan(&default_config_file(), None), 0);
        assert_eq!(cmd_layout(&default_config_file()), 0);
    }

    #[tokio::test]
    async fn run_writes_reports() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("report.json");
        let markdown = dir.path().join("report.md");
        let cli = Cli::try_parse_from([
            "xcipmaster",
            "run",
            "--duration-ms",
            "30",
            "--test-mode",
            "--output",
            output.to_str().unwrap(),
            "--markdown",
            markdown.to_str().unwrap(),
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        cmd_run(&default_config_file(), &args).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(output).unwrap()).unwrap();
        let files = json["files_passed"].as_u64().unwrap() + json["files_failed"].as_u64().unwrap();
        assert_eq!(files, 1);
        assert!(std::fs::read_to_string(markdown)
            .unwrap()
            .contains("XCIP Session Report"));
    }
}
