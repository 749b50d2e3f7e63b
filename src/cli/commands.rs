//! CLI command implementations.

use crate::config::{Config, CONFIG_FILE_NAME};
use crate::core::artifact::ArtifactStore;
use crate::core::error::{Error, Result};
use crate::core::pipeline::{Pipeline, RunReport};
use crate::core::schedule::DailySchedule;
use crate::core::trigger::{Detection, DetectionReason, Detector, Trigger, TriggerKind};
use chrono::Utc;
use console::style;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Loads the configuration from `path`, or searches upward from the cwd.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) if !path.exists() => Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        }),
        Some(path) => Config::load_from(path),
        None => Config::load_or_default(),
    }
}

fn locate_config(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) if path.exists() => Ok(path.to_path_buf()),
        Some(path) => Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        }),
        None => Config::find_config_file(),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Internal {
        message: format!("Failed to create runtime: {e}"),
    })
}

/// Exit code after Ctrl-C (128 + SIGINT).
const INTERRUPTED_EXIT_CODE: u8 = 130;

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Clamps a report exit code into the range a process can return.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(exit_status(code))
}

/// Initialize configuration.
pub fn init(path: Option<&Path>, force: bool) -> Result<ExitCode> {
    let config_path = path.map_or_else(|| PathBuf::from(CONFIG_FILE_NAME), Path::to_path_buf);

    if config_path.exists() && !force {
        eprintln!(
            "{} Configuration already exists: {}",
            style("!").yellow(),
            config_path.display()
        );
        eprintln!("  Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    std::fs::write(&config_path, Config::default_toml())
        .map_err(|e| Error::io("write config", e))?;

    eprintln!("{} Created {}", style("✓").green(), config_path.display());
    eprintln!("\nNext steps:");
    eprintln!("  1. Review {}", config_path.display());
    eprintln!("  2. Export GITHUB_TOKEN with write access to the repository");
    eprintln!("  3. Run: iptv-refresh run");

    Ok(ExitCode::SUCCESS)
}

/// Run the pipeline once.
pub fn run(
    path: Option<&Path>,
    workspace: &Path,
    trigger: Option<TriggerKind>,
    json: bool,
    quiet: bool,
) -> Result<ExitCode> {
    let config = load_config(path)?;

    let detection = Detector::new()
        .with_override(trigger)
        .with_fallback_branch(config.push.branch.clone())
        .detect()?;

    if !json && !quiet {
        eprintln!(
            "{} Trigger: {} ({})",
            style("•").cyan(),
            style(&detection.trigger).bold(),
            detection.reason
        );
    }

    let pipeline = Pipeline::new(config, workspace)?.with_console(!json && !quiet);
    // Children run in their own process group and miss the terminal's SIGINT
    let report = runtime()?.block_on(async {
        tokio::select! {
            report = pipeline.run(&detection) => Some(report),
            () = interrupted() => None,
        }
    });
    let Some(report) = report else {
        eprintln!("{} Interrupted, run abandoned", style("!").yellow());
        return Ok(ExitCode::from(INTERRUPTED_EXIT_CODE));
    };

    if json {
        let text = serde_json::to_string_pretty(&report).map_err(|e| Error::Internal {
            message: format!("Failed to serialize report: {e}"),
        })?;
        println!("{text}");
    } else {
        print_summary(&report, quiet);
    }

    Ok(exit_code(report.exit_code()))
}

/// Prints the end-of-run summary.
fn print_summary(report: &RunReport, quiet: bool) {
    if let Some(reason) = &report.skipped {
        if !quiet {
            eprintln!("{} Skipped: {reason}", style("•").cyan());
        }
        return;
    }

    match &report.failure {
        None => {
            if quiet {
                return;
            }
            eprintln!();
            eprintln!(
                "{} Run {} succeeded ({} passed, {} skipped) in {}",
                style("✓").green().bold(),
                report.run_id,
                report.passed_count(),
                report.skipped_count(),
                humantime::format_duration(std::time::Duration::from_secs(
                    report.duration.as_secs()
                ))
            );
            if let Some(commit) = &report.commit {
                eprintln!("  Commit: {commit}");
            }
            if let Some(artifact) = &report.artifact {
                eprintln!("  Artifact: {}", artifact.display());
            }
        },
        Some(failure) => {
            eprintln!();
            let step = failure.step.map_or("run", |s| s.name());
            eprintln!(
                "{} Run {} failed at {}",
                style("✗").red().bold(),
                report.run_id,
                style(step).bold()
            );
            eprintln!("  {}", failure.message);
            if let Some(commit) = &report.commit {
                eprintln!("  Local commit kept: {commit}");
            }
        },
    }
}

/// Run the pipeline daily at the configured UTC time.
pub fn watch(path: Option<&Path>, workspace: &Path, now: bool, quiet: bool) -> Result<ExitCode> {
    let config = load_config(path)?;
    let schedule = config.trigger.schedule()?;
    let pipeline = Pipeline::new(config, workspace)?.with_console(!quiet);

    runtime()?.block_on(async {
        let runs = watch_loop(&pipeline, &schedule, now, quiet, interrupted()).await;
        tracing::info!(runs, "Watch stopped");
    });

    Ok(ExitCode::SUCCESS)
}

/// Runs the pipeline at every fire time of `schedule` until `shutdown`
/// resolves. Returns the number of runs that finished.
///
/// `shutdown` also interrupts a run in flight; dropping the run kills its
/// child processes before anything is committed.
async fn watch_loop(
    pipeline: &Pipeline,
    schedule: &DailySchedule,
    now: bool,
    quiet: bool,
    shutdown: impl Future<Output = ()>,
) -> usize {
    let detection = Detection {
        trigger: Trigger::Schedule,
        revision: None,
        reason: DetectionReason::Explicit,
    };
    tokio::pin!(shutdown);

    let mut finished = 0;
    let mut due = now;
    loop {
        if !due {
            let wait = schedule.until_next(Utc::now());
            tracing::info!(
                schedule = %schedule,
                next = %schedule.next_after(Utc::now()).format("%Y-%m-%d %H:%M UTC"),
                "Waiting for next scheduled run"
            );

            tokio::select! {
                () = tokio::time::sleep(wait) => {},
                () = &mut shutdown => {
                    tracing::info!("Interrupted, stopping");
                    return finished;
                },
            }
        }
        due = false;

        // A failed run is reported; the next day still runs
        tokio::select! {
            report = pipeline.run(&detection) => {
                print_summary(&report, quiet);
                finished += 1;
            },
            () = &mut shutdown => {
                tracing::warn!("Interrupted during a run, stopping");
                return finished;
            },
        }
    }
}

/// Validate configuration.
pub fn validate(path: Option<&Path>) -> Result<ExitCode> {
    let loaded = match path {
        Some(_) => load_config(path),
        None => Config::load(),
    };

    match loaded {
        Ok(config) => match config.trigger.schedule() {
            Ok(schedule) => {
                eprintln!("{} Configuration is valid", style("✓").green());
                eprintln!("  Daily run at {schedule}");
                Ok(ExitCode::SUCCESS)
            },
            Err(e) => {
                eprintln!("{} Configuration validation failed: {e}", style("✗").red());
                Ok(exit_code(e.exit_code()))
            },
        },
        Err(Error::ConfigNotFound { path }) => {
            eprintln!(
                "{} Configuration not found: {}",
                style("!").yellow(),
                path.display()
            );
            eprintln!("  Run: iptv-refresh init");
            Ok(ExitCode::FAILURE)
        },
        Err(e) => {
            eprintln!("{} Failed to load configuration: {e}", style("✗").red());
            Ok(exit_code(e.exit_code()))
        },
    }
}

/// Show configuration.
pub fn config(path: Option<&Path>, raw: bool) -> Result<ExitCode> {
    match locate_config(path) {
        Ok(path) => {
            eprintln!("Configuration file: {}", path.display());

            let content = if raw {
                std::fs::read_to_string(&path).map_err(|e| Error::io("read config", e))?
            } else {
                // Effective configuration, defaults filled in
                toml::to_string_pretty(&Config::load_from(&path)?).map_err(|e| {
                    Error::Internal {
                        message: format!("Failed to serialize config: {e}"),
                    }
                })?
            };

            eprintln!();
            std::io::stdout()
                .write_all(content.as_bytes())
                .map_err(|e| Error::io("write output", e))?;

            Ok(ExitCode::SUCCESS)
        },
        Err(Error::ConfigNotFound { .. }) => {
            eprintln!("{} No configuration file found", style("!").yellow());
            eprintln!("  Run: iptv-refresh init");
            Ok(ExitCode::FAILURE)
        },
        Err(e) => Err(e),
    }
}

/// List or prune published artifacts.
pub fn artifacts(path: Option<&Path>, workspace: &Path, prune: bool) -> Result<ExitCode> {
    let config = load_config(path)?;
    let store = ArtifactStore::new(
        config.artifact.resolve_dir(workspace)?,
        config.artifact.name.clone(),
        config.artifact_retention()?,
    );

    let now = Utc::now();
    if prune {
        let removed = store.prune_expired(now)?;
        eprintln!(
            "{} Removed {} expired artifact(s)",
            style("✓").green(),
            removed.len()
        );
    }

    let artifacts = store.list()?;
    if artifacts.is_empty() {
        eprintln!("No artifacts in {}", store.dir().display());
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("{}", style(format!("Artifacts in {}:", store.dir().display())).bold());
    for artifact in &artifacts {
        let state = if artifact.manifest.is_expired(now) {
            style("expired").red()
        } else {
            style("kept").green()
        };
        println!(
            "{}  {}  {} file(s)  {}  {}",
            artifact.manifest.run_id,
            artifact.manifest.created_at.format("%Y-%m-%d %H:%M"),
            artifact.manifest.files.len(),
            state,
            artifact.archive.display()
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Generate shell completions.
pub fn completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    clap_complete::generate(
        shell,
        &mut super::Cli::command(),
        "iptv-refresh",
        &mut std::io::stdout(),
    );
}
