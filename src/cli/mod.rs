//! Command-line interface for iptv-refresh.
//!
//! This module provides the `iptv-refresh` CLI with subcommands for:
//! - `init`: Write a default configuration
//! - `run`: Run the pipeline once
//! - `watch`: Run the pipeline on its daily schedule
//! - `validate`: Validate configuration
//! - `config`: Show the configuration in effect
//! - `artifacts`: List or prune published artifacts
//! - `completions`: Generate shell completions

mod commands;

use crate::core::error::Result;
use crate::core::trigger::TriggerKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Scheduled refresh of IPTV channel lists.
#[derive(Debug, Parser)]
#[command(
    name = "iptv-refresh",
    author,
    version,
    about = "Refresh IPTV channel lists, commit the changes and publish them",
    long_about = r#"
iptv-refresh runs the channel collector inside a git checkout, commits
whatever it changed as the automation bot, pushes, and keeps the produced
files as a dated artifact.

Quick start:
  iptv-refresh init     # Create iptv-refresh.toml
  iptv-refresh run      # One run, now
  iptv-refresh watch    # Run daily at trigger.schedule (UTC)

Environment variables:
  IPTV_REFRESH_TRIGGER=schedule|manual|push   Force the trigger kind
  IPTV_REFRESH_CONFIG=<path>                  Configuration file
  GITHUB_TOKEN                                Token used for clone and push
"#,
    propagate_version = true
)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (default: search for iptv-refresh.toml upward).
    #[arg(long, global = true, env = "IPTV_REFRESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-error output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Use color output.
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,
}

/// Color output choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ColorChoice {
    /// Always use color.
    Always,
    /// Auto-detect color support.
    #[default]
    Auto,
    /// Never use color.
    Never,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a default iptv-refresh.toml.
    #[command(visible_alias = "i")]
    Init {
        /// Overwrite existing configuration.
        #[arg(short, long)]
        force: bool,
    },

    /// Run the pipeline once.
    #[command(visible_alias = "r")]
    Run {
        /// Force the trigger kind instead of detecting it.
        #[arg(short, long, value_enum)]
        trigger: Option<TriggerKind>,

        /// Repository working directory.
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Print the run report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run the pipeline every day at the configured UTC time.
    #[command(visible_alias = "w")]
    Watch {
        /// Repository working directory.
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Run once immediately before waiting for the schedule.
        #[arg(long)]
        now: bool,
    },

    /// Validate the configuration file.
    #[command(visible_alias = "v")]
    Validate,

    /// Show configuration file location and contents.
    Config {
        /// Output raw TOML.
        #[arg(long)]
        raw: bool,
    },

    /// List published artifacts.
    #[command(visible_alias = "a")]
    Artifacts {
        /// Repository working directory (relative artifact dirs resolve here).
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Delete artifacts past their retention window.
        #[arg(long)]
        prune: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Runs the CLI.
pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);
    setup_color(cli.color);

    let config = cli.config.as_deref();

    // No subcommand means a single manual-or-detected run
    match cli.command {
        Some(Commands::Init { force }) => commands::init(config, force),
        Some(Commands::Run {
            trigger,
            workspace,
            json,
        }) => commands::run(config, &workspace, trigger, json, cli.quiet),
        Some(Commands::Watch { workspace, now }) => {
            commands::watch(config, &workspace, now, cli.quiet)
        },
        Some(Commands::Validate) => commands::validate(config),
        Some(Commands::Config { raw }) => commands::config(config, raw),
        Some(Commands::Artifacts { workspace, prune }) => {
            commands::artifacts(config, &workspace, prune)
        },
        Some(Commands::Completions { shell }) => {
            commands::completions(shell);
            Ok(ExitCode::SUCCESS)
        },
        None => commands::run(config, &PathBuf::from("."), None, false, cli.quiet),
    }
}

/// Sets up logging based on verbosity flags.
fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Sets up color output.
fn setup_color(choice: ColorChoice) {
    match choice {
        ColorChoice::Always => {
            console::set_colors_enabled(true);
            console::set_colors_enabled_stderr(true);
        },
        ColorChoice::Never => {
            console::set_colors_enabled(false);
            console::set_colors_enabled_stderr(false);
        },
        ColorChoice::Auto => {},
    }
}
