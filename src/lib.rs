//! # iptv-refresh
//!
//! Scheduled refresh of IPTV channel lists.
//!
//! Once a day (or on demand, or on a push to a watched branch) the collector
//! script runs inside a git checkout. Whatever it changed is committed as the
//! automation bot and pushed, and the produced files are kept as a dated
//! artifact for a retention window.
//!
//! ## Features
//!
//! - **Trigger detection**: Explicit flag, `IPTV_REFRESH_TRIGGER`, or the CI
//!   event that started the job
//! - **Ordered steps**: Checkout, interpreter setup, dependency install,
//!   collect, detect changes, commit and push, publish artifact
//! - **Run budget**: One wall-clock limit for the whole run; a run that
//!   exceeds it is killed and never commits
//! - **Idempotent commits**: Nothing is committed when the collector changed
//!   nothing
//!
//! ## Example
//!
//! ```rust,no_run
//! use iptv_refresh::{Config, Detector, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> iptv_refresh::Result<()> {
//!     let config = Config::load_or_default()?;
//!
//!     // Detect what started this run
//!     let detection = Detector::new().detect()?;
//!
//!     let pipeline = Pipeline::new(config, ".")?;
//!     let report = pipeline.run(&detection).await;
//!
//!     if !report.success() {
//!         std::process::exit(report.exit_code());
//!     }
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/iptv-refresh/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod cli;
pub mod config;
pub mod core;

// Re-export main types for convenience
pub use config::Config;
pub use core::artifact::{ArtifactManifest, ArtifactStore};
pub use core::error::{Error, Result};
pub use core::pipeline::{Pipeline, RunReport, StepKind, StepRecord, StepStatus};
pub use core::schedule::DailySchedule;
pub use core::trigger::{Detection, Detector, Trigger, TriggerKind};
