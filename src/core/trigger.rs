//! Trigger detection.
//!
//! A run is started by one of three triggers: the daily schedule, a manual
//! dispatch, or a push to a watched branch. The detector works out which one
//! applies from an explicit override, the `IPTV_REFRESH_TRIGGER` variable, or
//! the CI event variables, in that order.

use crate::config::TriggerConfig;
use crate::core::error::{Error, Result};
use serde::Serialize;
use std::env;

/// Environment variable overriding the detected trigger.
pub const TRIGGER_ENV_VAR: &str = "IPTV_REFRESH_TRIGGER";

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// The daily schedule fired.
    Schedule,
    /// Someone dispatched the run by hand.
    Manual,
    /// A branch was pushed.
    Push {
        /// The pushed branch.
        branch: String,
    },
}

impl Trigger {
    /// Returns a short name for the trigger.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::Push { .. } => "push",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push { branch } => write!(f, "push ({branch})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Trigger kind as named on the command line or in the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
pub enum TriggerKind {
    /// Scheduled run.
    Schedule,
    /// Manual dispatch.
    #[default]
    Manual,
    /// Push event.
    Push,
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "schedule" => Ok(Self::Schedule),
            "manual" | "workflow_dispatch" => Ok(Self::Manual),
            "push" => Ok(Self::Push),
            _ => Err(format!(
                "Invalid trigger: {s}. Expected: schedule, manual, or push"
            )),
        }
    }
}

/// Reason for trigger detection - useful for debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionReason {
    /// Given on the command line.
    Explicit,
    /// Set via `IPTV_REFRESH_TRIGGER`.
    EnvOverride(String),
    /// Derived from the CI event name.
    CiEvent(String),
    /// Nothing indicated otherwise.
    Default,
}

impl std::fmt::Display for DetectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "--trigger flag"),
            Self::EnvOverride(value) => write!(f, "{TRIGGER_ENV_VAR}={value}"),
            Self::CiEvent(event) => write!(f, "GITHUB_EVENT_NAME={event}"),
            Self::Default => write!(f, "Default (manual dispatch)"),
        }
    }
}

/// Result of trigger detection.
#[derive(Debug, Clone)]
pub struct Detection {
    /// The detected trigger.
    pub trigger: Trigger,
    /// Revision the trigger refers to, when known.
    pub revision: Option<String>,
    /// Reason for the detection.
    pub reason: DetectionReason,
}

impl Detection {
    /// Returns whether the pipeline should run for this trigger.
    ///
    /// Pushes only count on watched branches; other triggers always run.
    #[must_use]
    pub fn should_run(&self, config: &TriggerConfig) -> bool {
        match &self.trigger {
            Trigger::Push { branch } => config.branches.iter().any(|b| b == branch),
            Trigger::Schedule | Trigger::Manual => true,
        }
    }
}

/// Detector for determining what started a run.
#[derive(Debug, Default)]
pub struct Detector {
    explicit: Option<TriggerKind>,
    fallback_branch: Option<String>,
}

impl Detector {
    /// Creates a new detector.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            explicit: None,
            fallback_branch: None,
        }
    }

    /// Forces a trigger kind (from the command line).
    #[must_use]
    pub fn with_override(mut self, kind: Option<TriggerKind>) -> Self {
        self.explicit = kind;
        self
    }

    /// Branch used for push triggers when the environment names none.
    #[must_use]
    pub fn with_fallback_branch(mut self, branch: Option<String>) -> Self {
        self.fallback_branch = branch;
        self
    }

    /// Detects the trigger from the process environment.
    pub fn detect(&self) -> Result<Detection> {
        self.detect_from(|name| env::var(name).ok())
    }

    /// Detects the trigger using `lookup` for environment variables.
    pub fn detect_from<F>(&self, lookup: F) -> Result<Detection>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (kind, reason, from_ci) = if let Some(kind) = self.explicit {
            (kind, DetectionReason::Explicit, false)
        } else if let Some(value) = lookup(TRIGGER_ENV_VAR).filter(|v| !v.is_empty()) {
            let kind: TriggerKind = value
                .parse()
                .map_err(|e: String| Error::config_invalid(TRIGGER_ENV_VAR, e))?;
            (kind, DetectionReason::EnvOverride(value), false)
        } else if let Some((kind, event)) = Self::ci_event(&lookup) {
            (kind, DetectionReason::CiEvent(event), true)
        } else {
            (TriggerKind::Manual, DetectionReason::Default, false)
        };

        let trigger = match kind {
            TriggerKind::Schedule => Trigger::Schedule,
            TriggerKind::Manual => Trigger::Manual,
            TriggerKind::Push => {
                let branch = lookup("GITHUB_REF_NAME")
                    .filter(|b| !b.is_empty())
                    .or_else(|| self.fallback_branch.clone())
                    .ok_or_else(|| {
                        Error::config_invalid("trigger", "push trigger needs a branch name")
                    })?;
                Trigger::Push { branch }
            },
        };

        let revision = if from_ci {
            lookup("GITHUB_SHA").filter(|s| !s.is_empty())
        } else {
            None
        };

        Ok(Detection {
            trigger,
            revision,
            reason,
        })
    }

    /// Maps the CI event name onto a trigger kind.
    fn ci_event<F>(lookup: &F) -> Option<(TriggerKind, String)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let event = lookup("GITHUB_EVENT_NAME")?;
        let kind = match event.as_str() {
            "schedule" => TriggerKind::Schedule,
            "workflow_dispatch" => TriggerKind::Manual,
            "push" => TriggerKind::Push,
            _ => return None,
        };
        Some((kind, event))
    }
}
