//! Configuration handling for iptv-refresh.
//!
//! This module provides configuration loading and validation, supporting
//! `iptv-refresh.toml` files and defaults that mirror the upstream workflow
//! (daily run, `python3 iptv.py`, bot commit, seven-day artifact retention).

use crate::core::error::{Error, Result};
use crate::core::git::Identity;
use crate::core::schedule::DailySchedule;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "iptv-refresh.toml";

/// Output files the collector is expected to produce.
pub const DEFAULT_OUTPUTS: [&str; 3] = ["iptv.txt", "iptv.m3u", "discovered_servers.txt"];

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run-wide settings.
    pub run: RunConfig,
    /// Trigger settings.
    pub trigger: TriggerConfig,
    /// Checkout settings.
    pub checkout: CheckoutConfig,
    /// Credential lookup.
    pub credentials: CredentialsConfig,
    /// Interpreter provisioning.
    pub interpreter: InterpreterConfig,
    /// Collector dependencies.
    pub dependencies: DependenciesConfig,
    /// The external collector.
    pub collector: CollectorConfig,
    /// Commit identity and message.
    pub commit: CommitConfig,
    /// Push target.
    pub push: PushConfig,
    /// Artifact publication.
    pub artifact: ArtifactConfig,
}

impl Config {
    /// Loads configuration from the default location.
    pub fn load() -> Result<Self> {
        let path = Self::find_config_file()?;
        Self::load_from(&path)
    }

    /// Loads configuration or returns defaults if not found.
    pub fn load_or_default() -> Result<Self> {
        match Self::find_config_file() {
            Ok(path) => Self::load_from(&path),
            Err(Error::ConfigNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io("read config", e))?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::config_parse_with_source("Failed to parse TOML", e))?;

        config.validate()?;

        Ok(config)
    }

    /// Finds the configuration file by searching up the directory tree.
    pub fn find_config_file() -> Result<PathBuf> {
        let cwd = std::env::current_dir().map_err(|e| Error::io("get current dir", e))?;
        Self::find_config_file_from(&cwd)
    }

    /// Finds the configuration file by searching up from `start`.
    pub fn find_config_file_from(start: &Path) -> Result<PathBuf> {
        let mut current = start;
        loop {
            let config_path = current.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Ok(config_path);
            }

            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }

        Err(Error::ConfigNotFound {
            path: start.join(CONFIG_FILE_NAME),
        })
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        parse_duration("run.timeout", &self.run.timeout)?;
        parse_duration("artifact.retention", &self.artifact.retention)?;
        self.trigger.schedule()?;

        if self.interpreter.program.trim().is_empty() {
            return Err(Error::config_invalid(
                "interpreter.program",
                "must not be empty",
            ));
        }

        if self.collector.script.trim().is_empty() {
            return Err(Error::config_invalid("collector.script", "must not be empty"));
        }

        if self.collector.outputs.is_empty() {
            return Err(Error::config_invalid(
                "collector.outputs",
                "at least one output file is required",
            ));
        }

        if let Some(bad) = self
            .collector
            .outputs
            .iter()
            .find(|o| o.is_empty() || Path::new(o).is_absolute() || o.contains(".."))
        {
            return Err(Error::config_invalid(
                "collector.outputs",
                format!("output must be a relative path inside the repository: {bad:?}"),
            ));
        }

        if self.commit.author_name.trim().is_empty() || self.commit.author_email.trim().is_empty()
        {
            return Err(Error::config_invalid(
                "commit",
                "author_name and author_email are required",
            ));
        }

        if self.artifact.name.trim().is_empty() {
            return Err(Error::config_invalid("artifact.name", "must not be empty"));
        }

        Ok(())
    }

    /// Returns the run budget.
    pub fn run_timeout(&self) -> Result<Duration> {
        parse_duration("run.timeout", &self.run.timeout)
    }

    /// Returns the artifact retention window.
    pub fn artifact_retention(&self) -> Result<Duration> {
        parse_duration("artifact.retention", &self.artifact.retention)
    }

    /// Generates default configuration as a string.
    #[must_use]
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Parses a duration string like "30s", "5m", "7d".
fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|_| Error::config_invalid(field, format!("Invalid duration: {value}")))
}

/// Run-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wall-clock budget for a whole run.
    pub timeout: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout: "30m".to_string(),
        }
    }
}

/// Trigger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Daily run time, `HH:MM` in UTC.
    pub schedule: String,
    /// Branches whose pushes trigger a run.
    pub branches: Vec<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            schedule: "00:00".to_string(),
            branches: vec!["main".to_string(), "master".to_string()],
        }
    }
}

impl TriggerConfig {
    /// Parses the daily schedule.
    pub fn schedule(&self) -> Result<DailySchedule> {
        self.schedule
            .parse()
            .map_err(|e: String| Error::config_invalid("trigger.schedule", e))
    }
}

/// Checkout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckoutConfig {
    /// Repository URL cloned when the workspace is not a git repository.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Branch to clone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Fetch the push remote and reset onto it before running.
    pub fetch: bool,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            repository: None,
            branch: None,
            fetch: true,
        }
    }
}

/// Credential configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Environment variable holding the write-scoped token.
    pub token_env: String,
    /// Fail the checkout when the token is absent.
    pub required: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            token_env: "GITHUB_TOKEN".to_string(),
            required: false,
        }
    }
}

/// Interpreter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Interpreter executable.
    pub program: String,
    /// Required version prefix; empty accepts any version.
    pub version: String,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            version: "3".to_string(),
        }
    }
}

/// Dependency installation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependenciesConfig {
    /// Packages installed with `<interpreter> -m pip install`.
    pub packages: Vec<String>,
    /// Shell command replacing the pip invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Self {
            packages: vec!["requests".to_string()],
            install_command: None,
        }
    }
}

/// Collector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Script run by the interpreter, relative to the repository root.
    pub script: String,
    /// Files published as the artifact.
    pub outputs: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            script: "iptv.py".to_string(),
            outputs: DEFAULT_OUTPUTS.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

/// Commit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Bot author name.
    pub author_name: String,
    /// Bot author email.
    pub author_email: String,
    /// Message prefix; the UTC timestamp is appended.
    pub message: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            author_name: "github-actions[bot]".to_string(),
            author_email: "github-actions[bot]@users.noreply.github.com".to_string(),
            message: "🤖 Auto-update IPTV channels".to_string(),
        }
    }
}

impl CommitConfig {
    /// Returns the commit identity.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            name: self.author_name.clone(),
            email: self.author_email.clone(),
        }
    }
}

/// Push configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Push after committing.
    pub enabled: bool,
    /// Remote name.
    pub remote: String,
    /// Target branch; defaults to the current branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remote: "origin".to_string(),
            branch: None,
        }
    }
}

/// Artifact configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Artifact name.
    pub name: String,
    /// Retention window.
    pub retention: String,
    /// Storage directory; relative paths resolve against the repository root
    /// and must leave it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            name: "iptv-files".to_string(),
            retention: "7d".to_string(),
            dir: None,
        }
    }
}

impl ArtifactConfig {
    /// Resolves the storage directory.
    ///
    /// Defaults to the per-user data directory. A directory inside the
    /// repository is rejected: change detection stages the whole working
    /// tree, so every archive would be committed.
    pub fn resolve_dir(&self, repo_root: &Path) -> Result<PathBuf> {
        let repo_root = if repo_root.is_absolute() {
            repo_root.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| Error::io("read current directory", e))?
                .join(repo_root)
        };
        let repo_root = repo_root.as_path();

        let dir = match &self.dir {
            Some(dir) => normalize(&repo_root.join(dir)),
            None => dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("iptv-refresh")
                .join("artifacts"),
        };

        let root = normalize(repo_root);
        let canonical_root = repo_root.canonicalize().unwrap_or_else(|_| root.clone());
        if dir.starts_with(&root) || dir.starts_with(&canonical_root) {
            return Err(Error::config_invalid(
                "artifact.dir",
                format!(
                    "{} is inside the repository at {}",
                    dir.display(),
                    root.display()
                ),
            ));
        }

        Ok(dir)
    }
}

/// Resolves `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                out.pop();
            },
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.run_timeout().expect("timeout"), Duration::from_secs(1800));
        assert_eq!(
            config.artifact_retention().expect("retention"),
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(config.collector.outputs, DEFAULT_OUTPUTS.to_vec());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let toml = Config::default_toml();
        assert!(toml.contains("[run]"));
        assert!(toml.contains("[collector]"));
        assert!(toml.contains("[artifact]"));

        let parsed = Config::from_toml(&toml).expect("parse defaults");
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::from_toml(
            r#"
[collector]
script = "collect.py"

[push]
enabled = false
"#,
        )
        .expect("parse");

        assert_eq!(config.collector.script, "collect.py");
        assert_eq!(config.collector.outputs.len(), 3);
        assert!(!config.push.enabled);
        assert_eq!(config.push.remote, "origin");
        assert_eq!(config.interpreter.program, "python3");
    }

    #[test]
    fn test_invalid_timeout() {
        let mut config = Config::default();
        config.run.timeout = "soon".to_string();
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid { field, .. }) if field == "run.timeout"
        ));
    }

    #[test]
    fn test_invalid_schedule() {
        let mut config = Config::default();
        config.trigger.schedule = "25:00".to_string();
        assert!(matches!(
            config.validate(),
            Err(Error::ConfigInvalid { field, .. }) if field == "trigger.schedule"
        ));
    }

    #[test]
    fn test_outputs_must_stay_in_repo() {
        let mut config = Config::default();
        config.collector.outputs = vec!["../escape.txt".to_string()];
        assert!(config.validate().is_err());

        config.collector.outputs = vec!["/etc/passwd".to_string()];
        assert!(config.validate().is_err());

        config.collector.outputs = Vec::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_identity_rejected() {
        let mut config = Config::default();
        config.commit.author_email = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_is_config_parse() {
        let result = Config::from_toml("[run\ntimeout = ");
        assert!(matches!(result, Err(Error::ConfigParse { .. })));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = TempDir::new().expect("create temp dir");
        std::fs::write(temp.path().join(CONFIG_FILE_NAME), "").expect("write config");
        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("create nested");

        let found = Config::find_config_file_from(&nested).expect("find");
        assert_eq!(found, temp.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_find_config_file_missing() {
        let temp = TempDir::new().expect("create temp dir");
        assert!(matches!(
            Config::find_config_file_from(temp.path()),
            Err(Error::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn test_artifact_dir_resolution() {
        let root = Path::new("/srv/repo");
        let mut artifact = ArtifactConfig::default();
        assert!(artifact
            .resolve_dir(root)
            .expect("default dir")
            .ends_with("iptv-refresh/artifacts"));

        artifact.dir = Some(PathBuf::from("../artifacts"));
        assert_eq!(
            artifact.resolve_dir(root).expect("sibling dir"),
            PathBuf::from("/srv/artifacts")
        );

        artifact.dir = Some(PathBuf::from("/var/artifacts"));
        assert_eq!(
            artifact.resolve_dir(root).expect("absolute dir"),
            PathBuf::from("/var/artifacts")
        );
    }

    #[test]
    fn test_artifact_dir_relative_workspace() {
        let artifact = ArtifactConfig {
            dir: Some(PathBuf::from("/var/artifacts")),
            ..ArtifactConfig::default()
        };
        assert_eq!(
            artifact.resolve_dir(Path::new(".")).expect("outside cwd"),
            PathBuf::from("/var/artifacts")
        );

        let inside = ArtifactConfig {
            dir: Some(PathBuf::from("dist")),
            ..ArtifactConfig::default()
        };
        assert!(inside.resolve_dir(Path::new(".")).is_err());
    }

    #[test]
    fn test_artifact_dir_inside_repository_rejected() {
        let root = Path::new("/srv/repo");
        for inside in ["out/artifacts", ".", "/srv/repo/dist", "lists/../build"] {
            let artifact = ArtifactConfig {
                dir: Some(PathBuf::from(inside)),
                ..ArtifactConfig::default()
            };
            let err = artifact.resolve_dir(root).expect_err(inside);
            assert!(
                matches!(err, Error::ConfigInvalid { ref field, .. } if field == "artifact.dir"),
                "{inside}: {err}"
            );
        }
    }

    #[test]
    fn test_checkout_fetches_by_default() {
        assert!(Config::default().checkout.fetch);
        let config = Config::from_toml("[checkout]\nfetch = false\n").expect("parse");
        assert!(!config.checkout.fetch);
    }

    #[test]
    fn test_commit_identity() {
        let identity = CommitConfig::default().identity();
        assert_eq!(identity.name, "github-actions[bot]");
        assert!(identity.email.ends_with("@users.noreply.github.com"));
    }
}
