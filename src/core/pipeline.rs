//! Pipeline runner.
//!
//! This module executes one pipeline run: checkout, interpreter setup,
//! dependency install, collector invocation, change detection, commit and
//! push, artifact publication. Steps run strictly in order; the first failure
//! ends the run. The whole run shares one wall-clock budget.

use crate::config::Config;
use crate::core::artifact::ArtifactStore;
use crate::core::error::{Error, Result};
use crate::core::executor::{CommandOutput, ExecuteOptions, Executor};
use crate::core::git::{GitAuth, GitRepo};
use crate::core::trigger::{Detection, Trigger};
use chrono::{DateTime, Utc};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// One stage of a pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    /// Materialize the repository.
    Checkout,
    /// Verify the interpreter.
    InterpreterSetup,
    /// Install collector dependencies.
    DependencyInstall,
    /// Run the collector.
    Collect,
    /// Stage everything and diff against the last commit.
    DetectChanges,
    /// Commit as the bot and push.
    CommitAndPush,
    /// Package the output files.
    PublishArtifact,
}

impl StepKind {
    /// Returns the step's display name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::InterpreterSetup => "interpreter-setup",
            Self::DependencyInstall => "dependency-install",
            Self::Collect => "collect",
            Self::DetectChanges => "detect-changes",
            Self::CommitAndPush => "commit-and-push",
            Self::PublishArtifact => "publish-artifact",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Completed successfully.
    Passed,
    /// Had nothing to do.
    Skipped,
    /// Failed; the run stopped here.
    Failed,
}

/// Result of a single step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    /// Which step.
    pub step: StepKind,
    /// How it ended.
    pub status: StepStatus,
    /// Time spent in the step.
    #[serde(serialize_with = "as_secs")]
    pub duration: Duration,
    /// One-line summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Why a run failed.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    /// Step that failed, if the failure happened inside one.
    pub step: Option<StepKind>,
    /// Error message.
    pub message: String,
    /// Process exit code for this failure.
    pub exit_code: i32,
}

impl RunFailure {
    fn new(step: Option<StepKind>, error: &Error) -> Self {
        Self {
            step,
            message: error.to_string(),
            exit_code: error.exit_code(),
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Identifier of the run; also names its artifact.
    pub run_id: String,
    /// What started the run.
    pub trigger: Trigger,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Set when the trigger was filtered out and nothing ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    /// Executed steps, in order.
    pub steps: Vec<StepRecord>,
    /// Commit created by this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Published archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    /// Set when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Total duration.
    #[serde(serialize_with = "as_secs")]
    pub duration: Duration,
}

impl RunReport {
    /// Returns true if every executed step succeeded.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// Returns the process exit code for this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.failure.as_ref().map_or(0, |f| f.exit_code)
    }

    /// Returns the record for `kind`, if that step ran.
    #[must_use]
    pub fn step(&self, kind: StepKind) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step == kind)
    }

    /// Returns the number of passed steps.
    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.count(StepStatus::Passed)
    }

    /// Returns the number of skipped steps.
    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Formats the bot's commit message for `now` (UTC).
#[must_use]
pub fn commit_message(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{prefix} - {}", now.format("%Y-%m-%d %H:%M"))
}

/// Value produced by a step plus how it should be recorded.
struct Done<T> {
    value: T,
    status: StepStatus,
    detail: Option<String>,
}

impl<T> Done<T> {
    fn passed(value: T, detail: impl Into<String>) -> Self {
        Self {
            value,
            status: StepStatus::Passed,
            detail: Some(detail.into()),
        }
    }

    fn skipped(value: T, detail: impl Into<String>) -> Self {
        Self {
            value,
            status: StepStatus::Skipped,
            detail: Some(detail.into()),
        }
    }
}

type StepResult<T> = std::result::Result<T, (StepKind, Error)>;

/// Mutable bookkeeping for a run in flight.
#[derive(Debug, Default)]
struct RunState {
    steps: Vec<StepRecord>,
    current: Option<(StepKind, Instant)>,
    repo: Option<GitRepo>,
    base_revision: Option<String>,
    artifact: Option<PathBuf>,
}

/// Runner for the refresh pipeline.
#[derive(Debug)]
pub struct Pipeline {
    config: Config,
    workspace: PathBuf,
    timeout: Duration,
    retention: Duration,
    console: bool,
    executor: Executor,
}

impl Pipeline {
    /// Creates a pipeline operating on `workspace`.
    pub fn new(config: Config, workspace: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let timeout = config.run_timeout()?;
        let retention = config.artifact_retention()?;

        Ok(Self {
            config,
            workspace: workspace.into(),
            timeout,
            retention,
            console: false,
            executor: Executor::new(),
        })
    }

    /// Enables spinners, step lines, and streamed collector output.
    #[must_use]
    pub const fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the pipeline once for `detection`.
    pub async fn run(&self, detection: &Detection) -> RunReport {
        let start = Instant::now();
        let started_at = Utc::now();
        let run_id = started_at.format("%Y%m%dT%H%M%S%3fZ").to_string();

        let mut report = RunReport {
            run_id: run_id.clone(),
            trigger: detection.trigger.clone(),
            started_at,
            skipped: None,
            steps: Vec::new(),
            commit: None,
            artifact: None,
            failure: None,
            duration: Duration::ZERO,
        };

        if !detection.should_run(&self.config.trigger) {
            let reason = format!("{} is not a watched branch", detection.trigger);
            tracing::info!(trigger = %detection.trigger, "Trigger filtered out, nothing to do");
            report.skipped = Some(reason);
            report.duration = start.elapsed();
            return report;
        }

        tracing::info!(
            run_id = %run_id,
            trigger = %detection.trigger,
            reason = %detection.reason,
            timeout = %humantime::format_duration(self.timeout),
            "Pipeline run started"
        );

        let deadline = start + self.timeout;
        let mut state = RunState::default();
        let outcome = tokio::time::timeout(
            self.timeout,
            self.execute(&mut state, detection, &run_id, deadline),
        )
        .await;

        report.failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err((step, error))) => Some(RunFailure::new(Some(step), &error)),
            Err(_) => {
                // Dropping the step future killed its child; record where we stopped.
                let error = Error::RunTimeout {
                    timeout: humantime::format_duration(self.timeout).to_string(),
                };
                let step = state.current.take().map(|(kind, started)| {
                    state.steps.push(StepRecord {
                        step: kind,
                        status: StepStatus::Failed,
                        duration: started.elapsed(),
                        detail: Some(error.to_string()),
                    });
                    kind
                });
                Some(RunFailure::new(step, &error))
            },
        };

        report.commit = self.new_commit(&state).await;
        report.steps = state.steps;
        report.artifact = state.artifact;
        report.duration = start.elapsed();

        match &report.failure {
            None => tracing::info!(run_id = %run_id, commit = ?report.commit, "Pipeline run succeeded"),
            Some(failure) => tracing::error!(
                run_id = %run_id,
                step = ?failure.step.map(|s| s.name()),
                error = %failure.message,
                "Pipeline run failed"
            ),
        }

        report
    }

    /// Runs every step in order, stopping at the first failure.
    async fn execute(
        &self,
        state: &mut RunState,
        detection: &Detection,
        run_id: &str,
        deadline: Instant,
    ) -> StepResult<()> {
        let (repo, auth) = self
            .step(state, StepKind::Checkout, self.checkout(detection))
            .await?;
        state.base_revision = repo.head_revision().await.ok();
        state.repo = Some(repo.clone());

        self.step(
            state,
            StepKind::InterpreterSetup,
            self.setup_interpreter(deadline),
        )
        .await?;

        self.step(
            state,
            StepKind::DependencyInstall,
            self.install_dependencies(&repo, deadline),
        )
        .await?;

        self.step(state, StepKind::Collect, self.collect(&repo, deadline))
            .await?;

        let changed = self
            .step(state, StepKind::DetectChanges, self.detect_changes(&repo))
            .await?;

        self.step(
            state,
            StepKind::CommitAndPush,
            self.commit_and_push(&repo, changed, &auth),
        )
        .await?;

        state.artifact = self
            .step(
                state,
                StepKind::PublishArtifact,
                self.publish_artifact(&repo, run_id),
            )
            .await?;

        Ok(())
    }

    /// Runs one step, recording its outcome.
    async fn step<T, F>(&self, state: &mut RunState, kind: StepKind, work: F) -> StepResult<T>
    where
        F: Future<Output = Result<Done<T>>>,
    {
        let started = Instant::now();
        state.current = Some((kind, started));
        tracing::info!(step = kind.name(), "Step started");

        let spinner = self.spinner(kind);
        let result = work.await;
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }
        state.current = None;

        let (record, outcome) = match result {
            Ok(done) => (
                StepRecord {
                    step: kind,
                    status: done.status,
                    duration: started.elapsed(),
                    detail: done.detail,
                },
                Ok(done.value),
            ),
            Err(error) => (
                StepRecord {
                    step: kind,
                    status: StepStatus::Failed,
                    duration: started.elapsed(),
                    detail: Some(error.to_string()),
                },
                Err((kind, error)),
            ),
        };

        tracing::info!(
            step = kind.name(),
            status = ?record.status,
            duration_ms = u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX),
            "Step finished"
        );
        self.print_step(&record);
        state.steps.push(record);
        outcome
    }

    fn spinner(&self, kind: StepKind) -> Option<ProgressBar> {
        // The collector streams to the terminal; a spinner would garble it
        if !self.console || kind == StepKind::Collect {
            return None;
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .ok()
                .unwrap_or_else(ProgressStyle::default_spinner),
        );
        pb.set_message(format!("{kind}..."));
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    }

    fn print_step(&self, record: &StepRecord) {
        if !self.console {
            return;
        }

        let mark = match record.status {
            StepStatus::Passed => style("✓").green(),
            StepStatus::Skipped => style("-").dim(),
            StepStatus::Failed => style("✗").red(),
        };
        match &record.detail {
            Some(detail) => eprintln!("{mark} {} {}", record.step, style(detail).dim()),
            None => eprintln!("{mark} {}", record.step),
        }
    }

    /// Options for a child process bounded by what is left of the run budget.
    fn exec_options(&self, deadline: Instant) -> ExecuteOptions {
        ExecuteOptions::default().timeout(deadline.saturating_duration_since(Instant::now()))
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn checkout(&self, detection: &Detection) -> Result<Done<(GitRepo, GitAuth)>> {
        let auth = self.resolve_auth()?;
        let checkout = &self.config.checkout;
        let remote = self.config.push.remote.as_str();

        let discovered = if self.workspace.exists() {
            GitRepo::discover_from(&self.workspace)
        } else {
            Err(Error::NotGitRepo)
        };

        let (repo, cloned) = match discovered {
            Ok(repo) => (repo, false),
            Err(Error::NotGitRepo) => {
                let Some(url) = checkout.repository.as_deref() else {
                    return Err(Error::checkout(format!(
                        "{} is not a git repository and checkout.repository is not set",
                        self.workspace.display()
                    )));
                };
                let repo =
                    GitRepo::clone_into(url, &self.workspace, checkout.branch.as_deref(), &auth)
                        .await?;
                (repo, true)
            },
            Err(e) => return Err(e),
        };

        // Archives inside the tree would be staged by `git add -A`
        self.config.artifact.resolve_dir(repo.root())?;

        let fetched = checkout.fetch && !cloned;
        if fetched {
            tracing::debug!(remote = %remote, authenticated = auth.has_token(), "Fetching");
            repo.fetch(remote, &auth)
                .await
                .map_err(|e| Error::checkout(e.to_string()))?;
        }

        let branch = match (&detection.trigger, &self.config.push.branch, &checkout.branch) {
            (Trigger::Push { branch }, _, _) | (_, Some(branch), _) | (_, None, Some(branch)) => {
                branch.clone()
            },
            _ => repo.current_branch().await?,
        };

        let target = match detection.revision.as_deref() {
            Some(revision) => repo
                .resolve_commit(revision)
                .await
                .map_err(|e| Error::checkout(e.to_string()))?,
            None if fetched => repo.remote_branch(remote, &branch).await.ok_or_else(|| {
                Error::checkout(format!("{remote}/{branch} does not exist after fetch"))
            })?,
            None => "HEAD".to_string(),
        };

        let head = repo
            .materialize(&branch, &target)
            .await
            .map_err(|e| Error::checkout(e.to_string()))?;
        tracing::info!(branch = %branch, revision = %head, "Working tree reset");

        let detail = format!("{branch} @ {} in {}", short(&head), repo.root().display());
        Ok(Done::passed((repo, auth), detail))
    }

    /// Looks up the write-scoped token.
    fn resolve_auth(&self) -> Result<GitAuth> {
        let credentials = &self.config.credentials;
        match std::env::var(&credentials.token_env) {
            Ok(token) if !token.is_empty() => Ok(GitAuth::from_token(&token)),
            _ if credentials.required => Err(Error::CredentialMissing {
                env_var: credentials.token_env.clone(),
            }),
            _ => Ok(GitAuth::anonymous()),
        }
    }

    async fn setup_interpreter(&self, deadline: Instant) -> Result<Done<()>> {
        let interpreter = &self.config.interpreter;
        let program = interpreter.program.as_str();
        let unavailable = |message: String| Error::InterpreterUnavailable {
            program: program.to_string(),
            message,
        };

        if !Executor::command_exists(program) {
            return Err(unavailable("not found on PATH".to_string()));
        }

        if interpreter.version.trim().is_empty() {
            return Ok(Done::passed((), format!("{program} (any version)")));
        }

        let output = self
            .executor
            .execute_program(program, ["--version"], self.exec_options(deadline))
            .await?;
        if !output.success() {
            return Err(unavailable(format!(
                "`{program} --version` exited with {}",
                output.exit_code
            )));
        }

        let found = parse_version(&output.combined_output())?
            .ok_or_else(|| unavailable("could not read its version".to_string()))?;
        if !version_matches(&found, interpreter.version.trim()) {
            return Err(unavailable(format!(
                "found version {found}, need {}",
                interpreter.version
            )));
        }

        Ok(Done::passed((), format!("{program} {found}")))
    }

    async fn install_dependencies(&self, repo: &GitRepo, deadline: Instant) -> Result<Done<()>> {
        let deps = &self.config.dependencies;
        let options = self.exec_options(deadline).cwd(repo.root());

        let (output, what) = if let Some(command) = deps.install_command.as_deref() {
            (self.executor.execute(command, options).await?, command.to_string())
        } else if deps.packages.is_empty() {
            return Ok(Done::skipped((), "no dependencies declared"));
        } else {
            let mut args = vec![
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
                "--quiet".to_string(),
            ];
            args.extend(deps.packages.iter().cloned());
            let output = self
                .executor
                .execute_program(&self.config.interpreter.program, args, options)
                .await?;
            (output, deps.packages.join(" "))
        };

        check_timeout(StepKind::DependencyInstall, &output)?;
        if !output.success() {
            return Err(Error::DependencyInstallFailed {
                message: output.tail(20),
                exit_code: output.exit_code,
            });
        }

        Ok(Done::passed((), what))
    }

    async fn collect(&self, repo: &GitRepo, deadline: Instant) -> Result<Done<()>> {
        let script = self.config.collector.script.as_str();
        if !repo.file_exists(script) {
            return Err(Error::CollectorMissing {
                path: repo.root().join(script),
            });
        }

        let options = self
            .exec_options(deadline)
            .cwd(repo.root())
            .capture_output(!self.console);
        let output = self
            .executor
            .execute_program(&self.config.interpreter.program, [script], options)
            .await?;

        if !self.console && !output.combined_output().is_empty() {
            tracing::debug!(output = %output.combined_output(), "Collector output");
        }

        check_timeout(StepKind::Collect, &output)?;
        if !output.success() {
            return Err(Error::CollectorFailed {
                script: script.to_string(),
                exit_code: output.exit_code,
            });
        }

        Ok(Done::passed(
            (),
            format!("{script} in {}", humantime::format_duration(round_ms(output.duration))),
        ))
    }

    async fn detect_changes(&self, repo: &GitRepo) -> Result<Done<bool>> {
        repo.stage_all().await?;

        if !repo.has_staged_changes().await? {
            return Ok(Done::passed(false, "no changes"));
        }

        let files = repo.staged_files().await?;
        Ok(Done::passed(true, format!("{} file(s) changed", files.len())))
    }

    async fn commit_and_push(
        &self,
        repo: &GitRepo,
        changed: bool,
        auth: &GitAuth,
    ) -> Result<Done<()>> {
        if !changed {
            return Ok(Done::skipped((), "nothing to commit"));
        }

        let commit = &self.config.commit;
        let message = commit_message(&commit.message, Utc::now());
        let sha = repo.commit(&commit.identity(), &message).await?;
        tracing::info!(commit = %sha, message = %message, "Committed changes");

        let push = &self.config.push;
        if !push.enabled {
            return Ok(Done::passed((), format!("committed {} (push disabled)", short(&sha))));
        }

        let branch = match push.branch.clone() {
            Some(branch) => branch,
            None => repo.current_branch().await?,
        };
        repo.push(&push.remote, &branch, auth).await?;

        Ok(Done::passed(
            (),
            format!("committed {}, pushed to {}/{branch}", short(&sha), push.remote),
        ))
    }

    async fn publish_artifact(&self, repo: &GitRepo, run_id: &str) -> Result<Done<Option<PathBuf>>> {
        let artifact = &self.config.artifact;
        let store = ArtifactStore::new(
            artifact.resolve_dir(repo.root())?,
            artifact.name.clone(),
            self.retention,
        );

        let now = Utc::now();
        let pruned = store.prune_expired(now)?;
        if !pruned.is_empty() {
            tracing::info!(count = pruned.len(), "Pruned expired artifacts");
        }

        match store.publish(repo.root(), &self.config.collector.outputs, run_id, now)? {
            Some(stored) => {
                let detail = format!(
                    "{} ({} file(s))",
                    stored.archive.display(),
                    stored.manifest.files.len()
                );
                Ok(Done::passed(Some(stored.archive), detail))
            },
            None => {
                tracing::warn!(
                    outputs = ?self.config.collector.outputs,
                    "No output files found, nothing to publish"
                );
                Ok(Done::skipped(None, "no output files found"))
            },
        }
    }

    /// Returns `HEAD` if it moved since checkout.
    async fn new_commit(&self, state: &RunState) -> Option<String> {
        let repo = state.repo.as_ref()?;
        let head = repo.head_revision().await.ok()?;
        (state.base_revision.as_deref() != Some(head.as_str())).then_some(head)
    }
}

fn check_timeout(step: StepKind, output: &CommandOutput) -> Result<()> {
    if output.timed_out {
        return Err(Error::StepTimeout {
            step: step.name().to_string(),
            timeout: humantime::format_duration(round_ms(output.duration)).to_string(),
        });
    }
    Ok(())
}

fn round_ms(duration: Duration) -> Duration {
    Duration::from_millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

/// Extracts the first dotted version number from `--version` output.
fn parse_version(text: &str) -> Result<Option<String>> {
    let re = Regex::new(r"\d+(?:\.\d+)+").map_err(|e| Error::Internal {
        message: format!("version pattern: {e}"),
    })?;
    Ok(re.find(text).map(|m| m.as_str().to_string()))
}

/// Returns true if `found`'s leading components equal `wanted`'s.
fn version_matches(found: &str, wanted: &str) -> bool {
    let found: Vec<&str> = found.split('.').collect();
    let wanted: Vec<&str> = wanted.split('.').collect();
    wanted.len() <= found.len() && wanted.iter().zip(&found).all(|(w, f)| w == f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::git::test_support::{git, remote_and_clone};
    use crate::core::trigger::DetectionReason;
    use rstest::rstest;
    use tempfile::TempDir;

    const OUTPUT_SCRIPT: &str = "echo 'CCTV-1,http://example/1' > iptv.txt\n\
                                 echo '#EXTM3U' > iptv.m3u\n";

    struct Fixture {
        temp: TempDir,
        remote: PathBuf,
        work: PathBuf,
        config: Config,
    }

    impl Fixture {
        /// A cloned repository whose collector is the shell script `body`.
        fn new(body: &str) -> Self {
            let temp = TempDir::new().expect("create temp dir");
            let (remote, work) = remote_and_clone(temp.path());
            std::fs::write(work.join("collect.sh"), body).expect("write collector");
            git(&work, &["add", "collect.sh"]);
            git(&work, &["commit", "--quiet", "-m", "add collector"]);
            git(&work, &["push", "--quiet", "origin", "main"]);

            let mut config = Config::default();
            config.interpreter.program = "sh".to_string();
            config.interpreter.version = String::new();
            config.dependencies.packages = Vec::new();
            config.collector.script = "collect.sh".to_string();
            config.credentials.token_env = "IPTV_REFRESH_TEST_TOKEN_UNSET".to_string();
            config.artifact.dir = Some(temp.path().join("artifacts"));

            Self {
                temp,
                remote,
                work,
                config,
            }
        }

        fn pipeline(&self) -> Pipeline {
            Pipeline::new(self.config.clone(), &self.work).expect("pipeline")
        }

        /// Pushes a commit adding `file` from a second clone; returns the new remote head.
        fn advance_remote(&self, file: &str, contents: &str) -> String {
            let other = self.temp.path().join("other");
            if !other.exists() {
                git(
                    self.temp.path(),
                    &[
                        "clone",
                        "--quiet",
                        self.remote.to_str().expect("utf8"),
                        other.to_str().expect("utf8"),
                    ],
                );
            }
            git(&other, &["pull", "--quiet", "--ff-only", "origin", "main"]);
            std::fs::write(other.join(file), contents).expect("write");
            git(&other, &["add", "."]);
            git(
                &other,
                &["-c", "user.name=o", "-c", "user.email=o@o", "commit", "-qm", file],
            );
            git(&other, &["push", "--quiet", "origin", "main"]);
            git(&self.remote, &["rev-parse", "main"])
        }

        fn commit_count(&self) -> usize {
            git(&self.work, &["rev-list", "--count", "HEAD"])
                .parse()
                .expect("count")
        }
    }

    fn manual() -> Detection {
        Detection {
            trigger: Trigger::Manual,
            revision: None,
            reason: DetectionReason::Default,
        }
    }

    fn statuses(report: &RunReport) -> Vec<(StepKind, StepStatus)> {
        report.steps.iter().map(|s| (s.step, s.status)).collect()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn test_commit_message_format() {
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 1, 5, 7, 3, 59)
            .single()
            .expect("valid");
        assert_eq!(
            commit_message("🤖 Auto-update IPTV channels", now),
            "🤖 Auto-update IPTV channels - 2024-01-05 07:03"
        );
    }

    #[rstest]
    #[case("3.12.1", "3", true)]
    #[case("3.11.9", "3.11", true)]
    #[case("3.1.2", "3.11", false)]
    #[case("3.11", "3.11.4", false)]
    #[case("2.7.18", "3", false)]
    fn test_version_matches(#[case] found: &str, #[case] wanted: &str, #[case] ok: bool) {
        assert_eq!(version_matches(found, wanted), ok);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("Python 3.12.1\n").expect("parse").as_deref(),
            Some("3.12.1")
        );
        assert_eq!(parse_version("no digits").expect("parse"), None);
    }

    #[test]
    fn test_step_names() {
        assert_eq!(StepKind::Checkout.to_string(), "checkout");
        assert_eq!(StepKind::CommitAndPush.to_string(), "commit-and-push");
    }

    // =========================================================================
    // Run behavior
    // =========================================================================

    #[tokio::test]
    async fn test_changes_are_committed_pushed_and_published() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let before = fx.commit_count();

        let report = fx.pipeline().run(&manual()).await;

        assert!(report.success(), "failure: {:?}", report.failure);
        assert_eq!(fx.commit_count(), before + 1);

        let head = git(&fx.work, &["rev-parse", "HEAD"]);
        assert_eq!(report.commit.as_deref(), Some(head.as_str()));
        assert_eq!(git(&fx.remote, &["rev-parse", "main"]), head);

        let subject = git(&fx.work, &["log", "-1", "--format=%an|%s"]);
        let pattern =
            Regex::new(r"^github-actions\[bot\]\|🤖 Auto-update IPTV channels - \d{4}-\d{2}-\d{2} \d{2}:\d{2}$")
                .expect("regex");
        assert!(pattern.is_match(&subject), "unexpected commit: {subject}");

        let archive = report.artifact.as_ref().expect("artifact published");
        assert!(archive.starts_with(fx.temp.path().join("artifacts")));
        assert!(archive.exists());
        assert_eq!(report.passed_count(), 6);
        assert_eq!(
            report.step(StepKind::DependencyInstall).map(|s| s.status),
            Some(StepStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn test_second_run_without_changes_does_not_commit() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let pipeline = fx.pipeline();

        let first = pipeline.run(&manual()).await;
        assert!(first.success());
        let after_first = fx.commit_count();

        let second = pipeline.run(&manual()).await;

        assert!(second.success(), "failure: {:?}", second.failure);
        assert_eq!(fx.commit_count(), after_first);
        assert!(second.commit.is_none());
        assert_eq!(
            second.step(StepKind::CommitAndPush).map(|s| s.status),
            Some(StepStatus::Skipped)
        );
        // The artifact is still published
        assert_eq!(
            second.step(StepKind::PublishArtifact).map(|s| s.status),
            Some(StepStatus::Passed)
        );
        assert!(second.artifact.is_some());
    }

    #[tokio::test]
    async fn test_collector_failure_stops_before_commit_and_publish() {
        let fx = Fixture::new("echo partial > iptv.txt\nexit 3\n");
        let before = fx.commit_count();

        let report = fx.pipeline().run(&manual()).await;

        assert!(!report.success());
        let failure = report.failure.as_ref().expect("failure");
        assert_eq!(failure.step, Some(StepKind::Collect));
        assert_eq!(report.exit_code(), 3);
        assert_eq!(fx.commit_count(), before);
        assert!(report.step(StepKind::DetectChanges).is_none());
        assert!(report.step(StepKind::PublishArtifact).is_none());
        assert!(report.artifact.is_none());
        assert!(!fx.temp.path().join("artifacts").exists());
    }

    #[tokio::test]
    async fn test_missing_collector_script() {
        let mut fx = Fixture::new(OUTPUT_SCRIPT);
        fx.config.collector.script = "iptv.py".to_string();

        let report = fx.pipeline().run(&manual()).await;

        let failure = report.failure.expect("failure");
        assert_eq!(failure.step, Some(StepKind::Collect));
        assert!(failure.message.contains("Collector script not found"));
    }

    #[tokio::test]
    async fn test_diverged_remote_fails_push_without_retry() {
        let mut fx = Fixture::new(OUTPUT_SCRIPT);
        // Without a fetch the run commits on the stale base
        fx.config.checkout.fetch = false;

        // Another writer moves the remote ahead
        let remote_head = fx.advance_remote("notes.txt", "theirs\n");

        let report = fx.pipeline().run(&manual()).await;

        let failure = report.failure.as_ref().expect("failure");
        assert_eq!(failure.step, Some(StepKind::CommitAndPush));
        assert_eq!(failure.exit_code, 75);
        // Local commit kept, remote untouched, nothing published
        assert!(report.commit.is_some());
        assert_eq!(git(&fx.remote, &["rev-parse", "main"]), remote_head);
        assert!(report.step(StepKind::PublishArtifact).is_none());
    }

    #[tokio::test]
    async fn test_runs_on_top_of_remote_that_moved_ahead() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let theirs = fx.advance_remote("notes.txt", "theirs\n");
        std::fs::write(fx.work.join("collect.sh"), "exit 9\n").expect("write");

        let report = fx.pipeline().run(&manual()).await;

        assert!(report.success(), "failure: {:?}", report.failure);
        assert!(fx.work.join("notes.txt").exists());
        assert_eq!(git(&fx.work, &["rev-parse", "HEAD~1"]), theirs);
        assert_eq!(
            git(&fx.remote, &["rev-parse", "main"]),
            git(&fx.work, &["rev-parse", "HEAD"])
        );
        // The local edit to the collector was discarded with the reset
        assert_eq!(
            std::fs::read_to_string(fx.work.join("collect.sh")).expect("read"),
            OUTPUT_SCRIPT
        );
    }

    #[tokio::test]
    async fn test_push_trigger_checks_out_pushed_revision() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let pushed = fx.advance_remote("sources.txt", "http://example/list\n");
        let detection = Detection {
            trigger: Trigger::Push {
                branch: "main".to_string(),
            },
            revision: Some(pushed.clone()),
            reason: DetectionReason::Explicit,
        };

        let report = fx.pipeline().run(&detection).await;

        assert!(report.success(), "failure: {:?}", report.failure);
        assert_eq!(git(&fx.work, &["rev-parse", "HEAD~1"]), pushed);
        assert_eq!(git(&fx.work, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    }

    #[tokio::test]
    async fn test_leftovers_of_timed_out_run_are_not_committed() {
        let mut fx = Fixture::new("echo partial > discovered_servers.txt\nsleep 30\n");
        fx.config.run.timeout = "1s".to_string();
        let aborted = fx.pipeline().run(&manual()).await;
        assert_eq!(aborted.exit_code(), 124);
        assert!(fx.work.join("discovered_servers.txt").exists());

        // The next run uses a collector that writes nothing
        let quiet = fx.advance_remote("collect.sh", "true\n");
        fx.config.run.timeout = "30s".to_string();

        let report = fx.pipeline().run(&manual()).await;

        assert!(report.success(), "failure: {:?}", report.failure);
        assert!(report.commit.is_none());
        assert_eq!(git(&fx.work, &["rev-parse", "HEAD"]), quiet);
        assert!(!fx.work.join("discovered_servers.txt").exists());
        assert_eq!(
            report.step(StepKind::CommitAndPush).map(|s| s.status),
            Some(StepStatus::Skipped)
        );
    }

    #[tokio::test]
    async fn test_artifact_dir_inside_repository_fails_checkout() {
        let mut fx = Fixture::new(OUTPUT_SCRIPT);
        fx.config.artifact.dir = Some(PathBuf::from("artifacts"));
        let before = fx.commit_count();

        let report = fx.pipeline().run(&manual()).await;

        let failure = report.failure.as_ref().expect("failure");
        assert_eq!(failure.step, Some(StepKind::Checkout));
        assert_eq!(report.exit_code(), 78);
        assert!(failure.message.contains("artifact.dir"));
        assert_eq!(report.steps.len(), 1);
        assert_eq!(fx.commit_count(), before);
        assert!(!fx.work.join("artifacts").exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_collector_and_skips_commit() {
        let mut fx = Fixture::new("echo started > iptv.txt\nsleep 30\n");
        fx.config.run.timeout = "1s".to_string();
        let before = fx.commit_count();

        let started = Instant::now();
        let report = fx.pipeline().run(&manual()).await;

        assert!(started.elapsed() < Duration::from_secs(20));
        let failure = report.failure.as_ref().expect("failure");
        assert_eq!(failure.step, Some(StepKind::Collect));
        assert_eq!(report.exit_code(), 124);
        assert_eq!(fx.commit_count(), before);
        assert_eq!(
            report.step(StepKind::Collect).map(|s| s.status),
            Some(StepStatus::Failed)
        );
        assert!(report.step(StepKind::CommitAndPush).is_none());
    }

    #[tokio::test]
    async fn test_no_outputs_skips_publish() {
        let fx = Fixture::new("echo nothing to write\n");

        let report = fx.pipeline().run(&manual()).await;

        assert!(report.success(), "failure: {:?}", report.failure);
        assert!(report.artifact.is_none());
        assert_eq!(
            statuses(&report),
            vec![
                (StepKind::Checkout, StepStatus::Passed),
                (StepKind::InterpreterSetup, StepStatus::Passed),
                (StepKind::DependencyInstall, StepStatus::Skipped),
                (StepKind::Collect, StepStatus::Passed),
                (StepKind::DetectChanges, StepStatus::Passed),
                (StepKind::CommitAndPush, StepStatus::Skipped),
                (StepKind::PublishArtifact, StepStatus::Skipped),
            ]
        );
    }

    #[tokio::test]
    async fn test_push_disabled_commits_locally() {
        let mut fx = Fixture::new(OUTPUT_SCRIPT);
        fx.config.push.enabled = false;
        let remote_head = git(&fx.remote, &["rev-parse", "main"]);

        let report = fx.pipeline().run(&manual()).await;

        assert!(report.success());
        assert!(report.commit.is_some());
        assert_eq!(git(&fx.remote, &["rev-parse", "main"]), remote_head);
    }

    #[tokio::test]
    async fn test_push_on_unwatched_branch_is_skipped() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let detection = Detection {
            trigger: Trigger::Push {
                branch: "feature/x".to_string(),
            },
            revision: None,
            reason: DetectionReason::Explicit,
        };

        let report = fx.pipeline().run(&detection).await;

        assert!(report.success());
        assert!(report.skipped.is_some());
        assert!(report.steps.is_empty());
        assert!(!fx.work.join("iptv.txt").exists());
    }

    #[tokio::test]
    async fn test_dependency_install_failure() {
        let mut fx = Fixture::new(OUTPUT_SCRIPT);
        fx.config.dependencies.install_command = Some("echo index unreachable >&2; exit 7".to_string());

        let report = fx.pipeline().run(&manual()).await;

        let failure = report.failure.as_ref().expect("failure");
        assert_eq!(failure.step, Some(StepKind::DependencyInstall));
        assert_eq!(failure.exit_code, 69);
        assert!(failure.message.contains("exit code 7"), "{}", failure.message);
        assert!(report.step(StepKind::Collect).is_none());
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let mut fx = Fixture::new(OUTPUT_SCRIPT);
        fx.config.interpreter.program = "definitely_not_python_12345".to_string();

        let report = fx.pipeline().run(&manual()).await;

        let failure = report.failure.expect("failure");
        assert_eq!(failure.step, Some(StepKind::InterpreterSetup));
        assert!(failure.message.contains("not found on PATH"));
    }

    #[tokio::test]
    async fn test_required_credential_missing_fails_checkout() {
        let mut fx = Fixture::new(OUTPUT_SCRIPT);
        fx.config.credentials.required = true;

        let report = fx.pipeline().run(&manual()).await;

        let failure = report.failure.expect("failure");
        assert_eq!(failure.step, Some(StepKind::Checkout));
        assert!(failure.message.contains("IPTV_REFRESH_TEST_TOKEN_UNSET"));
        assert_eq!(report.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_trigger_revision_fails_checkout() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let detection = Detection {
            trigger: Trigger::Manual,
            revision: Some("0123456789abcdef0123456789abcdef01234567".to_string()),
            reason: DetectionReason::Default,
        };

        let report = fx.pipeline().run(&detection).await;

        let failure = report.failure.expect("failure");
        assert_eq!(failure.step, Some(StepKind::Checkout));
        assert_eq!(failure.exit_code, 69);
    }

    #[tokio::test]
    async fn test_clones_when_workspace_is_empty() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let mut config = fx.config.clone();
        config.checkout.repository = Some(fx.remote.to_string_lossy().into_owned());
        let fresh = fx.temp.path().join("fresh");

        let report = Pipeline::new(config, &fresh)
            .expect("pipeline")
            .run(&manual())
            .await;

        assert!(report.success(), "failure: {:?}", report.failure);
        assert!(fresh.join("iptv.txt").exists());
        assert_eq!(
            git(&fx.remote, &["rev-parse", "main"]),
            git(&fresh, &["rev-parse", "HEAD"])
        );
    }

    #[tokio::test]
    async fn test_not_a_repo_without_repository_fails_checkout() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let empty = fx.temp.path().join("empty");
        std::fs::create_dir(&empty).expect("create dir");

        // tempdirs live outside any repository
        let report = Pipeline::new(fx.config.clone(), &empty)
            .expect("pipeline")
            .run(&manual())
            .await;

        let failure = report.failure.expect("failure");
        assert_eq!(failure.step, Some(StepKind::Checkout));
    }

    #[tokio::test]
    async fn test_report_serializes_to_json() {
        let fx = Fixture::new(OUTPUT_SCRIPT);
        let report = fx.pipeline().run(&manual()).await;

        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["trigger"]["kind"], "manual");
        assert_eq!(json["steps"][0]["step"], "checkout");
        assert_eq!(json["steps"][0]["status"], "passed");
        assert!(json["duration"].is_f64());
        assert!(json.get("failure").is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.run.timeout = "whenever".to_string();
        assert!(Pipeline::new(config, ".").is_err());
    }
}
