//! Git repository operations.
//!
//! This module wraps the `git` binary for everything a pipeline run does to
//! the working tree: discovery, cloning, fetching, staging, diffing,
//! committing, and pushing. Every invocation runs with prompts disabled and
//! `kill_on_drop`, so a run that is abandoned on timeout also kills git.

use crate::core::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Credentials passed to git for network operations.
#[derive(Clone, Default)]
pub struct GitAuth {
    header: Option<String>,
}

impl GitAuth {
    /// No credentials; git falls back to its own helpers.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self { header: None }
    }

    /// Builds an HTTP basic authorization header from a write-scoped token.
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        let encoded = STANDARD.encode(format!("x-access-token:{token}"));
        Self {
            header: Some(format!("http.extraheader=AUTHORIZATION: basic {encoded}")),
        }
    }

    /// Returns true if a token is attached.
    #[must_use]
    pub const fn has_token(&self) -> bool {
        self.header.is_some()
    }

    fn config_args(&self) -> Vec<String> {
        self.header
            .iter()
            .flat_map(|h| ["-c".to_string(), h.clone()])
            .collect()
    }
}

impl std::fmt::Debug for GitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitAuth")
            .field("token", &self.header.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Fixed identity used for automated commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Author and committer name.
    pub name: String,
    /// Author and committer email.
    pub email: String,
}

/// Represents a Git repository.
#[derive(Debug, Clone)]
pub struct GitRepo {
    /// Root directory of the repository (where .git is).
    root: PathBuf,
}

impl GitRepo {
    /// Discovers the Git repository containing `path`.
    pub fn discover_from(path: &Path) -> Result<Self> {
        let output = std::process::Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(path)
            .output()
            .map_err(|e| Error::io("run git rev-parse", e))?;

        if !output.status.success() {
            return Err(Error::NotGitRepo);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let root = stdout
            .lines()
            .next()
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .ok_or(Error::NotGitRepo)?;

        Ok(Self { root })
    }

    /// Clones `url` into `dest` and returns the new repository.
    pub async fn clone_into(
        url: &str,
        dest: &Path,
        branch: Option<&str>,
        auth: &GitAuth,
    ) -> Result<Self> {
        let mut args = auth.config_args();
        args.extend(["clone".to_string(), "--quiet".to_string()]);
        if let Some(branch) = branch {
            args.extend(["--branch".to_string(), branch.to_string()]);
        }
        args.push(url.to_string());
        args.push(dest.to_string_lossy().into_owned());

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| Error::io("create clone parent", e))?;

        tracing::debug!(url = %url, dest = %dest.display(), "git clone");
        let output = run_git(parent, &args).await?;
        if !output.status.success() {
            return Err(Error::checkout(stderr_of(&output)));
        }

        Self::discover_from(dest)
    }

    /// Returns the root directory of the repository.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs git in the repository root.
    async fn git<S: AsRef<str>>(&self, args: &[S]) -> Result<Output> {
        let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
        tracing::debug!(args = ?args, "git");
        run_git(&self.root, &args).await
    }

    /// Fetches the remote so later pushes see its current state.
    pub async fn fetch(&self, remote: &str, auth: &GitAuth) -> Result<()> {
        let mut args = auth.config_args();
        args.extend(["fetch".to_string(), "--quiet".to_string(), remote.to_string()]);

        tracing::debug!(remote = %remote, "git fetch");
        let output = run_git(&self.root, &args).await?;
        if !output.status.success() {
            return Err(Error::git("fetch", stderr_of(&output)));
        }
        Ok(())
    }

    /// Resolves a revision to a full commit id.
    pub async fn resolve_commit(&self, revision: &str) -> Result<String> {
        let spec = format!("{revision}^{{commit}}");
        let output = self.git(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        if !output.status.success() {
            return Err(Error::git(
                "rev-parse",
                format!("Unknown revision: {revision}"),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Returns the commit `<remote>/<branch>` points at after the last fetch.
    pub async fn remote_branch(&self, remote: &str, branch: &str) -> Option<String> {
        self.resolve_commit(&format!("refs/remotes/{remote}/{branch}"))
            .await
            .ok()
    }

    /// Points `branch` at `target`, checks it out, and makes the working tree
    /// match it exactly. Returns the new `HEAD`.
    ///
    /// Edits to tracked files are discarded and untracked files removed;
    /// ignored files are kept.
    pub async fn materialize(&self, branch: &str, target: &str) -> Result<String> {
        let output = self
            .git(&["checkout", "--quiet", "--force", "-B", branch, target])
            .await?;
        if !output.status.success() {
            return Err(Error::git("checkout", stderr_of(&output)));
        }

        let output = self.git(&["clean", "--quiet", "--force", "-d"]).await?;
        if !output.status.success() {
            return Err(Error::git("clean", stderr_of(&output)));
        }

        self.head_revision().await
    }

    /// Returns the commit id of `HEAD`.
    pub async fn head_revision(&self) -> Result<String> {
        self.resolve_commit("HEAD").await
    }

    /// Returns the current branch name.
    pub async fn current_branch(&self) -> Result<String> {
        let output = self.git(&["symbolic-ref", "--quiet", "--short", "HEAD"]).await?;

        if !output.status.success() {
            return Err(Error::git("symbolic-ref", "HEAD is detached"));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stages every working-tree change, including deletions and new files.
    pub async fn stage_all(&self) -> Result<()> {
        let output = self.git(&["add", "-A"]).await?;
        if !output.status.success() {
            return Err(Error::git("add", stderr_of(&output)));
        }
        Ok(())
    }

    /// Compares the index to the last commit.
    ///
    /// Returns `Ok(false)` when there is nothing staged; that is a valid
    /// outcome, not an error.
    pub async fn has_staged_changes(&self) -> Result<bool> {
        let output = self.git(&["diff", "--cached", "--quiet"]).await?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(Error::git("diff --cached", stderr_of(&output))),
        }
    }

    /// Returns the list of staged files.
    pub async fn staged_files(&self) -> Result<Vec<PathBuf>> {
        let output = self.git(&["diff", "--cached", "--name-only"]).await?;

        if !output.status.success() {
            return Err(Error::git("diff --cached", "Failed to get staged files"));
        }

        let files = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        Ok(files)
    }

    /// Commits the index as `identity` and returns the new commit id.
    pub async fn commit(&self, identity: &Identity, message: &str) -> Result<String> {
        let name = format!("user.name={}", identity.name);
        let email = format!("user.email={}", identity.email);
        let output = self
            .git(&["-c", &name, "-c", &email, "commit", "--quiet", "-m", message])
            .await?;

        if !output.status.success() {
            return Err(Error::git("commit", stderr_of(&output)));
        }

        self.head_revision().await
    }

    /// Pushes `HEAD` to `branch` on `remote`.
    ///
    /// A diverged remote yields [`Error::PushRejected`]. Nothing is retried.
    pub async fn push(&self, remote: &str, branch: &str, auth: &GitAuth) -> Result<()> {
        let mut args = auth.config_args();
        args.extend([
            "push".to_string(),
            "--porcelain".to_string(),
            remote.to_string(),
            format!("HEAD:refs/heads/{branch}"),
        ]);

        tracing::debug!(remote = %remote, branch = %branch, "git push");
        let output = run_git(&self.root, &args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = stderr_of(&output);
        if is_rejection(&stdout) || is_rejection(&stderr) {
            return Err(Error::PushRejected {
                remote: remote.to_string(),
                branch: branch.to_string(),
                message: stderr,
            });
        }

        Err(Error::git("push", stderr))
    }

    /// Checks if a file exists in the repository.
    #[must_use]
    pub fn file_exists(&self, relative_path: &str) -> bool {
        self.root.join(relative_path).is_file()
    }
}

/// Runs git with prompts disabled in `cwd`.
async fn run_git<S: AsRef<std::ffi::OsStr>>(cwd: &Path, args: &[S]) -> Result<Output> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::io("run git", e))
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Recognizes git's push rejection markers.
fn is_rejection(text: &str) -> bool {
    ["[rejected]", "[remote rejected]", "non-fast-forward", "fetch first"]
        .iter()
        .any(|marker| text.contains(marker))
}
