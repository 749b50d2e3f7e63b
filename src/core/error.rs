//! Error types for iptv-refresh.
//!
//! This module defines all errors that can occur while loading configuration
//! or executing a pipeline run.

use std::path::PathBuf;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in iptv-refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration errors
    // =========================================================================
    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path where config was expected.
        path: PathBuf,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        /// Description of the parse error.
        message: String,
        /// Optional source error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {field} - {message}")]
    ConfigInvalid {
        /// Field name that is invalid.
        field: String,
        /// Description of why it's invalid.
        message: String,
    },

    // =========================================================================
    // Provisioning errors
    // =========================================================================
    /// The repository could not be materialized.
    #[error("Checkout failed: {message}")]
    CheckoutFailed {
        /// Error message.
        message: String,
    },

    /// A required credential is not present in the environment.
    #[error("Required credential not set: {env_var}")]
    CredentialMissing {
        /// Environment variable expected to hold the credential.
        env_var: String,
    },

    /// The interpreter is missing or has the wrong version.
    #[error("Interpreter '{program}' unavailable: {message}")]
    InterpreterUnavailable {
        /// Interpreter program name.
        program: String,
        /// Why it is unusable.
        message: String,
    },

    /// Installing collector dependencies failed.
    #[error("Dependency install failed with exit code {exit_code}: {message}")]
    DependencyInstallFailed {
        /// Tail of the installer output.
        message: String,
        /// Exit code of the installer.
        exit_code: i32,
    },

    // =========================================================================
    // Collector errors
    // =========================================================================
    /// Collector script does not exist in the working tree.
    #[error("Collector script not found: {path}")]
    CollectorMissing {
        /// Expected script path.
        path: PathBuf,
    },

    /// Collector exited unsuccessfully.
    #[error("Collector '{script}' failed with exit code {exit_code}")]
    CollectorFailed {
        /// Script that was run.
        script: String,
        /// Exit code of the collector.
        exit_code: i32,
    },

    // =========================================================================
    // Git errors
    // =========================================================================
    /// Not in a Git repository.
    #[error("Not in a Git repository")]
    NotGitRepo,

    /// Git operation failed.
    #[error("Git operation failed: {operation} - {message}")]
    GitOperation {
        /// Name of the operation that failed.
        operation: String,
        /// Error message.
        message: String,
    },

    /// The remote refused the push (it has diverged).
    #[error("Push to {remote}/{branch} rejected: {message}")]
    PushRejected {
        /// Remote name.
        remote: String,
        /// Branch that was pushed.
        branch: String,
        /// Git's rejection message.
        message: String,
    },

    // =========================================================================
    // Timeout errors
    // =========================================================================
    /// The whole run exceeded its wall-clock budget.
    #[error("Run exceeded its time budget of {timeout}")]
    RunTimeout {
        /// Budget as a human-readable string.
        timeout: String,
    },

    /// A step's child process was killed when the run budget ran out.
    #[error("Step '{step}' killed after {timeout}: run time budget exhausted")]
    StepTimeout {
        /// Name of the step.
        step: String,
        /// Timeout duration as string.
        timeout: String,
    },

    // =========================================================================
    // I/O and artifact errors
    // =========================================================================
    /// File I/O error.
    #[error("I/O error: {message}: {source}")]
    Io {
        /// Description of what failed.
        message: String,
        /// Source error.
        #[source]
        source: std::io::Error,
    },

    /// Writing or reading an artifact archive failed.
    #[error("Artifact error: {message}")]
    Artifact {
        /// Description of what failed.
        message: String,
    },

    // =========================================================================
    // Internal errors
    // =========================================================================
    /// Internal error (should never happen).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new configuration parse error with source.
    pub fn config_parse_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new invalid configuration error.
    pub fn config_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a new I/O error with context.
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Creates a new Git operation error.
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::GitOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a new checkout error.
    pub fn checkout(message: impl Into<String>) -> Self {
        Self::CheckoutFailed {
            message: message.into(),
        }
    }

    /// Creates a new artifact error.
    pub fn artifact(message: impl Into<String>) -> Self {
        Self::Artifact {
            message: message.into(),
        }
    }

    /// Returns true if this error belongs to environment provisioning
    /// (checkout, interpreter, dependencies).
    pub const fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Self::CheckoutFailed { .. }
                | Self::CredentialMissing { .. }
                | Self::InterpreterUnavailable { .. }
                | Self::DependencyInstallFailed { .. }
        )
    }

    /// Returns an exit code appropriate for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CollectorFailed { exit_code, .. } if *exit_code > 0 => *exit_code,
            Self::RunTimeout { .. } | Self::StepTimeout { .. } => 124, // Standard timeout exit code
            Self::ConfigNotFound { .. } | Self::ConfigParse { .. } | Self::ConfigInvalid { .. } => {
                78
            }, // EX_CONFIG
            _ if self.is_provisioning() => 69,                 // EX_UNAVAILABLE
            Self::NotGitRepo | Self::GitOperation { .. } => 65, // EX_DATAERR
            Self::PushRejected { .. } => 75,                    // EX_TEMPFAIL
            _ => 1,
        }
    }
}
