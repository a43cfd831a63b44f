//! Extension error types.

use std::path::PathBuf;

use crate::extension::ExtensionId;

/// Errors from extension discovery, compilation, sandboxing and lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// The manifest is missing, unreadable, malformed, or lacks a required field.
    #[error("invalid manifest {path}: {message}")]
    ManifestInvalid {
        /// Path of the manifest file.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },

    /// The manifest's entry file does not exist.
    #[error("entry file not found: {0}")]
    EntryNotFound(PathBuf),

    /// The entry source could not be parsed or transformed.
    #[error("compile error in {path}: {message}")]
    CompileError {
        /// Source file that failed.
        path: PathBuf,
        /// Diagnostics joined into one message.
        message: String,
    },

    /// A filesystem request resolved outside the extension root.
    #[error("access denied for {requested}: {reason}")]
    AccessDenied {
        /// The path as requested.
        requested: String,
        /// Why it was refused.
        reason: String,
    },

    /// Sandboxed code exceeded its execution budget.
    #[error("extension {id} timed out during {phase} after {limit_ms}ms")]
    SandboxTimeout {
        /// The offending extension.
        id: ExtensionId,
        /// Which phase ran out of time (`run`, `init`, `handler`, ...).
        phase: &'static str,
        /// The limit that was exceeded.
        limit_ms: u64,
    },

    /// No initializer could be located.
    #[error("extension {0} exports no init function")]
    EntrypointMissing(ExtensionId),

    /// Two different functions claim the same export.
    #[error("extension {id} defines {export} both at top level and in module.exports")]
    EntrypointAmbiguous {
        /// The offending extension.
        id: ExtensionId,
        /// Export name (`init` or `cleanup`).
        export: &'static str,
    },

    /// The cleanup export threw or timed out. Logged, never fatal.
    #[error("cleanup failed for extension {id}: {message}")]
    CleanupFailed {
        /// The extension being unloaded.
        id: ExtensionId,
        /// Failure reason.
        message: String,
    },

    /// Sandboxed code threw during execution or initialization.
    #[error("extension {id} failed: {message}")]
    ExecutionFailed {
        /// The offending extension.
        id: ExtensionId,
        /// Exception message.
        message: String,
    },

    /// The sandbox worker could not be started or has gone away.
    #[error("sandbox unavailable for extension {id}: {message}")]
    SandboxUnavailable {
        /// The affected extension.
        id: ExtensionId,
        /// Failure reason.
        message: String,
    },

    /// The extension is not loaded, or its directory does not exist.
    #[error("extension not found: {0}")]
    NotFound(ExtensionId),

    /// The extension is already loaded.
    #[error("extension already loaded: {0}")]
    AlreadyLoaded(ExtensionId),

    /// A declared dependency is not active.
    #[error("extension {id} depends on {dependency}, which is not loaded")]
    DependencyUnavailable {
        /// The dependent extension.
        id: ExtensionId,
        /// The missing dependency.
        dependency: String,
    },

    /// The extension directory name is not a usable identifier.
    #[error("invalid extension id: {0}")]
    InvalidId(String),

    /// A registered route or static mount cannot be installed.
    #[error("invalid route for extension {id}: {message}")]
    InvalidRoute {
        /// The offending extension.
        id: ExtensionId,
        /// What was wrong.
        message: String,
    },

    /// A lifecycle transition that the state machine forbids.
    #[error("extension {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The affected extension.
        id: ExtensionId,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtensionError {
    /// Stable name of the error kind, used in reports and the HTTP API.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ManifestInvalid { .. } => "ManifestInvalid",
            Self::EntryNotFound(_) => "EntryNotFound",
            Self::CompileError { .. } => "CompileError",
            Self::AccessDenied { .. } => "AccessDenied",
            Self::SandboxTimeout { .. } => "SandboxTimeout",
            Self::EntrypointMissing(_) => "EntrypointMissing",
            Self::EntrypointAmbiguous { .. } => "EntrypointAmbiguous",
            Self::CleanupFailed { .. } => "CleanupFailed",
            Self::ExecutionFailed { .. } => "ExecutionFailed",
            Self::SandboxUnavailable { .. } => "SandboxUnavailable",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyLoaded(_) => "AlreadyLoaded",
            Self::DependencyUnavailable { .. } => "DependencyUnavailable",
            Self::InvalidId(_) => "InvalidId",
            Self::InvalidRoute { .. } => "InvalidRoute",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::Io(_) => "Io",
        }
    }
}

/// Result type for extension operations.
pub type ExtensionResult<T> = Result<T, ExtensionError>;
