//! Error taxonomy for the reconstruction pipeline
//!
//! Every failure is a `QsmError`. `QsmError::kind` folds it onto the
//! coarse `FailureKind` used for the end-of-execution summary and the
//! process exit code.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised anywhere in the pipeline
#[derive(Debug, Error)]
pub enum QsmError {
    /// Invalid or incompatible plan fields
    #[error("configuration error: {0}")]
    Config(String),

    /// A premade or override names an option that does not exist
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    /// Nothing usable was found under the input root
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A Run's inputs are unusable (missing phase, bad sidecar, ...)
    #[error("input error: {0}")]
    Input(String),

    /// Two volumes disagree on shape or voxel size
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// NIfTI decoding or encoding failed
    #[error("NIfTI error on '{}': {message}", path.display())]
    Nifti { path: PathBuf, message: String },

    #[error("JSON error on '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Mandatory masking produced an empty mask or BET failed
    #[error("masking failed: {0}")]
    MaskingFailed(String),

    /// External tool exited nonzero or did not produce its outputs
    #[error("tool '{tool}' failed ({status}): {detail}")]
    ToolFailure {
        tool: String,
        status: String,
        detail: String,
    },

    /// A stage exceeded its wall-clock budget
    #[error("stage '{stage}' timed out after {limit:?}")]
    TimedOut { stage: String, limit: Duration },

    /// The Run was cancelled before this stage could start
    #[error("cancelled")]
    Cancelled,
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, QsmError>;

/// Coarse failure classes reported in summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    ConfigError,
    DiscoveryWarning,
    InputError,
    MaskingFailed,
    ToolFailure,
    TimedOut,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::ConfigError => "ConfigError",
            FailureKind::DiscoveryWarning => "DiscoveryWarning",
            FailureKind::InputError => "InputError",
            FailureKind::MaskingFailed => "MaskingFailed",
            FailureKind::ToolFailure => "ToolFailure",
            FailureKind::TimedOut => "TimedOut",
            FailureKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

impl QsmError {
    pub fn kind(&self) -> FailureKind {
        match self {
            QsmError::Config(_) | QsmError::UnknownOption(_) => FailureKind::ConfigError,
            QsmError::Discovery(_) => FailureKind::DiscoveryWarning,
            QsmError::Input(_)
            | QsmError::ShapeMismatch(_)
            | QsmError::Io { .. }
            | QsmError::Nifti { .. }
            | QsmError::Json { .. } => FailureKind::InputError,
            QsmError::MaskingFailed(_) => FailureKind::MaskingFailed,
            QsmError::ToolFailure { .. } => FailureKind::ToolFailure,
            QsmError::TimedOut { .. } => FailureKind::TimedOut,
            QsmError::Cancelled => FailureKind::Cancelled,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QsmError::Io { path: path.into(), source }
    }

    pub(crate) fn nifti(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        QsmError::Nifti { path: path.into(), message: message.into() }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        QsmError::Json { path: path.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(QsmError::UnknownOption("x".into()).kind(), FailureKind::ConfigError);
        assert_eq!(QsmError::ShapeMismatch("a".into()).kind(), FailureKind::InputError);
        assert_eq!(
            QsmError::TimedOut { stage: "rts".into(), limit: Duration::from_secs(1) }.kind(),
            FailureKind::TimedOut
        );
        assert_eq!(
            QsmError::io("/tmp/x", std::io::Error::from(std::io::ErrorKind::NotFound)).kind(),
            FailureKind::InputError
        );
    }

    #[test]
    fn test_display_includes_path() {
        let err = QsmError::nifti("/data/phase.nii", "bad magic");
        let msg = err.to_string();
        assert!(msg.contains("/data/phase.nii"), "message should name the file: {}", msg);
        assert!(msg.contains("bad magic"));
    }
}
