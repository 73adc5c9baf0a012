//! Typed error hierarchy shared by every mlrt crate.
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! so the CLI can exit with a meaningful status and callers can branch on the
//! failure class without string matching.

use std::path::PathBuf;

use crate::backend::BackendKind;

/// All errors originating from mlrt.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid tiling: {0}")]
    InvalidTiling(String),

    #[error("Tile {axis} of {size} is not divisible by the model alignment {multiple}")]
    AlignmentViolation {
        axis: &'static str,
        size: u32,
        multiple: u32,
    },

    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),

    #[error("{backend} cannot consume an in-memory network; a filesystem path is required")]
    UnsupportedArtifact { backend: BackendKind },

    // ── Graph patching ───────────────────────────────────────────────
    #[error("Failed to decode network graph: {0}")]
    GraphDecode(String),

    #[error(
        "Incompatible network graph: expected {expected} constants matching '{pattern}', found {found}"
    )]
    PatternMismatch {
        pattern: String,
        expected: usize,
        found: usize,
    },

    #[error("Graph patch error: {0}")]
    GraphPatch(String),

    // ── Engine cache / compilation ───────────────────────────────────
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine compilation failed: {message}{}", log_hint(log))]
    CompileFailed {
        message: String,
        log: Option<PathBuf>,
    },

    #[error("Engine compiler unavailable: {0}")]
    CompilerUnavailable(String),

    // ── Dispatch ─────────────────────────────────────────────────────
    #[error("Inference failed on {backend}: {message}")]
    Inference {
        backend: BackendKind,
        message: String,
    },

    #[error("No runtime registered for the {0} call contract")]
    RuntimeUnavailable(BackendKind),

    #[error("{0} requires a compiled engine but no engine builder is configured")]
    EngineUnavailable(BackendKind),
}

fn log_hint(log: &Option<PathBuf>) -> String {
    match log {
        Some(path) => format!(" (see log at {})", path.display()),
        None => String::new(),
    }
}

impl EngineError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable integer error code.
    ///
    /// - 1xx: configuration
    /// - 2xx: graph patch integrity
    /// - 3xx: engine cache / compiler
    /// - 4xx: dispatch
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InvalidTiling(_) => 100,
            Self::AlignmentViolation { .. } => 101,
            Self::InvalidConfig(_) => 102,
            Self::UnsupportedArtifact { .. } => 103,
            Self::GraphDecode(_) => 200,
            Self::PatternMismatch { .. } => 201,
            Self::GraphPatch(_) => 202,
            Self::Io { .. } => 300,
            Self::CompileFailed { .. } => 301,
            Self::CompilerUnavailable(_) => 302,
            Self::Inference { .. } => 400,
            Self::RuntimeUnavailable(_) => 401,
            Self::EngineUnavailable(_) => 402,
        }
    }

    /// Whether a different backend could plausibly succeed where this one
    /// failed (compiler and dispatch classes).
    pub fn is_recoverable(&self) -> bool {
        self.error_code() >= 300
    }
}

/// Convenience alias used throughout mlrt.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_failure_mentions_log_location() {
        let err = EngineError::CompileFailed {
            message: "trtexec exited with status 1".into(),
            log: Some(PathBuf::from("/tmp/trtexec_1.log")),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 1"));
        assert!(msg.contains("/tmp/trtexec_1.log"));
        assert_eq!(err.error_code(), 301);
    }

    #[test]
    fn codes_group_by_class() {
        assert!(!EngineError::InvalidTiling("x".into()).is_recoverable());
        assert!(!EngineError::GraphPatch("x".into()).is_recoverable());
        assert!(EngineError::CompilerUnavailable("x".into()).is_recoverable());
        assert_eq!(
            EngineError::RuntimeUnavailable(BackendKind::NcnnVk).error_code(),
            401
        );
    }
}
