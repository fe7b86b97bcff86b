//! Engine-level error taxonomy.

use crate::backup::BackupError;
use crate::runner::RunError;
use crate::transform::TransformError;
use thiserror::Error;

/// Errors surfaced on an asset or returned to callers of the engine.
///
/// Cloneable so the same outcome can be stored on the asset, logged and sent
/// to any number of waiting callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The source vanished (or could not be fetched) before processing started
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// No transform implementation exists for this asset type
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    /// The operation is not valid for this asset type or its parameters are out of range
    #[error("{operation} is not possible for {target}")]
    InvalidOperation { operation: String, target: String },

    /// The marker says the file is already our own output
    #[error("Already optimised")]
    AlreadyOptimised { bytes: u64 },

    /// The tool succeeded but the output is not smaller than the input
    #[error("Result is not smaller ({new_bytes} >= {old_bytes} bytes)")]
    ResultNotSmaller { old_bytes: u64, new_bytes: u64 },

    /// The external binary could not be started
    #[error("Could not launch {command}: {reason}")]
    ToolLaunchFailed { command: String, reason: String },

    /// The external binary failed after all retries
    #[error("{command} failed: {summary}")]
    ToolExitedNonZero { command: String, code: Option<i32>, summary: String },

    /// Terminated by the engine itself
    #[error("Cancelled")]
    Cancelled,

    /// Backup is missing or the atomic replace failed
    #[error("Backup or restore failed: {0}")]
    BackupOrRestoreFailed(String),

    #[error("No asset with id {0}")]
    UnknownAsset(String),

    #[error("Engine is shut down")]
    Closed,
}

impl EngineError {
    /// Recoverable outcomes become a notice on the asset rather than an error.
    pub fn is_notice(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyOptimised { .. }
                | EngineError::ResultNotSmaller { .. }
                | EngineError::Cancelled
        )
    }

    /// Bytes to report for recoverable outcomes as `(old, new)`.
    pub fn settled_bytes(&self) -> Option<(u64, u64)> {
        match self {
            EngineError::AlreadyOptimised { bytes } => Some((*bytes, *bytes)),
            EngineError::ResultNotSmaller { old_bytes, .. } => Some((*old_bytes, *old_bytes)),
            _ => None,
        }
    }
}

impl From<RunError> for EngineError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::LaunchFailed { command, source } => EngineError::ToolLaunchFailed {
                command,
                reason: source.to_string(),
            },
            RunError::ExitedNonZero {
                command,
                code,
                stderr,
                ..
            } => EngineError::ToolExitedNonZero {
                summary: summarise_stderr(&stderr, code),
                command,
                code,
            },
            RunError::TimedOut { command, after } => EngineError::ToolExitedNonZero {
                command,
                code: None,
                summary: format!("timed out after {}s", after.as_secs()),
            },
            RunError::Cancelled { .. } => EngineError::Cancelled,
            RunError::Capture(e) => EngineError::ToolExitedNonZero {
                command: "output capture".to_string(),
                code: None,
                summary: e.to_string(),
            },
        }
    }
}

impl From<BackupError> for EngineError {
    fn from(e: BackupError) -> Self {
        EngineError::BackupOrRestoreFailed(e.to_string())
    }
}

impl From<TransformError> for EngineError {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::Unsupported(asset_type) => {
                EngineError::UnsupportedType(asset_type.to_string())
            }
            TransformError::InvalidOperation { operation, target } => {
                EngineError::InvalidOperation { operation, target }
            }
        }
    }
}

/// Short human-readable summary: the last non-empty stderr line.
fn summarise_stderr(stderr: &str, code: Option<i32>) -> String {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty());
    match (line, code) {
        (Some(line), _) => {
            let mut summary: String = line.chars().take(200).collect();
            if line.chars().count() > 200 {
                summary.push('…');
            }
            summary
        }
        (None, Some(code)) => format!("exited with code {}", code),
        (None, None) => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_notice_classification() {
        assert!(EngineError::Cancelled.is_notice());
        assert!(EngineError::AlreadyOptimised { bytes: 1 }.is_notice());
        assert!(EngineError::ResultNotSmaller { old_bytes: 1, new_bytes: 2 }.is_notice());
        assert!(!EngineError::SourceNotFound("x".into()).is_notice());
        assert!(!EngineError::ToolExitedNonZero {
            command: "gs".into(),
            code: Some(1),
            summary: "boom".into()
        }
        .is_notice());
    }

    #[test]
    fn test_exit_error_summary_uses_last_stderr_line() {
        let err: EngineError = RunError::ExitedNonZero {
            command: "pngquant".into(),
            args: vec![],
            code: Some(99),
            stdout: String::new(),
            stderr: "warning: foo\n  error: quality too low  \n\n".into(),
        }
        .into();
        assert_eq!(
            err,
            EngineError::ToolExitedNonZero {
                command: "pngquant".into(),
                code: Some(99),
                summary: "error: quality too low".into()
            }
        );
    }

    #[test]
    fn test_timeout_maps_to_tool_failure() {
        let err: EngineError = RunError::TimedOut {
            command: "ffmpeg".into(),
            after: Duration::from_secs(30),
        }
        .into();
        assert!(matches!(err, EngineError::ToolExitedNonZero { code: None, .. }));
        assert!(err.to_string().contains("timed out after 30s"));
    }

    #[test]
    fn test_cancelled_run_maps_to_cancelled() {
        let err: EngineError = RunError::Cancelled { command: "gs".into() }.into();
        assert_eq!(err, EngineError::Cancelled);
    }
}
