//! Pipeline error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

/// Failure classes surfaced by the pipeline. Every terminal state carries
/// either a result or one of these; nothing is silently dropped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid {format}: {detail}", path.display())]
    Format {
        path: PathBuf,
        format: &'static str,
        detail: String,
    },

    #[error("code generation failed: {0}")]
    Generation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("workspace error: {0}")]
    Resource(String),

    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

/// Terminal failure kind attached to an `ExecutionResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Interpreter exited nonzero.
    Execution,
    /// Wall-clock timeout; the process was killed.
    Timeout,
}
