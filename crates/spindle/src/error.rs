//! Error types for pipeline construction and execution.
//!
//! Only `Spawn` surfaces from a running pipeline: a read or write against a
//! pipe closed by its peer (or by limit/timeout enforcement) is recovered
//! locally inside the affected stage loop and never propagates. Timeout and
//! byte-limit truncation are deliberate, successful outcomes, not errors.

use thiserror::Error;

/// Errors from building or running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The OS failed to create a stage's process (missing binary, bad argv,
    /// permission denied). Fatal: `run` returns no partial output.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// The command line that failed to spawn.
        command: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A command line was empty or had unbalanced quoting.
    #[error("unusable command line: {0:?}")]
    EmptyCommand(String),

    /// `run` was called on a pipeline with no stages.
    #[error("pipeline has no stages")]
    EmptyPipeline,

    /// `run` was called on a pipeline that already ran (or is running).
    /// Construct a new pipeline instead.
    #[error("pipeline already ran")]
    AlreadyRan,

    /// A background run's task could not be joined.
    #[error("background run aborted: {0}")]
    Aborted(String),
}
