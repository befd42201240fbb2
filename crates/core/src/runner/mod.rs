//! Runner adapter for the external Robot Framework executable.
//!
//! [`robot::RobotRunner`] materialises a suite and its variables in a
//! per-run scratch directory, invokes the executable through
//! [`subprocess::run_command`], collects the standard output files, and
//! removes the scratch directory on every exit path. The dispatcher talks to
//! it only through the [`TestRunner`] trait so tests can substitute fakes.

pub mod options;
pub mod outcome;
pub mod robot;
pub mod scratch;
pub mod subprocess;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use outcome::{ExecutionOutcome, OutcomeStatus, ProducedArtifact};

/// Robot's machine-readable result file.
pub const OUTPUT_XML: &str = "output.xml";

/// Robot's human-readable log.
pub const LOG_HTML: &str = "log.html";

/// Robot's summary report.
pub const REPORT_HTML: &str = "report.html";

/// The three files a run is expected to produce, in collection order.
pub const STANDARD_OUTPUTS: [&str; 3] = [OUTPUT_XML, LOG_HTML, REPORT_HTML];

/// One execution request handed to a [`TestRunner`].
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Script name, used only for log context.
    pub script_name: String,
    /// Full `.robot` suite source.
    pub script_content: String,
    /// Case variables (JSON object or null).
    pub variables: serde_json::Value,
    /// Opaque execution config carried by the queue item / request.
    pub config: serde_json::Value,
    /// Hard wall-clock limit for the external process.
    pub timeout: Duration,
}

/// Errors that prevent a run from producing any outcome at all.
///
/// Timeouts, cancellations and non-zero exits are *not* errors: they are
/// reported through [`ExecutionOutcome::status`] so partial artifacts can
/// still be persisted.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Invalid execution config: {0}")]
    InvalidConfig(String),

    #[error("Failed to prepare scratch directory {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while waiting for runner: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes one test case and reports a structured outcome.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run `request` to completion, timeout, or cancellation.
    ///
    /// `cancel` is checked at every wait point; when it fires the child
    /// process is killed and the outcome status is
    /// [`OutcomeStatus::Cancelled`].
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, RunnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_names_program() {
        let err = RunnerError::Spawn {
            program: "robot".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.to_string(), "Failed to spawn `robot`: no such file");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn standard_outputs_are_distinct() {
        let mut names = STANDARD_OUTPUTS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), STANDARD_OUTPUTS.len());
    }
}
