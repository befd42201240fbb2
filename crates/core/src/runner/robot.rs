//! [`TestRunner`] implementation that shells out to Robot Framework.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::options::RobotOptions;
use super::scratch::ScratchDir;
use super::subprocess::{self, CommandExit};
use super::{
    ExecutionOutcome, OutcomeStatus, ProducedArtifact, RunRequest, RunnerError, TestRunner,
    LOG_HTML, OUTPUT_XML, REPORT_HTML, STANDARD_OUTPUTS,
};

/// Suite file name inside the scratch directory.
const SUITE_FILE: &str = "suite.robot";

/// Variable file name inside the scratch directory.
const VARIABLES_FILE: &str = "variables.json";

/// Output directory name inside the scratch directory.
const OUTPUT_DIR: &str = "output";

/// How to invoke the Robot executable.
#[derive(Debug, Clone)]
pub struct RobotRunnerConfig {
    /// Program to execute (default `robot`).
    pub program: String,
    /// Arguments placed before the generated ones (e.g. `-m robot` when
    /// the program is `python3`).
    pub base_args: Vec<String>,
    /// Directory under which per-run scratch directories are created.
    pub scratch_root: PathBuf,
}

impl Default for RobotRunnerConfig {
    fn default() -> Self {
        Self {
            program: "robot".to_string(),
            base_args: Vec::new(),
            scratch_root: std::env::temp_dir(),
        }
    }
}

/// Runs suites with the external Robot Framework executable.
#[derive(Debug, Clone)]
pub struct RobotRunner {
    config: RobotRunnerConfig,
}

impl RobotRunner {
    pub fn new(config: RobotRunnerConfig) -> Self {
        Self { config }
    }

    /// Build the full command line. `--outputdir` always comes first after
    /// the base arguments.
    fn build_command(
        &self,
        suite: &Path,
        variables: &Path,
        output_dir: &Path,
        options: &RobotOptions,
    ) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.base_args)
            .arg("--outputdir")
            .arg(output_dir)
            .args(["--output", OUTPUT_XML, "--log", LOG_HTML, "--report", REPORT_HTML])
            .arg("--variablefile")
            .arg(variables)
            .args(options.to_args())
            .arg(suite);
        cmd
    }

    async fn run_in(
        &self,
        scratch: &Path,
        request: &RunRequest,
        options: &RobotOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RunnerError> {
        let suite = scratch.join(SUITE_FILE);
        let variables = scratch.join(VARIABLES_FILE);
        let output_dir = scratch.join(OUTPUT_DIR);

        tokio::fs::write(&suite, request.script_content.as_bytes()).await?;
        tokio::fs::write(&variables, variables_json(&request.variables)?).await?;
        tokio::fs::create_dir_all(&output_dir).await?;

        let mut cmd = self.build_command(&suite, &variables, &output_dir, options);
        cmd.current_dir(scratch);

        let output = subprocess::run_command(&mut cmd, request.timeout, cancel).await?;
        let artifacts = collect_artifacts(&output_dir).await;

        let (status, exit_code, error) = match output.exit {
            CommandExit::Exited(Some(0)) => (OutcomeStatus::Passed, Some(0), None),
            CommandExit::Exited(Some(code)) => (OutcomeStatus::Failed, Some(code), None),
            CommandExit::Exited(None) => (
                OutcomeStatus::Crashed,
                None,
                Some("Runner process was terminated by a signal".to_string()),
            ),
            CommandExit::TimedOut => (
                OutcomeStatus::TimedOut,
                None,
                Some(format!(
                    "Run timed out after {}ms (limit {}ms)",
                    output.duration_ms,
                    request.timeout.as_millis()
                )),
            ),
            CommandExit::Cancelled => (
                OutcomeStatus::Cancelled,
                None,
                Some("Run cancelled before completion".to_string()),
            ),
        };

        Ok(ExecutionOutcome {
            status,
            exit_code,
            duration_ms: output.duration_ms,
            stdout: output.stdout,
            stderr: output.stderr,
            artifacts,
            error,
        })
    }
}

#[async_trait]
impl TestRunner for RobotRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, RunnerError> {
        let options = RobotOptions::from_config(&request.config)
            .map_err(|e| RunnerError::InvalidConfig(e.to_string()))?;

        let scratch = ScratchDir::create(&self.config.scratch_root).await?;
        tracing::debug!(
            script = %request.script_name,
            scratch = %scratch.path().display(),
            timeout_ms = request.timeout.as_millis() as u64,
            "Starting robot run",
        );

        let result = self.run_in(scratch.path(), &request, &options, &cancel).await;
        scratch.cleanup().await;

        if let Ok(outcome) = &result {
            tracing::debug!(
                script = %request.script_name,
                status = ?outcome.status,
                exit_code = ?outcome.exit_code,
                duration_ms = outcome.duration_ms,
                artifacts = outcome.artifacts.len(),
                "Robot run finished",
            );
        }
        result
    }
}

/// Serialize case variables as a Robot JSON variable file.
fn variables_json(variables: &Value) -> Result<Vec<u8>, RunnerError> {
    match variables {
        Value::Null => Ok(b"{}".to_vec()),
        Value::Object(_) => serde_json::to_vec_pretty(variables)
            .map_err(|e| RunnerError::InvalidConfig(format!("Unserializable variables: {e}"))),
        _ => Err(RunnerError::InvalidConfig(
            "Case variables must be a JSON object".into(),
        )),
    }
}

/// Read whichever standard output files exist. Unreadable files are logged
/// and skipped.
async fn collect_artifacts(output_dir: &Path) -> Vec<ProducedArtifact> {
    let mut artifacts = Vec::new();
    for name in STANDARD_OUTPUTS {
        let path = output_dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => artifacts.push(ProducedArtifact::new(name, bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Failed to read runner output file");
            }
        }
    }
    artifacts
}
