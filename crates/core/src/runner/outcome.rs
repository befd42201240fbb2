//! Transient result of one runner invocation.

use serde::{Deserialize, Serialize};

/// How the external process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Exit code 0.
    Passed,
    /// Non-zero exit code (Robot reports the number of failed tests).
    Failed,
    /// Killed after exceeding its timeout.
    TimedOut,
    /// Killed because cancellation was requested.
    Cancelled,
    /// Terminated by a signal without an exit code.
    Crashed,
}

/// A file produced by the run, read into memory before scratch cleanup.
#[derive(Debug, Clone)]
pub struct ProducedArtifact {
    pub name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

impl ProducedArtifact {
    /// Build an artifact, inferring the content type from the file name.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        let content_type = content_type_for(&name);
        Self {
            name,
            content_type,
            bytes,
        }
    }
}

/// Captured result of a runner invocation.
///
/// Consumed once by the dispatcher to populate a run record.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    /// `None` when the process was killed or crashed.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub artifacts: Vec<ProducedArtifact>,
    /// Human-readable reason for timeouts, cancellations and crashes.
    pub error: Option<String>,
}

impl ExecutionOutcome {
    /// Look up a produced artifact by file name.
    pub fn artifact(&self, name: &str) -> Option<&ProducedArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// Console transcript (stdout followed by stderr), or `None` if both
    /// streams were empty.
    pub fn console_transcript(&self) -> Option<String> {
        if self.stdout.is_empty() && self.stderr.is_empty() {
            return None;
        }
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len() + 32);
        text.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("--- stderr ---\n");
            text.push_str(&self.stderr);
        }
        Some(text)
    }
}

/// MIME type for the files a run produces.
pub fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("xml") => "application/xml",
        Some("html") => "text/html",
        Some("txt") | Some("log") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(stdout: &str, stderr: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            status: OutcomeStatus::Passed,
            exit_code: Some(0),
            duration_ms: 10,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            artifacts: vec![ProducedArtifact::new("log.html", b"<html/>".to_vec())],
            error: None,
        }
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("output.xml"), "application/xml");
        assert_eq!(content_type_for("log.html"), "text/html");
        assert_eq!(content_type_for("console.txt"), "text/plain");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn artifact_lookup_by_name() {
        let o = outcome("", "");
        assert!(o.artifact("log.html").is_some());
        assert!(o.artifact("report.html").is_none());
    }

    #[test]
    fn transcript_empty_when_no_output() {
        assert!(outcome("", "").console_transcript().is_none());
    }

    #[test]
    fn transcript_separates_stderr() {
        let text = outcome("PASS", "warn").console_transcript().unwrap_or_default();
        assert_eq!(text, "PASS\n--- stderr ---\nwarn");
    }
}
