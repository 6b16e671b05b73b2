use std::{fmt, path::PathBuf};

use serde::Serialize;

/// `<mapped key>#<attempt>`, where attempt counts qualifying writes to the
/// key while it is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(key: &str, attempt: u64) -> Self {
        JobId(format!("{key}#{attempt}"))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversionFailure {
    #[error("converter could not be started: {message}")]
    StartError { message: String },

    #[error("converter exited with code {code:?} (signal {signal:?})")]
    ExitError {
        code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    #[error("converter did not finish within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("converter succeeded but left no artifact at {output}")]
    MissingArtifact { output: String },
}

impl ConversionFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            ConversionFailure::StartError { .. } => "start_error",
            ConversionFailure::ExitError { .. } => "exit_error",
            ConversionFailure::Timeout { .. } => "timeout",
            ConversionFailure::MissingArtifact { .. } => "missing_artifact",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "failure", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Spawning,
    Running,
    Succeeded,
    Failed(ConversionFailure),
    Superseded,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed(_) | JobState::Superseded
        )
    }

    /// Label used for logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Spawning => "spawning",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed(failure) => failure.kind(),
            JobState::Superseded => "superseded",
        }
    }
}

/// Captured converter output, capped at a configured number of bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub text: String,
    pub dropped_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub key: String,
    pub output_key: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(flatten)]
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub stdout: Option<CapturedOutput>,
    pub stderr: Option<CapturedOutput>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}
