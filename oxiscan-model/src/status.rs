use std::fmt;

/// Scheduler-visible lifecycle states for a job.
///
/// `Pending` and `Running` are transient; everything else is terminal and
/// never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Error,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::TimedOut => "timed-out",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

/// The terminal outcome of one job, carried back to the caller as a value
/// rather than signalled through errors.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", rename_all = "kebab-case"))]
pub enum TerminalState {
    /// Process exited zero with no termination request outstanding.
    Completed,
    /// Process exited nonzero on its own.
    Failed { exit_code: i32 },
    /// The process could not be spawned, or its output stream failed.
    Error { message: String },
    /// Wall-clock budget expired before the process exited.
    TimedOut,
    /// An operator stop request ended the job.
    Cancelled,
}

impl TerminalState {
    pub fn status(&self) -> JobStatus {
        match self {
            TerminalState::Completed => JobStatus::Completed,
            TerminalState::Failed { .. } => JobStatus::Failed,
            TerminalState::Error { .. } => JobStatus::Error,
            TerminalState::TimedOut => JobStatus::TimedOut,
            TerminalState::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TerminalState::Completed)
    }

    /// Human-readable description of every non-`Completed` outcome.
    pub fn message(&self) -> Option<String> {
        match self {
            TerminalState::Completed => None,
            TerminalState::Failed { exit_code } => {
                Some(format!("process exited with status {exit_code}"))
            }
            TerminalState::Error { message } => Some(message.clone()),
            TerminalState::TimedOut => Some("job timed out".to_string()),
            TerminalState::Cancelled => Some("job cancelled".to_string()),
        }
    }
}
