use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use oxiscan_model::{BatchId, JobId, JobStatus, TerminalState, ToolKind};
use serde::{Deserialize, Serialize};

/// One tool invocation inside a domain's scan plan.
///
/// `command` is a fully resolved argument vector; the orchestrator performs
/// no interpolation, so any domain substitution has already happened by the
/// time a plan is submitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCommand {
    pub tool: ToolKind,
    pub command: Vec<String>,
    /// Working directory inherited by the spawned process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// When set, the spawned process sees exactly these variables instead of
    /// the parent environment. Passed through verbatim.
    #[serde(default)]
    pub env: Option<Vec<(String, String)>>,
    /// Per-job wall-clock budget; falls back to the orchestrator default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ToolCommand {
    pub fn new(tool: ToolKind, command: Vec<String>) -> Self {
        Self {
            tool,
            command,
            cwd: None,
            env: None,
            timeout_secs: None,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// The ordered set of tool commands to execute against one domain.
///
/// Supplied by the caller's configuration store; read-only to the
/// orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainScanPlan {
    pub domain: String,
    pub tools: Vec<ToolCommand>,
}

impl DomainScanPlan {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, command: ToolCommand) -> Self {
        self.tools.push(command);
        self
    }
}

/// One fully assembled execution attempt, ready for a [`ToolRunner`].
///
/// [`ToolRunner`]: crate::scan::runner::ToolRunner
#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub batch: Option<BatchId>,
    pub domain: String,
    pub tool: ToolKind,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Option<Vec<(String, String)>>,
    pub timeout: Duration,
}

impl Job {
    pub fn new(
        domain: impl Into<String>,
        tool: ToolKind,
        command: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: JobId::new(),
            batch: None,
            domain: domain.into(),
            tool,
            command,
            cwd: None,
            env: None,
            timeout,
        }
    }

    pub(crate) fn from_plan(
        batch: BatchId,
        domain: &str,
        entry: &ToolCommand,
        default_timeout: Duration,
    ) -> Self {
        Self {
            id: JobId::new(),
            batch: Some(batch),
            domain: domain.to_string(),
            tool: entry.tool.clone(),
            command: entry.command.clone(),
            cwd: entry.cwd.clone(),
            env: entry.env.clone(),
            timeout: entry
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        }
    }
}

/// Envelope persisted in the job registry for each execution attempt.
///
/// Environment values are never recorded, only the provided key names.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub batch: Option<BatchId>,
    pub domain: String,
    pub tool: ToolKind,
    pub command: Vec<String>,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub log_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub env_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job: &Job) -> Self {
        let now = Utc::now();
        Self {
            id: job.id,
            batch: job.batch,
            domain: job.domain.clone(),
            tool: job.tool.clone(),
            command: job.command.clone(),
            pid: None,
            status: JobStatus::Pending,
            exit_code: None,
            error: None,
            log_path: None,
            cwd: job.cwd.clone(),
            env_keys: job
                .env
                .as_deref()
                .map(|vars| vars.iter().map(|(key, _)| key.clone()).collect())
                .unwrap_or_default(),
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Terminal outcome of one job, handed back to the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalResult {
    pub job_id: JobId,
    pub domain: String,
    pub tool: ToolKind,
    pub state: TerminalState,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    /// Path of the job's append-only log file, when any output was captured.
    pub log: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl TerminalResult {
    pub fn status(&self) -> JobStatus {
        self.state.status()
    }
}

/// Final per-domain view inside a batch outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DomainOutcome {
    /// The domain was submitted without any configured tool commands.
    NoConfiguration,
    /// Every submitted tool reached a terminal state; results are in
    /// submission order.
    Scanned { results: Vec<TerminalResult> },
}

impl DomainOutcome {
    pub fn results(&self) -> &[TerminalResult] {
        match self {
            DomainOutcome::NoConfiguration => &[],
            DomainOutcome::Scanned { results } => results,
        }
    }

    /// First terminal result recorded for `tool`, if the plan contained it.
    pub fn result_for(&self, tool: &ToolKind) -> Option<&TerminalResult> {
        self.results().iter().find(|result| &result.tool == tool)
    }
}

/// Counts of terminal states across a finished batch.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub errored: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub(crate) fn record(&mut self, state: &TerminalState) {
        self.total += 1;
        match state {
            TerminalState::Completed => self.completed += 1,
            TerminalState::Failed { .. } => self.failed += 1,
            TerminalState::Error { .. } => self.errored += 1,
            TerminalState::TimedOut => self.timed_out += 1,
            TerminalState::Cancelled => self.cancelled += 1,
        }
    }
}

/// Aggregate result of one batch: every domain's outcome plus timing and a
/// terminal-state summary. Handed to the caller once all jobs are terminal;
/// the orchestrator keeps nothing afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    pub domains: BTreeMap<String, DomainOutcome>,
    pub summary: BatchSummary,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl BatchOutcome {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }

    pub fn outcome(&self, domain: &str) -> Option<&DomainOutcome> {
        self.domains.get(domain)
    }

    pub fn result(&self, domain: &str, tool: &ToolKind) -> Option<&TerminalResult> {
        self.domains.get(domain)?.result_for(tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(tool: ToolKind, state: TerminalState) -> TerminalResult {
        TerminalResult {
            job_id: JobId::new(),
            domain: "example.com".to_string(),
            tool,
            exit_code: None,
            error: state.message(),
            log: None,
            started_at: None,
            finished_at: Utc::now(),
            state,
        }
    }

    #[test]
    fn summary_counts_every_state_once() {
        let mut summary = BatchSummary::default();
        summary.record(&TerminalState::Completed);
        summary.record(&TerminalState::Failed { exit_code: 2 });
        summary.record(&TerminalState::TimedOut);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.cancelled, 0);
    }

    #[test]
    fn domain_outcome_lookup_finds_first_match_by_tool() {
        let outcome = DomainOutcome::Scanned {
            results: vec![
                result(ToolKind::NetworkScan, TerminalState::Completed),
                result(ToolKind::XssTest, TerminalState::TimedOut),
            ],
        };
        assert!(
            outcome
                .result_for(&ToolKind::XssTest)
                .is_some_and(|r| r.state == TerminalState::TimedOut)
        );
        assert!(outcome.result_for(&ToolKind::SqlInjection).is_none());
        assert!(DomainOutcome::NoConfiguration.results().is_empty());
    }

    #[test]
    fn plan_entries_override_the_default_timeout() {
        let entry = ToolCommand::new(
            ToolKind::NetworkScan,
            vec!["nmap".to_string(), "example.com".to_string()],
        )
        .with_timeout_secs(10);
        let job = Job::from_plan(
            BatchId::new(),
            "example.com",
            &entry,
            Duration::from_secs(600),
        );
        assert_eq!(job.timeout, Duration::from_secs(10));

        let entry = ToolCommand::new(ToolKind::NetworkScan, vec!["nmap".to_string()]);
        let job = Job::from_plan(
            BatchId::new(),
            "example.com",
            &entry,
            Duration::from_secs(600),
        );
        assert_eq!(job.timeout, Duration::from_secs(600));
    }

    #[test]
    fn record_captures_env_keys_but_not_values() {
        let mut job = Job::new(
            "example.com",
            ToolKind::Custom("probe".to_string()),
            vec!["probe".to_string()],
            Duration::from_secs(5),
        );
        job.env = Some(vec![("API_TOKEN".to_string(), "secret".to_string())]);
        let record = JobRecord::new(&job);
        assert_eq!(record.env_keys, vec!["API_TOKEN".to_string()]);
        assert!(!serde_json::to_string(&record).unwrap().contains("secret"));
    }
}
