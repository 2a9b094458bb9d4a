use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use oxiscan_model::{JobStatus, TerminalState};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::ScanError;
use crate::scan::config::RunnerConfig;
use crate::scan::job::{Job, JobRecord, TerminalResult};
use crate::scan::logs::LogSink;
use crate::scan::manager::{JobTicket, ProcessManager};
use crate::scan::process::ProcessHandle;
use crate::scan::registry::JobRegistry;

/// Runs a single job end-to-end: admission, spawn, output streaming,
/// cancellation/timeout supervision, teardown, and registry bookkeeping.
///
/// `run` never fails: every path, including spawn errors and stop requests
/// observed before spawn, settles into a [`TerminalResult`] and a matching
/// terminal registry row.
#[derive(Clone, Debug)]
pub struct ToolRunner {
    manager: ProcessManager,
    registry: Arc<dyn JobRegistry>,
    logs: Arc<LogSink>,
    config: RunnerConfig,
}

/// What ended the supervision loop, when anything other than natural EOF
/// plus exit did.
enum Interrupt {
    Cancelled,
    TimedOut,
    Stream(String),
}

struct Execution {
    state: TerminalState,
    exit_code: Option<i32>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    log_path: Option<PathBuf>,
}

impl Execution {
    fn settled(state: TerminalState) -> Self {
        Self {
            state,
            exit_code: None,
            pid: None,
            started_at: None,
            log_path: None,
        }
    }
}

impl ToolRunner {
    pub fn new(
        manager: ProcessManager,
        registry: Arc<dyn JobRegistry>,
        logs: Arc<LogSink>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            logs,
            config,
        }
    }

    /// Admits and executes one job, returning its terminal result.
    pub async fn run(&self, job: Job) -> TerminalResult {
        match self.manager.register(job.id, &job.domain, &job.tool) {
            Ok(ticket) => self.run_admitted(job, ticket).await,
            Err(err) => self.reject(job, err).await,
        }
    }

    /// Precondition failures settle without a process ever spawning, but the
    /// rejection still lands in the registry so no submission is silently
    /// dropped.
    async fn reject(&self, job: Job, err: ScanError) -> TerminalResult {
        let message = err.to_string();
        warn!(job = %job.id, domain = %job.domain, tool = %job.tool, "job rejected: {message}");

        let mut record = JobRecord::new(&job);
        record.status = JobStatus::Error;
        record.error = Some(message.clone());
        record.finished_at = Some(Utc::now());
        record.touch();
        if let Err(persist_err) = self.registry.insert(record).await {
            warn!(job = %job.id, "failed to persist rejection: {persist_err}");
        }

        TerminalResult {
            job_id: job.id,
            domain: job.domain,
            tool: job.tool,
            exit_code: None,
            error: Some(message.clone()),
            log: None,
            started_at: None,
            finished_at: Utc::now(),
            state: TerminalState::Error { message },
        }
    }

    async fn run_admitted(&self, job: Job, ticket: JobTicket) -> TerminalResult {
        let mut record = JobRecord::new(&job);
        if let Err(err) = self.registry.insert(record.clone()).await {
            warn!(job = %job.id, "failed to persist pending row: {err}");
        }

        let execution = self.execute(&job, &ticket, &mut record).await;
        let error = execution.state.message();
        let finished_at = Utc::now();

        record.status = execution.state.status();
        record.pid = execution.pid.or(record.pid);
        record.exit_code = execution.exit_code;
        record.error = error.clone();
        record.log_path = execution.log_path.clone().or(record.log_path.take());
        record.started_at = execution.started_at.or(record.started_at);
        record.finished_at = Some(finished_at);
        record.touch();
        if let Err(err) = self.registry.update(record).await {
            error!(job = %job.id, "failed to persist terminal state: {err}");
        }

        match &execution.state {
            TerminalState::Completed => {
                info!(job = %job.id, domain = %job.domain, tool = %job.tool, "job completed");
            }
            state => {
                warn!(
                    job = %job.id,
                    domain = %job.domain,
                    tool = %job.tool,
                    status = %state.status(),
                    "job settled without completing: {}",
                    error.as_deref().unwrap_or("unknown"),
                );
            }
        }

        // Dropping the ticket releases the (domain, tool) slot only after the
        // terminal state is durable.
        drop(ticket);

        TerminalResult {
            job_id: job.id,
            domain: job.domain,
            tool: job.tool,
            exit_code: execution.exit_code,
            error,
            log: execution.log_path,
            started_at: execution.started_at,
            finished_at,
            state: execution.state,
        }
    }

    async fn execute(
        &self,
        job: &Job,
        ticket: &JobTicket,
        record: &mut JobRecord,
    ) -> Execution {
        let token = ticket.token();

        if job.command.is_empty() {
            return Execution::settled(TerminalState::Error {
                message: "precondition failed: command must not be empty".to_string(),
            });
        }
        if token.is_cancelled() {
            debug!(job = %job.id, "stop observed before spawn");
            return Execution::settled(TerminalState::Cancelled);
        }

        let mut writer = match self.logs.writer(job.id).await {
            Ok(writer) => writer,
            Err(err) => {
                return Execution::settled(TerminalState::Error {
                    message: format!("failed to open job log: {err}"),
                });
            }
        };
        let log_path = writer.path().to_path_buf();

        let mut handle = match ProcessHandle::spawn(
            &job.command,
            job.cwd.as_deref(),
            job.env.as_deref(),
            self.config.line_capacity,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                let mut execution = Execution::settled(TerminalState::Error {
                    message: err.to_string(),
                });
                execution.log_path = Some(log_path);
                return execution;
            }
        };
        let pid = handle.pid();
        let started_at = Utc::now();

        self.manager.set_running(job.id, pid);
        record.pid = Some(pid);
        record.status = JobStatus::Running;
        record.started_at = Some(started_at);
        record.log_path = Some(log_path.clone());
        record.touch();
        if let Err(err) = self.registry.update(record.clone()).await {
            warn!(job = %job.id, "failed to persist running state: {err}");
        }
        info!(job = %job.id, domain = %job.domain, tool = %job.tool, pid, "job running");

        let deadline = Instant::now() + job.timeout;
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut interrupt: Option<Interrupt> = None;
        loop {
            tokio::select! {
                line = handle.next_line() => match line {
                    Some(line) => {
                        if let Err(err) = writer.append_line(&line).await {
                            interrupt = Some(Interrupt::Stream(err.to_string()));
                            break;
                        }
                    }
                    // Both pipes hit EOF: all output is drained in order.
                    None => break,
                },
                _ = token.cancelled() => {
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                }
                _ = poll.tick() => {
                    if Instant::now() >= deadline {
                        interrupt = Some(Interrupt::TimedOut);
                        break;
                    }
                }
            }
        }

        let grace = self.config.term_grace();
        let mut exited: Option<ExitStatus> = None;
        if interrupt.is_none() {
            // Output fully drained; the process still has until the deadline
            // to exit on its own, but stop requests must not wait that long.
            let waited = tokio::select! {
                waited = tokio::time::timeout_at(deadline, handle.wait()) => Some(waited),
                _ = token.cancelled() => None,
            };
            match waited {
                Some(Ok(Ok(status))) => exited = Some(status),
                Some(Ok(Err(err))) => {
                    interrupt = Some(Interrupt::Stream(format!("wait failed: {err}")));
                }
                Some(Err(_)) => interrupt = Some(Interrupt::TimedOut),
                None => interrupt = Some(Interrupt::Cancelled),
            }
        }
        let (status, forced) = match exited {
            Some(status) => (Some(status), false),
            None => teardown(job, &mut handle, grace).await,
        };

        // Drain whatever the readers buffered before the pipes closed, then
        // flush: a terminal status must never race its own log tail.
        loop {
            match tokio::time::timeout(self.config.drain_timeout(), handle.next_line()).await {
                Ok(Some(line)) => {
                    let _ = writer.append_line(&line).await;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(job = %job.id, "drain window expired with output still pending");
                    break;
                }
            }
        }
        if let Err(err) = writer.sync().await {
            warn!(job = %job.id, "failed to sync job log: {err}");
        }
        if forced {
            warn!(job = %job.id, pid, "process outlived the grace window and was force-killed");
        }

        let exit_code = status.as_ref().and_then(ExitStatus::code);
        let state = match interrupt {
            Some(Interrupt::Cancelled) => TerminalState::Cancelled,
            Some(Interrupt::TimedOut) => TerminalState::TimedOut,
            Some(Interrupt::Stream(message)) => TerminalState::Error {
                message: format!("output stream error: {message}"),
            },
            None => match exit_code {
                Some(0) => TerminalState::Completed,
                Some(code) => TerminalState::Failed { exit_code: code },
                // Killed by a signal outside any teardown we initiated.
                None => TerminalState::Failed { exit_code: -1 },
            },
        };

        Execution {
            state,
            exit_code,
            pid: Some(pid),
            started_at: Some(started_at),
            log_path: Some(log_path),
        }
    }
}

async fn teardown(
    job: &Job,
    handle: &mut ProcessHandle,
    grace: Duration,
) -> (Option<ExitStatus>, bool) {
    match handle.shutdown(grace).await {
        Ok((status, forced)) => (Some(status), forced),
        Err(err) => {
            error!(job = %job.id, "teardown failed: {err}");
            (None, true)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scan::config::RunnerConfig;
    use crate::scan::registry::InMemoryRegistry;
    use oxiscan_model::ToolKind;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn quick_config() -> RunnerConfig {
        RunnerConfig {
            poll_interval_ms: 50,
            term_grace_ms: 1_000,
            drain_timeout_ms: 500,
            line_capacity: 64,
        }
    }

    async fn harness(dir: &TempDir) -> (Arc<InMemoryRegistry>, ToolRunner) {
        let registry = Arc::new(InMemoryRegistry::new());
        let logs = Arc::new(LogSink::open(dir.path().join("logs")).await.unwrap());
        let runner = ToolRunner::new(
            ProcessManager::new(),
            registry.clone(),
            logs,
            quick_config(),
        );
        (registry, runner)
    }

    fn job(tool: &str, script: &str, timeout: Duration) -> Job {
        Job::new(
            "alpha.example",
            ToolKind::Custom(tool.to_string()),
            sh(script),
            timeout,
        )
    }

    #[tokio::test]
    async fn successful_job_completes_and_registry_agrees() {
        let dir = TempDir::new().unwrap();
        let (registry, runner) = harness(&dir).await;

        let job = job("fast", "echo hello", Duration::from_secs(10));
        let id = job.id;
        let result = runner.run(job).await;

        assert_eq!(result.state, TerminalState::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.error.is_none());

        let record = registry.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.pid.is_some());
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_with_the_exit_code() {
        let dir = TempDir::new().unwrap();
        let (registry, runner) = harness(&dir).await;

        let job = job("flaky", "exit 3", Duration::from_secs(10));
        let id = job.id;
        let result = runner.run(job).await;

        assert_eq!(result.state, TerminalState::Failed { exit_code: 3 });
        assert!(result.error.is_some());
        let record = registry.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.exit_code, Some(3));
    }

    #[tokio::test]
    async fn empty_command_is_rejected_before_any_spawn() {
        let dir = TempDir::new().unwrap();
        let (registry, runner) = harness(&dir).await;

        let mut job = job("empty", "unused", Duration::from_secs(10));
        job.command.clear();
        let id = job.id;
        let result = runner.run(job).await;

        assert!(matches!(result.state, TerminalState::Error { .. }));
        let record = registry.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert!(record.pid.is_none(), "nothing may have spawned");
        assert!(record.started_at.is_none(), "job never reached running");
    }

    #[tokio::test]
    async fn slow_job_times_out_and_is_torn_down() {
        let dir = TempDir::new().unwrap();
        let (registry, runner) = harness(&dir).await;

        let job = job("slow", "sleep 30", Duration::from_millis(300));
        let id = job.id;
        let started = std::time::Instant::now();
        let result = runner.run(job).await;

        assert_eq!(result.state, TerminalState::TimedOut);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "teardown must not wait for the sleep"
        );
        let record = registry.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::TimedOut);
        let pid = record.pid.expect("job reached running");
        assert!(!crate::scan::process::pid_alive(pid));
    }

    #[tokio::test]
    async fn job_output_is_flushed_before_the_terminal_row() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let logs = Arc::new(LogSink::open(dir.path().join("logs")).await.unwrap());
        let runner = ToolRunner::new(
            ProcessManager::new(),
            registry.clone(),
            logs.clone(),
            quick_config(),
        );

        let job = job("chatty", "printf 'A\\nB\\nC\\n'", Duration::from_secs(10));
        let id = job.id;
        let result = runner.run(job).await;

        assert_eq!(result.state, TerminalState::Completed);
        let (lines, _) = logs.read_since(id, 0).await.unwrap();
        assert_eq!(lines, vec!["A", "B", "C"]);
    }
}
