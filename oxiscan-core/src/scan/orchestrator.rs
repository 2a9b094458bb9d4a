use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use oxiscan_model::{BatchId, JobId, JobStatus, TerminalState, ToolKind};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

use crate::error::{Result, ScanError};
use crate::scan::config::OrchestratorConfig;
use crate::scan::job::{
    BatchOutcome, BatchSummary, DomainOutcome, DomainScanPlan, Job, TerminalResult,
};
use crate::scan::logs::LogSink;
use crate::scan::manager::ProcessManager;
use crate::scan::registry::JobRegistry;
use crate::scan::runner::ToolRunner;

/// Fans a batch of domain scan plans out over a bounded worker pool and
/// aggregates per-domain terminal results.
///
/// One job per (domain, tool) pair, submitted in domain order then plan
/// order so runs are reproducible; workers pull jobs concurrently, so only
/// start order is deterministic. A domain's outcome is reported only once
/// every one of its jobs is terminal, and one job's failure never cancels
/// its siblings - the only thing that aborts a batch is a global stop.
#[derive(Clone, Debug)]
pub struct ScanOrchestrator {
    manager: ProcessManager,
    registry: Arc<dyn JobRegistry>,
    runner: Arc<ToolRunner>,
    config: OrchestratorConfig,
}

/// What the orchestrator remembers about each submitted job, for synthesis
/// when a worker dies without reporting.
struct SubmittedJob {
    id: JobId,
    domain: String,
    tool: ToolKind,
}

impl ScanOrchestrator {
    pub fn new(
        manager: ProcessManager,
        registry: Arc<dyn JobRegistry>,
        logs: Arc<LogSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let runner = Arc::new(ToolRunner::new(
            manager.clone(),
            registry.clone(),
            logs,
            config.runner,
        ));
        Self {
            manager,
            registry,
            runner,
            config,
        }
    }

    /// The cancellation controller shared with this orchestrator.
    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    /// Runs a batch with the configured worker pool size.
    pub async fn run_batch(&self, plans: Vec<DomainScanPlan>) -> Result<BatchOutcome> {
        self.run_batch_bounded(plans, self.config.worker_count).await
    }

    /// Runs a batch with an explicit worker pool bound.
    pub async fn run_batch_bounded(
        &self,
        plans: Vec<DomainScanPlan>,
        max_parallel_jobs: usize,
    ) -> Result<BatchOutcome> {
        if self.manager.is_halted() {
            return Err(ScanError::Halted);
        }

        let batch_id = BatchId::new();
        let started_at = Utc::now();
        let default_timeout = self.config.default_job_timeout();

        let mut domains: BTreeMap<String, DomainOutcome> = BTreeMap::new();
        let mut submitted: Vec<SubmittedJob> = Vec::new();
        let mut queue: VecDeque<Job> = VecDeque::new();

        for plan in &plans {
            if plan.tools.is_empty() {
                // Explicit marker, not an error and not a silent skip.
                domains.insert(plan.domain.clone(), DomainOutcome::NoConfiguration);
                continue;
            }
            for entry in &plan.tools {
                let job = Job::from_plan(batch_id, &plan.domain, entry, default_timeout);
                submitted.push(SubmittedJob {
                    id: job.id,
                    domain: job.domain.clone(),
                    tool: job.tool.clone(),
                });
                queue.push_back(job);
            }
        }

        let total = queue.len();
        info!(
            batch = %batch_id,
            domains = plans.len(),
            jobs = total,
            "starting scan batch"
        );

        let mut collected: HashMap<JobId, TerminalResult> = HashMap::with_capacity(total);
        if total > 0 {
            let queue = Arc::new(Mutex::new(queue));
            let (tx, mut rx) = mpsc::channel::<TerminalResult>(total);
            let workers = max_parallel_jobs.clamp(1, total);

            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let queue = Arc::clone(&queue);
                let tx = tx.clone();
                let runner = Arc::clone(&self.runner);
                handles.push(tokio::spawn(async move {
                    loop {
                        let job = { queue.lock().await.pop_front() };
                        let Some(job) = job else { break };
                        debug!(worker, job = %job.id, domain = %job.domain, tool = %job.tool, "worker picked job");
                        let result = runner.run(job).await;
                        if tx.send(result).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            drop(tx);

            while let Some(result) = rx.recv().await {
                collected.insert(result.job_id, result);
            }
            for join in join_all(handles).await {
                if let Err(err) = join {
                    error!(batch = %batch_id, "scan worker aborted: {err}");
                }
            }
        }

        // Fold results back in submission order; synthesize a terminal error
        // for any job whose worker died, so nothing is silently dropped.
        let mut summary = BatchSummary::default();
        for job in &submitted {
            let result = match collected.remove(&job.id) {
                Some(result) => result,
                None => self.synthesize_lost(job).await,
            };
            summary.record(&result.state);
            let entry = domains
                .entry(job.domain.clone())
                .or_insert_with(|| DomainOutcome::Scanned {
                    results: Vec::new(),
                });
            // A caller can submit both an empty and a populated plan for the
            // same domain; results always win over the empty marker.
            if matches!(entry, DomainOutcome::NoConfiguration) {
                *entry = DomainOutcome::Scanned {
                    results: Vec::new(),
                };
            }
            if let DomainOutcome::Scanned { results } = entry {
                results.push(result);
            }
        }

        let outcome = BatchOutcome {
            batch_id,
            domains,
            summary,
            started_at,
            completed_at: Utc::now(),
        };
        info!(
            batch = %batch_id,
            completed = summary.completed,
            failed = summary.failed,
            errored = summary.errored,
            timed_out = summary.timed_out,
            cancelled = summary.cancelled,
            "scan batch finished"
        );
        Ok(outcome)
    }

    async fn synthesize_lost(&self, job: &SubmittedJob) -> TerminalResult {
        let message = "worker terminated before the job reported".to_string();
        error!(job = %job.id, domain = %job.domain, tool = %job.tool, "{message}");

        // Leave the registry terminal even for this pathological path.
        if let Ok(Some(mut record)) = self.registry.get(job.id).await {
            if !record.status.is_terminal() {
                record.status = JobStatus::Error;
                record.error = Some(message.clone());
                record.finished_at = Some(Utc::now());
                record.touch();
                let _ = self.registry.update(record).await;
            }
        }

        TerminalResult {
            job_id: job.id,
            domain: job.domain.clone(),
            tool: job.tool.clone(),
            exit_code: None,
            error: Some(message.clone()),
            log: None,
            started_at: None,
            finished_at: Utc::now(),
            state: TerminalState::Error { message },
        }
    }
}
