use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use oxiscan_model::{JobId, JobStatus, ToolKind};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, ScanError};

/// Tracks every in-flight job and holds stop signals at job, domain, and
/// global granularity.
///
/// Constructed once and passed by handle into the orchestrator and any
/// operator surface; there is deliberately no ambient global instance, so
/// tests and embedded callers can run independent managers side by side.
///
/// Cancellation state is in-memory only. After a restart the table is
/// rebuilt empty and only the durable job registry remembers what ran.
#[derive(Clone, Debug, Default)]
pub struct ProcessManager {
    state: Arc<ManagerState>,
}

#[derive(Debug, Default)]
struct ManagerState {
    jobs: DashMap<JobId, TrackedJob>,
    inflight: DashMap<(String, ToolKind), JobId>,
    halted: AtomicBool,
}

#[derive(Debug)]
struct TrackedJob {
    domain: String,
    tool: ToolKind,
    pid: Option<u32>,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    token: CancellationToken,
}

/// Snapshot of one tracked job, for operator inspection.
#[derive(Clone, Debug, Serialize)]
pub struct ActiveJob {
    pub id: JobId,
    pub domain: String,
    pub tool: ToolKind,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
}

/// Admission ticket for one job. Holds the job's cancellation token and
/// deregisters the job from the manager when dropped, which also covers
/// panic unwinds inside a runner.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    token: CancellationToken,
    _guard: JobGuard,
}

impl JobTicket {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Debug)]
struct JobGuard {
    state: Arc<ManagerState>,
    id: JobId,
    key: (String, ToolKind),
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.state.jobs.remove(&self.id);
        self.state
            .inflight
            .remove_if(&self.key, |_, owner| *owner == self.id);
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a job for execution, enforcing at most one in-flight job per
    /// (domain, tool) pair. A second submission for an occupied pair is
    /// rejected, never double-spawned.
    ///
    /// While the global stop flag is armed the ticket comes back already
    /// cancelled, so the runner settles the job as `Cancelled` without
    /// spawning anything.
    pub fn register(&self, id: JobId, domain: &str, tool: &ToolKind) -> Result<JobTicket> {
        let key = (domain.to_string(), tool.clone());
        match self.state.inflight.entry(key.clone()) {
            Entry::Occupied(_) => {
                warn!(%domain, %tool, "rejecting duplicate in-flight job");
                return Err(ScanError::DuplicateJob {
                    domain: domain.to_string(),
                    tool: tool.clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let token = CancellationToken::new();
        if self.state.halted.load(Ordering::SeqCst) {
            token.cancel();
        }
        self.state.jobs.insert(
            id,
            TrackedJob {
                domain: domain.to_string(),
                tool: tool.clone(),
                pid: None,
                status: JobStatus::Pending,
                started_at: None,
                token: token.clone(),
            },
        );
        debug!(job = %id, %domain, %tool, "registered job");
        Ok(JobTicket {
            id,
            token,
            _guard: JobGuard {
                state: self.state.clone(),
                id,
                key,
            },
        })
    }

    /// Records the spawned PID and flips the tracked job to `Running`.
    pub(crate) fn set_running(&self, id: JobId, pid: u32) {
        if let Some(mut job) = self.state.jobs.get_mut(&id) {
            job.pid = Some(pid);
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        }
    }

    /// Initiates termination of one job. Returns `false` when the job is
    /// unknown or already terminal, in which case nothing is mutated.
    pub fn stop_job(&self, id: JobId) -> bool {
        match self.state.jobs.get(&id) {
            Some(job) => {
                info!(job = %id, domain = %job.domain, tool = %job.tool, "stop requested");
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops every tracked job for `domain`; returns how many were signalled.
    pub fn stop_domain(&self, domain: &str) -> usize {
        let mut stopped = 0;
        for entry in self.state.jobs.iter() {
            if entry.value().domain == domain {
                entry.value().token.cancel();
                stopped += 1;
            }
        }
        info!(%domain, stopped, "domain stop requested");
        stopped
    }

    /// Arms the global stop flag and stops every tracked job.
    ///
    /// Safe to call with nothing running: the flag still arms, and new
    /// batches are refused until [`ProcessManager::reset`]. The flag never
    /// clears implicitly.
    pub fn stop_all(&self) -> usize {
        self.state.halted.store(true, Ordering::SeqCst);
        let mut stopped = 0;
        for entry in self.state.jobs.iter() {
            entry.value().token.cancel();
            stopped += 1;
        }
        info!(stopped, "global stop requested");
        stopped
    }

    /// Clears the global stop flag so fresh batches can be submitted. The
    /// only way to un-arm it.
    pub fn reset(&self) {
        self.state.halted.store(false, Ordering::SeqCst);
        info!("global stop flag cleared");
    }

    pub fn is_halted(&self) -> bool {
        self.state.halted.load(Ordering::SeqCst)
    }

    /// Snapshot of currently tracked jobs, ordered by domain then tool.
    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = self
            .state
            .jobs
            .iter()
            .map(|entry| {
                let job = entry.value();
                ActiveJob {
                    id: *entry.key(),
                    domain: job.domain.clone(),
                    tool: job.tool.clone(),
                    pid: job.pid,
                    status: job.status,
                    started_at: job.started_at,
                }
            })
            .collect();
        jobs.sort_by(|a, b| (&a.domain, &a.tool).cmp(&(&b.domain, &b.tool)));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_rejected_until_release() {
        let manager = ProcessManager::new();
        let tool = ToolKind::NetworkScan;

        let ticket = manager
            .register(JobId::new(), "alpha.example", &tool)
            .unwrap();
        let err = manager
            .register(JobId::new(), "alpha.example", &tool)
            .unwrap_err();
        assert!(matches!(err, ScanError::DuplicateJob { .. }));

        // Same tool against a different domain is fine.
        manager
            .register(JobId::new(), "beta.example", &tool)
            .unwrap();

        drop(ticket);
        manager
            .register(JobId::new(), "alpha.example", &tool)
            .unwrap();
    }

    #[test]
    fn stop_job_on_unknown_id_is_a_noop() {
        let manager = ProcessManager::new();
        assert!(!manager.stop_job(JobId::new()));
        assert!(!manager.stop_job(JobId::new()));
    }

    #[test]
    fn stop_all_arms_the_flag_even_when_idle() {
        let manager = ProcessManager::new();
        assert_eq!(manager.stop_all(), 0);
        assert!(manager.is_halted());

        // Jobs admitted while halted come back pre-cancelled.
        let ticket = manager
            .register(JobId::new(), "alpha.example", &ToolKind::XssTest)
            .unwrap();
        assert!(ticket.token().is_cancelled());

        manager.reset();
        assert!(!manager.is_halted());
        let ticket = manager
            .register(JobId::new(), "beta.example", &ToolKind::XssTest)
            .unwrap();
        assert!(!ticket.token().is_cancelled());
    }

    #[test]
    fn stop_domain_only_signals_that_domain() {
        let manager = ProcessManager::new();
        let alpha = manager
            .register(JobId::new(), "alpha.example", &ToolKind::NetworkScan)
            .unwrap();
        let alpha_xss = manager
            .register(JobId::new(), "alpha.example", &ToolKind::XssTest)
            .unwrap();
        let beta = manager
            .register(JobId::new(), "beta.example", &ToolKind::NetworkScan)
            .unwrap();

        assert_eq!(manager.stop_domain("alpha.example"), 2);
        assert!(alpha.token().is_cancelled());
        assert!(alpha_xss.token().is_cancelled());
        assert!(!beta.token().is_cancelled());
    }

    #[test]
    fn snapshot_reflects_registered_jobs() {
        let manager = ProcessManager::new();
        let id = JobId::new();
        let _ticket = manager
            .register(id, "alpha.example", &ToolKind::SqlInjection)
            .unwrap();
        manager.set_running(id, 4242);

        let jobs = manager.active_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].pid, Some(4242));
        assert_eq!(jobs[0].status, JobStatus::Running);
    }
}
