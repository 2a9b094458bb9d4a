//! oxiscan-core: concurrent orchestration of external security-scan
//! processes.
//!
//! The crate fans a batch of target domains out over a bounded worker pool,
//! one OS process per (domain, tool) pair, and supervises every process from
//! spawn to terminal state: output lines stream into per-job append-only
//! logs, lifecycle state lands in a durable job registry, and stop requests
//! at job, domain, or global scope tear processes down with a
//! terminate-then-kill sequence.
#![allow(missing_docs)]

pub mod error;
pub mod scan;

pub use error::{Result, ScanError};
pub use oxiscan_model::{BatchId, JobId, JobStatus, TerminalState, ToolKind};
pub use scan::catalog::ToolCatalog;
pub use scan::config::{OrchestratorConfig, RunnerConfig};
pub use scan::job::{
    BatchOutcome, BatchSummary, DomainOutcome, DomainScanPlan, Job, JobRecord, TerminalResult,
    ToolCommand,
};
pub use scan::logs::{JobLogWriter, LogSink};
pub use scan::manager::{ActiveJob, ProcessManager};
pub use scan::orchestrator::ScanOrchestrator;
pub use scan::registry::{InMemoryRegistry, JobRegistry, JsonlRegistry, job_status, reconcile};
pub use scan::runner::ToolRunner;
