use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use oxiscan_model::{BatchId, JobId, JobStatus};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::scan::job::JobRecord;
use crate::scan::process::pid_alive;

/// Durable store of job identity and lifecycle state.
///
/// The registry is the source of truth an operator (or a restarted service)
/// consults to learn what was running; runners write a row before a process
/// spawns and always leave it in a terminal state.
#[async_trait]
pub trait JobRegistry: Send + Sync + std::fmt::Debug {
    /// Inserts or replaces the row for `record.id`.
    async fn insert(&self, record: JobRecord) -> Result<()>;

    /// Replaces the row for `record.id`.
    async fn update(&self, record: JobRecord) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Every row, ordered by creation time for reproducible listings.
    async fn all(&self) -> Result<Vec<JobRecord>>;

    async fn remove(&self, id: JobId) -> Result<bool>;

    /// Drops every row belonging to `batch` once the caller has folded the
    /// batch results into its own store. Returns how many rows went away.
    async fn remove_batch(&self, batch: BatchId) -> Result<usize>;

    async fn running(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|record| record.status == JobStatus::Running)
            .collect())
    }
}

fn sorted(mut rows: Vec<JobRecord>) -> Vec<JobRecord> {
    rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    rows
}

/// Volatile registry for tests and embedded callers that persist elsewhere.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    rows: DashMap<JobId, JobRecord>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for InMemoryRegistry {
    async fn insert(&self, record: JobRecord) -> Result<()> {
        self.rows.insert(record.id, record);
        Ok(())
    }

    async fn update(&self, record: JobRecord) -> Result<()> {
        self.rows.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.rows.get(&id).map(|row| row.clone()))
    }

    async fn all(&self) -> Result<Vec<JobRecord>> {
        Ok(sorted(
            self.rows.iter().map(|row| row.value().clone()).collect(),
        ))
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        Ok(self.rows.remove(&id).is_some())
    }

    async fn remove_batch(&self, batch: BatchId) -> Result<usize> {
        let ids: Vec<JobId> = self
            .rows
            .iter()
            .filter(|row| row.value().batch == Some(batch))
            .map(|row| *row.key())
            .collect();
        for id in &ids {
            self.rows.remove(id);
        }
        Ok(ids.len())
    }
}

/// File-backed registry: one JSON document per line, replayed on open with
/// last-write-wins per job id.
///
/// Appends survive a crash mid-batch; a torn trailing line from an abrupt
/// shutdown is skipped on replay. Removals compact the file in place.
#[derive(Debug)]
pub struct JsonlRegistry {
    path: PathBuf,
    rows: DashMap<JobId, JobRecord>,
    io: Mutex<()>,
}

impl JsonlRegistry {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let rows = DashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines().filter(|line| !line.trim().is_empty()) {
                    match serde_json::from_str::<JobRecord>(line) {
                        Ok(record) => {
                            rows.insert(record.id, record);
                        }
                        Err(err) => {
                            warn!(path = %path.display(), "skipping corrupt registry line: {err}");
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        debug!(path = %path.display(), rows = rows.len(), "opened job registry");
        Ok(Self {
            path,
            rows,
            io: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn append(&self, record: &JobRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.io.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Rewrites the file from the live row set, dropping superseded lines.
    pub async fn compact(&self) -> Result<()> {
        let rows = sorted(self.rows.iter().map(|row| row.value().clone()).collect());
        let mut contents = String::new();
        for record in &rows {
            contents.push_str(&serde_json::to_string(record)?);
            contents.push('\n');
        }
        let _guard = self.io.lock().await;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}

#[async_trait]
impl JobRegistry for JsonlRegistry {
    async fn insert(&self, record: JobRecord) -> Result<()> {
        self.append(&record).await?;
        self.rows.insert(record.id, record);
        Ok(())
    }

    async fn update(&self, record: JobRecord) -> Result<()> {
        self.append(&record).await?;
        self.rows.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.rows.get(&id).map(|row| row.clone()))
    }

    async fn all(&self) -> Result<Vec<JobRecord>> {
        Ok(sorted(
            self.rows.iter().map(|row| row.value().clone()).collect(),
        ))
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        let removed = self.rows.remove(&id).is_some();
        if removed {
            self.compact().await?;
        }
        Ok(removed)
    }

    async fn remove_batch(&self, batch: BatchId) -> Result<usize> {
        let ids: Vec<JobId> = self
            .rows
            .iter()
            .filter(|row| row.value().batch == Some(batch))
            .map(|row| *row.key())
            .collect();
        for id in &ids {
            self.rows.remove(id);
        }
        if !ids.is_empty() {
            self.compact().await?;
        }
        Ok(ids.len())
    }
}

fn mark_interrupted(record: &mut JobRecord) {
    record.status = JobStatus::Error;
    record.error = Some("interrupted: process no longer running".to_string());
    record.finished_at = Some(Utc::now());
    record.touch();
}

/// Repairs rows left `Running` by a crashed or killed orchestrator.
///
/// In-memory cancellation state does not survive a restart, so any running
/// row whose PID is gone is marked as interrupted. Returns the repaired job
/// ids.
pub async fn reconcile(registry: &dyn JobRegistry) -> Result<Vec<JobId>> {
    let mut repaired = Vec::new();
    for mut record in registry.running().await? {
        let alive = record.pid.map(pid_alive).unwrap_or(false);
        if alive {
            continue;
        }
        warn!(
            job = %record.id,
            domain = %record.domain,
            tool = %record.tool,
            "reconciling stale running job"
        );
        mark_interrupted(&mut record);
        repaired.push(record.id);
        registry.update(record).await?;
    }
    Ok(repaired)
}

/// Registry row for `id`, cross-checked against the live process table.
///
/// A row still marked `Running` whose recorded PID is gone is repaired to a
/// terminal state before being returned, so status queries never report a
/// process that no longer exists.
pub async fn job_status(registry: &dyn JobRegistry, id: JobId) -> Result<Option<JobRecord>> {
    let Some(record) = registry.get(id).await? else {
        return Ok(None);
    };
    if record.status == JobStatus::Running && !record.pid.map(pid_alive).unwrap_or(false) {
        warn!(job = %record.id, domain = %record.domain, "running row has no live process");
        let mut repaired = record;
        mark_interrupted(&mut repaired);
        registry.update(repaired.clone()).await?;
        return Ok(Some(repaired));
    }
    Ok(Some(record))
}
