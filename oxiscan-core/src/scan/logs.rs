use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use oxiscan_model::JobId;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::Result;

/// Append-only, per-job log store with byte-offset tailing.
///
/// Each job owns one file under the sink directory; lines are appended in
/// arrival order and readers tail with [`LogSink::read_since`] without
/// re-reading from the start. Writes go through a per-job lock only; streams
/// for different jobs never contend.
#[derive(Debug)]
pub struct LogSink {
    dir: PathBuf,
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl LogSink {
    /// Opens (creating if needed) a log directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    pub fn path_for(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    /// Dedicated writer for a job's log, used by the runner that owns the
    /// job. Admission dedupe guarantees a single writer per job.
    pub async fn writer(&self, id: JobId) -> Result<JobLogWriter> {
        let path = self.path_for(id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(JobLogWriter { path, file })
    }

    /// Appends one line outside a runner context (tests, manual notes).
    pub async fn append(&self, id: JobId, line: &str) -> Result<()> {
        let lock = self.locks.entry(id).or_default().clone();
        let _guard = lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Complete lines appended since `offset`, plus the cursor to pass next
    /// time. A partially written trailing line is left unconsumed, so the
    /// returned offset always lands on a line boundary.
    pub async fn read_since(&self, id: JobId, offset: u64) -> Result<(Vec<String>, u64)> {
        let path = self.path_for(id);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), offset));
            }
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let mut lines = Vec::new();
        let mut consumed = 0usize;
        for (index, byte) in buf.iter().enumerate() {
            if *byte == b'\n' {
                lines.push(String::from_utf8_lossy(&buf[consumed..index]).into_owned());
                consumed = index + 1;
            }
        }
        Ok((lines, offset + consumed as u64))
    }
}

/// Owned append handle for one job's log file.
///
/// Every line is flushed as it lands so concurrent tailers observe output
/// while the job is still running.
#[derive(Debug)]
pub struct JobLogWriter {
    path: PathBuf,
    file: File,
}

impl JobLogWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append_line(&mut self, line: &str) -> Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Final drain barrier: flushes and syncs file data before the owning
    /// job's terminal status is recorded.
    pub async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lines_come_back_in_append_order() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open(dir.path()).await.unwrap();
        let id = JobId::new();

        for line in ["A", "B", "C"] {
            sink.append(id, line).await.unwrap();
        }

        let (lines, offset) = sink.read_since(id, 0).await.unwrap();
        assert_eq!(lines, vec!["A", "B", "C"]);
        assert_eq!(offset, 6);
    }

    #[tokio::test]
    async fn tailing_resumes_from_the_returned_offset() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open(dir.path()).await.unwrap();
        let id = JobId::new();

        sink.append(id, "A").await.unwrap();
        let (first, after_a) = sink.read_since(id, 0).await.unwrap();
        assert_eq!(first, vec!["A"]);

        sink.append(id, "B").await.unwrap();
        sink.append(id, "C").await.unwrap();
        let (rest, offset) = sink.read_since(id, after_a).await.unwrap();
        assert_eq!(rest, vec!["B", "C"]);

        let (empty, same) = sink.read_since(id, offset).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(same, offset);
    }

    #[tokio::test]
    async fn missing_log_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open(dir.path()).await.unwrap();
        let (lines, offset) = sink.read_since(JobId::new(), 0).await.unwrap();
        assert!(lines.is_empty());
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn partial_trailing_line_is_not_consumed() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open(dir.path()).await.unwrap();
        let id = JobId::new();

        sink.append(id, "complete").await.unwrap();
        // Simulate a torn write with no trailing newline.
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(sink.path_for(id))
                .unwrap();
            file.write_all(b"torn").unwrap();
        }

        let (lines, offset) = sink.read_since(id, 0).await.unwrap();
        assert_eq!(lines, vec!["complete"]);
        assert_eq!(offset, "complete\n".len() as u64);
    }

    #[tokio::test]
    async fn writer_appends_visible_to_tailers() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::open(dir.path()).await.unwrap();
        let id = JobId::new();

        let mut writer = sink.writer(id).await.unwrap();
        writer.append_line("live").await.unwrap();

        let (lines, _) = sink.read_since(id, 0).await.unwrap();
        assert_eq!(lines, vec!["live"]);
        writer.sync().await.unwrap();
    }
}
