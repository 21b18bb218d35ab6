use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::repository::{MemoryRepository, ReadingRepository, Subscription};
use crate::error::PersistenceError;
use crate::reading::{ReadingId, SensorReading};

/// Repository backed by a JSON-lines file, one persisted reading per line.
///
/// The file is only ever appended to. Queries are answered from the in-memory
/// index that is rebuilt on [`FileRepository::open`].
#[derive(Debug)]
pub struct FileRepository {
    path: PathBuf,
    index: MemoryRepository,
    /// Set after a failed append that may have left a partial line behind
    torn: Mutex<bool>,
}

impl FileRepository {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut loaded = Vec::new();
        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SensorReading>(line) {
                    Ok(reading) if reading.is_persisted() => loaded.push(reading),
                    Ok(_) => warn!(line = line_no + 1, "skipping reading without id or timestamp"),
                    Err(e) => warn!(line = line_no + 1, "skipping malformed reading: {}", e),
                }
            }
            if !content.is_empty() && !content.ends_with('\n') {
                // Terminate a torn final record so the next append starts a line of its own.
                warn!(path = %path.display(), "reading store ends mid-record, sealing it");
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
            }
        }

        info!(path = %path.display(), readings = loaded.len(), "opened reading store");
        let index = MemoryRepository::new();
        index.seed(loaded).await;

        Ok(Self {
            path,
            index,
            torn: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn append_line(path: &Path, line: &str, seal: bool) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    if seal {
        file.write_all(b"\n").await?;
    }
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

impl ReadingRepository for FileRepository {
    async fn create(&self, reading: SensorReading) -> Result<ReadingId, PersistenceError> {
        let id = ReadingId::generate();
        let reading = reading.persisted(id, Utc::now());
        let mut line = serde_json::to_string(&reading)?;
        line.push('\n');

        {
            let mut torn = self.torn.lock().await;
            let appended = append_line(&self.path, &line, *torn).await;
            *torn = appended.is_err();
            appended?;
        }

        self.index.insert(reading).await;
        Ok(id)
    }

    async fn recent(&self, n: usize) -> Result<Vec<SensorReading>, PersistenceError> {
        self.index.recent(n).await
    }

    async fn all(&self) -> Result<Vec<SensorReading>, PersistenceError> {
        self.index.all().await
    }

    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<SensorReading>, PersistenceError> {
        self.index.since(cutoff).await
    }

    async fn count(&self) -> Result<u64, PersistenceError> {
        self.index.count().await
    }

    fn subscribe<F>(&self, n: usize, callback: F) -> Subscription
    where
        F: Fn(Vec<SensorReading>) + Send + 'static,
    {
        self.index.subscribe(n, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::fixtures::reading;

    #[tokio::test]
    async fn readings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("readings.jsonl");

        let repository = FileRepository::open(&path).await.unwrap();
        let first = repository.create(reading(20.0)).await.unwrap();
        repository.create(reading(21.0)).await.unwrap();
        drop(repository);

        let reopened = FileRepository::open(&path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);
        let all = reopened.all().await.unwrap();
        assert_eq!(all[0].temperature, 21.0);
        assert_eq!(all[1].id, Some(first));
    }

    #[tokio::test]
    async fn create_after_torn_tail_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.jsonl");
        let good = reading(19.0).persisted(ReadingId::generate(), Utc::now());
        let content = format!(
            "{}\n{{\"temperature\":20.0,\"hum",
            serde_json::to_string(&good).unwrap()
        );
        tokio::fs::write(&path, content).await.unwrap();

        let repository = FileRepository::open(&path).await.unwrap();
        assert_eq!(repository.count().await.unwrap(), 1);
        let id = repository.create(reading(23.0)).await.unwrap();
        drop(repository);

        let reopened = FileRepository::open(&path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 2);
        let latest = reopened.recent(1).await.unwrap();
        assert_eq!(latest[0].id, Some(id));
        assert_eq!(latest[0].temperature, 23.0);
    }

    #[tokio::test]
    async fn append_after_failed_write_starts_a_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.jsonl");
        let repository = FileRepository::open(&path).await.unwrap();
        tokio::fs::write(&path, "{\"temperature\":20.0").await.unwrap();
        *repository.torn.lock().await = true;

        let id = repository.create(reading(24.0)).await.unwrap();
        assert!(!*repository.torn.lock().await);
        drop(repository);

        let reopened = FileRepository::open(&path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
        assert_eq!(reopened.recent(1).await.unwrap()[0].id, Some(id));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings.jsonl");
        let good = reading(19.0).persisted(ReadingId::generate(), Utc::now());
        let content = format!(
            "{}\nnot json\n{}\n",
            serde_json::to_string(&good).unwrap(),
            serde_json::to_string(&reading(5.0)).unwrap()
        );
        tokio::fs::write(&path, content).await.unwrap();

        let repository = FileRepository::open(&path).await.unwrap();
        assert_eq!(repository.count().await.unwrap(), 1);
        assert_eq!(repository.recent(10).await.unwrap()[0].temperature, 19.0);
    }
}
