//! File-backed result mailbox using JSON lines for durability.
//!
//! Outcomes are appended one per line to `<dir>/<stream>_outcomes.jsonl` and
//! loaded back into memory on open. Purging rewrites the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::mailbox::Mailbox;
use crate::core::message::TaskOutcome;
use crate::core::BackendError;
use crate::util::serde::TaskId;

/// Mailbox persisted to a JSON-lines file.
#[derive(Debug)]
pub struct FileMailbox {
    file_path: PathBuf,
    outcomes: Mutex<HashMap<TaskId, TaskOutcome>>,
}

fn io_error(path: &Path, err: &std::io::Error) -> BackendError {
    BackendError::Transient(format!("{}: {err}", path.display()))
}

impl FileMailbox {
    /// Open the mailbox for `stream` under `dir`, loading existing outcomes.
    ///
    /// # Errors
    ///
    /// `BackendError::Transient` on I/O failure, `BackendError::Rejected` if
    /// the file holds an undecodable line.
    pub async fn open(dir: impl AsRef<Path>, stream: &str) -> Result<Self, BackendError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| io_error(dir, &e))?;
        let file_path = dir.join(format!("{stream}_outcomes.jsonl"));

        let mut outcomes = HashMap::new();
        match tokio::fs::read_to_string(&file_path).await {
            Ok(contents) => {
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    let outcome: TaskOutcome = serde_json::from_str(line).map_err(|e| {
                        BackendError::Rejected(format!("{}: {e}", file_path.display()))
                    })?;
                    outcomes.entry(outcome.task_id.clone()).or_insert(outcome);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&file_path, &e)),
        }
        tracing::debug!(path = %file_path.display(), loaded = outcomes.len(), "file mailbox opened");

        Ok(Self {
            file_path,
            outcomes: Mutex::new(outcomes),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    async fn append(&self, outcome: &TaskOutcome) -> Result<(), BackendError> {
        let mut line = serde_json::to_string(outcome)
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .await
            .map_err(|e| io_error(&self.file_path, &e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_error(&self.file_path, &e))?;
        file.flush().await.map_err(|e| io_error(&self.file_path, &e))
    }
}

#[async_trait]
impl Mailbox for FileMailbox {
    async fn deliver(&self, outcome: TaskOutcome) -> Result<bool, BackendError> {
        let mut outcomes = self.outcomes.lock().await;
        if outcomes.contains_key(&outcome.task_id) {
            return Ok(false);
        }
        self.append(&outcome).await?;
        outcomes.insert(outcome.task_id.clone(), outcome);
        Ok(true)
    }

    async fn fetch(&self, task_id: &TaskId) -> Result<Option<TaskOutcome>, BackendError> {
        Ok(self.outcomes.lock().await.get(task_id).cloned())
    }

    async fn purge(&self, finished_before_ms: u128) -> Result<usize, BackendError> {
        let mut outcomes = self.outcomes.lock().await;
        let before = outcomes.len();
        outcomes.retain(|_, outcome| outcome.finished_at_ms >= finished_before_ms);
        let removed = before - outcomes.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut contents = String::new();
        for outcome in outcomes.values() {
            let line = serde_json::to_string(outcome)
                .map_err(|e| BackendError::Rejected(e.to_string()))?;
            contents.push_str(&line);
            contents.push('\n');
        }
        let tmp = self.file_path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| io_error(&tmp, &e))?;
        tokio::fs::rename(&tmp, &self.file_path)
            .await
            .map_err(|e| io_error(&self.file_path, &e))?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::OutcomeStatus;

    fn outcome(task: &str, finished_at_ms: u128) -> TaskOutcome {
        TaskOutcome {
            task_id: task.into(),
            logical_key: format!("key-{task}").into(),
            status: OutcomeStatus::Completed,
            result_ref: Some(format!("results/key-{task}/attempt-1")),
            attempt: 1,
            finished_at_ms,
        }
    }

    #[tokio::test]
    async fn outcomes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mailbox = FileMailbox::open(dir.path(), "relay").await.unwrap();
            assert!(mailbox.deliver(outcome("a", 1)).await.unwrap());
            assert!(!mailbox.deliver(outcome("a", 2)).await.unwrap());
        }
        let reopened = FileMailbox::open(dir.path(), "relay").await.unwrap();
        let stored = reopened.fetch(&"a".into()).await.unwrap().unwrap();
        assert_eq!(stored.finished_at_ms, 1);
    }

    #[tokio::test]
    async fn purge_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = FileMailbox::open(dir.path(), "relay").await.unwrap();
        mailbox.deliver(outcome("old", 1)).await.unwrap();
        mailbox.deliver(outcome("new", 100)).await.unwrap();
        assert_eq!(mailbox.purge(50).await.unwrap(), 1);

        let reopened = FileMailbox::open(dir.path(), "relay").await.unwrap();
        assert!(reopened.fetch(&"old".into()).await.unwrap().is_none());
        assert!(reopened.fetch(&"new".into()).await.unwrap().is_some());
    }
}
