use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{OutcomeStore, StepOutcome};
use crate::error::StoreError;

/// Local filesystem implementation of OutcomeStore
///
/// Each step is written to a hidden temp file in the chain directory, synced,
/// then hard-linked to its final name. The link fails if that name exists, so
/// a step file is either absent or complete, and duplicate appends are
/// rejected without touching the recorded step.
/// Directory structure:
///   {base_dir}/chains/{chain_id}/{step_number:04}.json
pub struct LocalOutcomeStore {
    base_dir: PathBuf,
}

impl LocalOutcomeStore {
    /// Create a new LocalOutcomeStore with the given base directory
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the chain directory path
    fn chain_dir(&self, chain_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !chain_id.is_empty()
            && chain_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidChainId(chain_id.to_string()));
        }
        Ok(self.base_dir.join("chains").join(chain_id))
    }
}

/// Write `contents` to `temp_path`, sync it, and link it in as `step_path`
async fn publish(temp_path: &Path, step_path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp_path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::hard_link(temp_path, step_path).await
}

#[async_trait]
impl OutcomeStore for LocalOutcomeStore {
    async fn append_step_outcome(&self, outcome: &StepOutcome) -> Result<(), StoreError> {
        let chain_dir = self.chain_dir(&outcome.chain_id)?;
        fs::create_dir_all(&chain_dir).await?;

        let json = serde_json::to_string_pretty(outcome)?;
        let step_path = chain_dir.join(format!("{:04}.json", outcome.step_number));
        let temp_path = chain_dir.join(format!(
            ".{:04}.{}.tmp",
            outcome.step_number,
            Uuid::new_v4()
        ));

        let published = publish(&temp_path, &step_path, json.as_bytes()).await;
        // Drop the temp name on every path; only the linked name is a step
        let _ = fs::remove_file(&temp_path).await;

        match published {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(StoreError::DuplicateStep {
                chain_id: outcome.chain_id.clone(),
                step_number: outcome.step_number,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_chain(&self, chain_id: &str) -> Result<Vec<StepOutcome>, StoreError> {
        let chain_dir = self.chain_dir(chain_id)?;

        if !fs::try_exists(&chain_dir).await? {
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::new();
        let mut entries = fs::read_dir(&chain_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path).await?;
            let outcome: StepOutcome = serde_json::from_str(&contents)?;
            if outcome.chain_id != chain_id {
                return Err(StoreError::Corrupt(format!(
                    "{} belongs to chain {}",
                    path.display(),
                    outcome.chain_id
                )));
            }
            outcomes.push(outcome);
        }

        outcomes.sort_by_key(|outcome| outcome.step_number);
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StepStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn outcome(chain_id: &str, step_number: u32) -> StepOutcome {
        let now = Utc::now();
        StepOutcome {
            task_id: uuid::Uuid::new_v4().to_string(),
            chain_id: chain_id.to_string(),
            step_number,
            prompt: format!("prompt {step_number}"),
            response: Some(format!("response {step_number}")),
            status: StepStatus::Success,
            error_message: None,
            created_at: now,
            completed_at: now,
            execution_time_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_append_and_list_in_step_order() {
        let dir = TempDir::new().unwrap();
        let store = LocalOutcomeStore::new(dir.path().to_path_buf());

        for step in [2, 1, 3] {
            store
                .append_step_outcome(&outcome("chain-a", step))
                .await
                .unwrap();
        }
        store
            .append_step_outcome(&outcome("chain-b", 1))
            .await
            .unwrap();

        let listed = store.list_chain("chain-a").await.unwrap();
        let steps: Vec<u32> = listed.iter().map(|o| o.step_number).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert_eq!(listed[0].response.as_deref(), Some("response 1"));

        assert_eq!(store.list_chain("chain-b").await.unwrap().len(), 1);
        assert!(store.list_chain("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_step_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalOutcomeStore::new(dir.path().to_path_buf());
        let first = outcome("chain-a", 1);

        store.append_step_outcome(&first).await.unwrap();
        let err = store
            .append_step_outcome(&outcome("chain-a", 1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::DuplicateStep { step_number: 1, .. }
        ));
        let listed = store.list_chain("chain-a").await.unwrap();
        assert_eq!(listed, vec![first]);
    }

    #[tokio::test]
    async fn test_chain_id_cannot_escape_base_dir() {
        let dir = TempDir::new().unwrap();
        let store = LocalOutcomeStore::new(dir.path().to_path_buf());

        let err = store
            .append_step_outcome(&outcome("../escape", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidChainId(_)));
    }

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn test_appends_leave_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = LocalOutcomeStore::new(dir.path().to_path_buf());
        let chain_dir = dir.path().join("chains/chain-a");

        store.append_step_outcome(&outcome("chain-a", 1)).await.unwrap();
        assert!(temp_files(&chain_dir).is_empty());

        // A rejected duplicate cleans up after itself too
        store
            .append_step_outcome(&outcome("chain-a", 1))
            .await
            .unwrap_err();
        assert!(temp_files(&chain_dir).is_empty());
        assert_eq!(std::fs::read_dir(&chain_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_write_does_not_claim_step() {
        let dir = TempDir::new().unwrap();
        let store = LocalOutcomeStore::new(dir.path().to_path_buf());
        let chain_dir = dir.path().join("chains/chain-a");

        // A write cut off before its link leaves only a truncated temp file
        std::fs::create_dir_all(&chain_dir).unwrap();
        std::fs::write(chain_dir.join(".0001.dead.tmp"), r#"{"task_id": "#).unwrap();

        assert!(store.list_chain("chain-a").await.unwrap().is_empty());

        let first = outcome("chain-a", 1);
        store.append_step_outcome(&first).await.unwrap();
        assert_eq!(store.list_chain("chain-a").await.unwrap(), vec![first]);
    }
}
