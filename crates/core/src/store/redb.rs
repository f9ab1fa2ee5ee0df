use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use crate::types::{ExecutionId, WorkflowExecution};

use super::ExecutionStore;

const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");

/// Durable execution store backed by an embedded redb database. Rows are
/// JSON-encoded executions keyed by execution id.
pub struct RedbExecutionStore {
    db: Database,
}

impl RedbExecutionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())
            .with_context(|| format!("failed to open database at {}", path.as_ref().display()))?;

        // create the table so first reads see an empty store, not an error
        let txn = db.begin_write().context("failed to begin write")?;
        txn.open_table(EXECUTIONS)
            .context("failed to open executions table")?;
        txn.commit().context("failed to commit table creation")?;

        Ok(Self { db })
    }

    fn load_all(&self) -> Result<Vec<WorkflowExecution>> {
        let txn = self.db.begin_read().context("failed to begin read")?;
        let table = txn
            .open_table(EXECUTIONS)
            .context("failed to open executions table")?;

        let mut executions = Vec::new();
        for entry in table.iter().context("failed to iterate executions")? {
            let (_, value) = entry.context("failed to read execution row")?;
            let execution: WorkflowExecution = serde_json::from_slice(value.value())
                .context("failed to decode execution row")?;
            executions.push(execution);
        }
        executions.sort_by_key(|e| e.started_at);
        Ok(executions)
    }
}

#[async_trait]
impl ExecutionStore for RedbExecutionStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let key = execution.id.to_string();
        let value = serde_json::to_vec(execution).context("failed to encode execution")?;

        let txn = self.db.begin_write().context("failed to begin write")?;
        {
            let mut table = txn
                .open_table(EXECUTIONS)
                .context("failed to open executions table")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("failed to insert execution")?;
        }
        txn.commit().context("failed to commit execution")?;
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        let txn = self.db.begin_read().context("failed to begin read")?;
        let table = txn
            .open_table(EXECUTIONS)
            .context("failed to open executions table")?;

        match table
            .get(id.to_string().as_str())
            .context("failed to read execution")?
        {
            Some(value) => {
                let execution = serde_json::from_slice(value.value())
                    .context("failed to decode execution row")?;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    async fn all_executions(&self) -> Result<Vec<WorkflowExecution>> {
        self.load_all()
    }

    async fn executions_for_workflow(&self, workflow: &str) -> Result<Vec<WorkflowExecution>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|e| e.workflow == workflow)
            .collect())
    }

    async fn recent_executions(&self, limit: usize) -> Result<Vec<WorkflowExecution>> {
        let mut all = self.load_all()?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> RedbExecutionStore {
        RedbExecutionStore::open(dir.path().join("cascade.redb")).unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let mut execution = WorkflowExecution::started("ci");
        execution.finish(ExecutionStatus::Failed);
        store.save_execution(&execution).await.unwrap();

        let fetched = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, execution.id);
        assert_eq!(fetched.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut execution = WorkflowExecution::started("ci");
        execution.finish(ExecutionStatus::Completed);

        {
            let store = open_store(&dir);
            store.save_execution(&execution).await.unwrap();
        }

        let store = open_store(&dir);
        let all = store.all_executions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, execution.id);
    }

    #[tokio::test]
    async fn test_empty_store_reads_cleanly() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(store.all_executions().await.unwrap().is_empty());
        assert!(store.recent_executions(10).await.unwrap().is_empty());
    }
}
