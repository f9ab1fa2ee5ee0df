use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{ExecutionId, WorkflowExecution};

use super::ExecutionStore;

/// In-memory execution store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn all_executions(&self) -> Result<Vec<WorkflowExecution>> {
        let mut all: Vec<_> = self.executions.read().await.values().cloned().collect();
        all.sort_by_key(|e| e.started_at);
        Ok(all)
    }

    async fn executions_for_workflow(&self, workflow: &str) -> Result<Vec<WorkflowExecution>> {
        let mut matching: Vec<_> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.workflow == workflow)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.started_at);
        Ok(matching)
    }

    async fn recent_executions(&self, limit: usize) -> Result<Vec<WorkflowExecution>> {
        let mut all = self.all_executions().await?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;

    #[tokio::test]
    async fn test_save_and_fetch_roundtrip() {
        let store = MemoryExecutionStore::new();
        let mut execution = WorkflowExecution::started("ci");
        execution.finish(ExecutionStatus::Completed);
        store.save_execution(&execution).await.unwrap();

        let fetched = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(fetched.workflow, "ci");
        assert_eq!(fetched.status, ExecutionStatus::Completed);
        assert!(store
            .get_execution(ExecutionId::new())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = MemoryExecutionStore::new();
        for _ in 0..3 {
            let mut execution = WorkflowExecution::started("ci");
            execution.finish(ExecutionStatus::Completed);
            store.save_execution(&execution).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let recent = store.recent_executions(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].started_at >= recent[1].started_at);
    }

    #[tokio::test]
    async fn test_filter_by_workflow() {
        let store = MemoryExecutionStore::new();
        let mut a = WorkflowExecution::started("a");
        a.finish(ExecutionStatus::Completed);
        let mut b = WorkflowExecution::started("b");
        b.finish(ExecutionStatus::Failed);
        store.save_execution(&a).await.unwrap();
        store.save_execution(&b).await.unwrap();

        let only_a = store.executions_for_workflow("a").await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].workflow, "a");
    }
}
