//! Execution history persistence. The engine writes every finished
//! execution through an `ExecutionStore`; the memory and redb backends
//! share one contract.

mod memory;
mod redb;

pub use memory::MemoryExecutionStore;
pub use redb::RedbExecutionStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ExecutionId, WorkflowExecution};

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<WorkflowExecution>>;

    async fn all_executions(&self) -> Result<Vec<WorkflowExecution>>;

    async fn executions_for_workflow(&self, workflow: &str) -> Result<Vec<WorkflowExecution>>;

    /// Most recent first.
    async fn recent_executions(&self, limit: usize) -> Result<Vec<WorkflowExecution>>;
}
