pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod retry;
pub mod validate;

pub use executor::TaskExecutor;
pub use graph::DependencyGraph;
pub use orchestrator::{load_workflow_file, load_workflow_json, Orchestrator};
pub use validate::validate;
