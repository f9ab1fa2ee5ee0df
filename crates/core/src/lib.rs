// Core engine for the Cascade workflow orchestrator

pub mod alert;
pub mod engine;
pub mod error;
pub mod expr;
pub mod monitor;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod watcher;
pub mod workflow;

pub use types::*;
