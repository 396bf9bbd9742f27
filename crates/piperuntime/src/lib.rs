//! Pipeline execution runtime
//!
//! This crate provides the engine that validates node configurations into
//! layered graphs, dispatches handler references to registered backends
//! and runs each layer concurrently on a bounded worker pool.

mod executor;
mod graph;
mod registry;
mod runtime;
mod scheduler;

pub use executor::NodeExecutor;
pub use graph::{GraphPlan, PipelineGraph};
pub use registry::HandlerRegistry;
pub use runtime::{Dependencies, ExecutionResult, NodeResult, PipeRuntime, RuntimeConfig};
pub use scheduler::GraphScheduler;
