//! Core abstractions for the pipeline engine
//!
//! Node configuration, execution records, the result store contract and
//! the handler/generator/interaction traits. Everything the runtime and
//! backend crates share lives here.

mod config;
mod error;
pub mod events;
mod handler;
mod record;
mod store;

pub use config::{
    GenerationConfig, NodeConfig, NodeKind, NodeVariant, Operation, PipelineFile,
    ProcessingConfig, DEFAULT_INPUT_HANDLER, DEFAULT_OUTPUT_HANDLER,
    DEFAULT_SYSTEM_PROMPT_HANDLER, DEFAULT_USER_PROMPT_HANDLER, NATIVE_PREFIX, RESERVED_ROOT_ID,
    TRANSIENT_CONTEXT_KEY,
};
pub use error::{ConfigError, NodeError, PipeError, StoreError, Violation};
pub use events::*;
pub use handler::{Generator, Handler, HandlerContext, Interaction, NoGenerator, NoInteraction};
pub use record::{DataMap, ExecutionState, IterationPath, StepData};
pub use store::{InMemoryStore, ResultStore};

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipeError>;
