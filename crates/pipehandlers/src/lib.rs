//! Handler backends
//!
//! The native in-process backend with its default handlers, and an
//! OpenAI-compatible generation backend.

mod native;
mod openai;

pub use native::{
    default_input_handler, default_output_handler, render_prompt, Callback, NativeHandler,
    DATAS_KEY, DATA_KEY, INPUT_TEXT_KEY,
};
pub use openai::OpenAiGenerator;
use piperuntime::HandlerRegistry;

use std::sync::Arc;

/// Register every built-in backend with a registry
pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(NativeHandler::new()));
}
